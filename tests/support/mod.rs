//! Scripted fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tgspyder::engine::{
    CollectionPipeline, MemoryResumeStore, Page, RateLimiter, RetryPolicy,
};
use tgspyder::model::{RawItem, RawMember, RawMessage, RawSender, StickerPackInfo, UserProfile};
use tgspyder::sink::{MemorySink, OutputSink};
use tgspyder::target::{Target, TargetKind, TargetRef};
use tgspyder::{ApiClient, ApiError, CollectorSettings, PageKind, Result};

type Response = std::result::Result<Page<RawItem>, ApiError>;

/// One `fetch_page` call as seen by the fake.
#[derive(Debug, Clone)]
pub struct Call {
    pub target_id: i64,
    pub kind: PageKind,
    pub cursor: Option<String>,
    pub at: Instant,
}

/// Answers from scripts keyed by (target, listing, cursor). The last
/// response for a cursor repeats once earlier ones are used up.
#[derive(Default)]
pub struct FakeClient {
    targets: HashMap<String, std::result::Result<Target, ApiError>>,
    scripts: Mutex<HashMap<(i64, PageKind, Option<String>), VecDeque<Response>>>,
    users: HashMap<String, UserProfile>,
    sticker_sets: HashMap<String, StickerPackInfo>,
    calls: Mutex<Vec<Call>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, raw: &str, target: Target) -> Self {
        self.targets.insert(ref_key(raw), Ok(target));
        self
    }

    pub fn with_unresolvable(mut self, raw: &str, err: ApiError) -> Self {
        self.targets.insert(ref_key(raw), Err(err));
        self
    }

    pub fn with_user(mut self, raw: &str, profile: UserProfile) -> Self {
        self.users.insert(ref_key(raw), profile);
        self
    }

    pub fn with_sticker_set(mut self, pack: StickerPackInfo) -> Self {
        self.sticker_sets.insert(pack.short_name.clone(), pack);
        self
    }

    pub fn respond(&self, target: &Target, kind: PageKind, cursor: Option<&str>, response: Response) {
        self.scripts
            .lock()
            .unwrap()
            .entry((target.id(), kind, cursor.map(str::to_string)))
            .or_default()
            .push_back(response);
    }

    /// Script a listing as consecutive pages chained by cursors `p1`, `p2`, ...
    pub fn pages(&self, target: &Target, kind: PageKind, pages: Vec<Vec<RawItem>>) {
        let count = pages.len();
        for (i, items) in pages.into_iter().enumerate() {
            let cursor = (i > 0).then(|| format!("p{}", i));
            let next = (i + 1 < count).then(|| format!("p{}", i + 1));
            self.respond(target, kind, cursor.as_deref(), Ok(Page::new(items, next)));
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

fn ref_key(raw: &str) -> String {
    TargetRef::parse(raw)
        .map(|r| r.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

#[async_trait]
impl ApiClient for FakeClient {
    async fn resolve_target(&self, reference: &TargetRef) -> std::result::Result<Target, ApiError> {
        self.targets
            .get(&reference.to_string())
            .cloned()
            .unwrap_or_else(|| Err(ApiError::NotFound(reference.to_string())))
    }

    async fn fetch_page(
        &self,
        target: &Target,
        kind: PageKind,
        cursor: Option<&str>,
        _limit: usize,
    ) -> Response {
        self.calls.lock().unwrap().push(Call {
            target_id: target.id(),
            kind,
            cursor: cursor.map(str::to_string),
            at: Instant::now(),
        });

        let mut scripts = self.scripts.lock().unwrap();
        let key = (target.id(), kind, cursor.map(str::to_string));
        match scripts.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ApiError::Malformed("empty script".into()))),
            None => Err(ApiError::NotVisible(format!(
                "no listing for {} at {:?}",
                target.key(),
                cursor
            ))),
        }
    }

    async fn lookup_user(
        &self,
        reference: &TargetRef,
    ) -> std::result::Result<Option<UserProfile>, ApiError> {
        Ok(self.users.get(&reference.to_string()).cloned())
    }

    async fn lookup_sticker_set(
        &self,
        short_name: &str,
    ) -> std::result::Result<Option<StickerPackInfo>, ApiError> {
        Ok(self.sticker_sets.get(short_name).cloned())
    }
}

/// Cancels a token once the wrapped sink has flushed `after` batches.
pub struct CancellingSink {
    pub inner: Arc<MemorySink>,
    pub cancel: CancellationToken,
    pub after: u64,
}

impl OutputSink for CancellingSink {
    fn write_row(
        &self,
        mode: tgspyder::model::CollectionMode,
        target: &Target,
        row: Vec<String>,
    ) -> Result<()> {
        self.inner.write_row(mode, target, row)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()?;
        if self.inner.flush_count() >= self.after {
            self.cancel.cancel();
        }
        Ok(())
    }
}

pub fn group(id: i64, title: &str) -> Target {
    Target::new(format!("@{}", title.to_lowercase()), id, TargetKind::Group, title)
}

pub fn members(ids: std::ops::Range<i64>) -> Vec<RawItem> {
    ids.map(|id| {
        RawItem::Member(RawMember {
            id: Some(id),
            username: Some(format!("user{}", id)),
            first_name: Some(format!("First{}", id)),
            last_name: None,
            phone: None,
        })
    })
    .collect()
}

pub fn message(id: i64, text: &str) -> RawItem {
    RawItem::Message(RawMessage {
        id: Some(id),
        date: DateTime::from_timestamp(1_700_000_000 + id, 0),
        text: Some(text.to_string()),
        media: None,
        sender: Some(RawSender {
            id: 42,
            username: Some("poster".to_string()),
            first_name: None,
            last_name: None,
        }),
    })
}

pub fn settings() -> CollectorSettings {
    CollectorSettings {
        min_spacing: Duration::from_millis(100),
        page_size: 50,
        request_timeout: Duration::from_secs(30),
        max_flood_wait: Duration::from_secs(3600),
        aggressive_members: false,
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        },
    }
}

pub struct Harness {
    pub client: Arc<FakeClient>,
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<MemoryResumeStore>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new(client: FakeClient) -> Self {
        Self {
            client: Arc::new(client),
            limiter: Arc::new(RateLimiter::new(settings().min_spacing)),
            store: Arc::new(MemoryResumeStore::new()),
            sink: Arc::new(MemorySink::new()),
        }
    }

    pub fn pipeline(&self, cancel: CancellationToken) -> CollectionPipeline {
        self.pipeline_with_sink(self.sink.clone(), cancel)
    }

    pub fn pipeline_with_sink(
        &self,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> CollectionPipeline {
        CollectionPipeline::new(
            self.client.clone(),
            self.limiter.clone(),
            self.store.clone(),
            sink,
            settings(),
            cancel,
        )
    }
}
