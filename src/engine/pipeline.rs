//! Per-(target, job) collection run.
//!
//! Init → Paging → Filtering → Transforming → Flushing, repeated per batch,
//! ending in Done (checkpoint cleared) or Failed (checkpoint kept at the last
//! flushed batch). Rows that were flushed before a failure stay in the output.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ApiClient, PageKind};
use crate::config::CollectorSettings;
use crate::engine::checkpoint::{ResumeStore, RunCheckpoint};
use crate::engine::dedup::{Deduplicator, IdentityKey};
use crate::engine::pager::{CollectionCursor, CursorPager, Page, PageSource, PagerOptions};
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ApiError, Error, Result};
use crate::invites::extract_invite_links;
use crate::metrics;
use crate::model::{transform, CollectedEntity, CollectionMode, RawItem};
use crate::sink::OutputSink;
use crate::target::{Target, TargetRef};

/// What to collect from a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Members,
    /// One pass over the history feeding the messages and/or invite-link outputs.
    History {
        save_messages: bool,
        crawl_invites: bool,
    },
}

impl Job {
    /// Checkpoint key. History keys include the enabled outputs, since a run
    /// with a different output set has different seen-sets.
    pub fn key(&self) -> String {
        match self {
            Job::Members => "members".to_string(),
            Job::History {
                save_messages,
                crawl_invites,
            } => {
                let mut key = String::from("history");
                if *save_messages {
                    key.push_str("_messages");
                }
                if *crawl_invites {
                    key.push_str("_invites");
                }
                key
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Job::Members => "members",
            Job::History { .. } => "history",
        }
    }

    fn page_kind(&self) -> PageKind {
        match self {
            Job::Members => PageKind::Members,
            Job::History { .. } => PageKind::History,
        }
    }

    fn writes(&self, mode: CollectionMode) -> bool {
        match (self, mode) {
            (Job::Members, CollectionMode::Members) => true,
            (Job::History { save_messages, .. }, CollectionMode::Messages) => *save_messages,
            (Job::History { crawl_invites, .. }, CollectionMode::InviteLinks) => *crawl_invites,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Done,
    Failed(Error),
}

/// Summary of one run.
#[derive(Debug)]
pub struct RunReport {
    pub target: String,
    pub job: Job,
    pub resumed: bool,
    pub pages: u64,
    pub batches_flushed: u64,
    pub rows_written: u64,
    pub invite_links_written: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub outcome: Outcome,
}

impl RunReport {
    fn new(target: &str, job: Job) -> Self {
        Self {
            target: target.to_string(),
            job,
            resumed: false,
            pages: 0,
            batches_flushed: 0,
            rows_written: 0,
            invite_links_written: 0,
            duplicates: 0,
            malformed: 0,
            outcome: Outcome::Done,
        }
    }

    /// A run that ended before any paging, e.g. on a resolve failure.
    pub fn failed(target: &str, job: Job, err: Error) -> Self {
        let mut report = Self::new(target, job);
        report.outcome = Outcome::Failed(err);
        report
    }

    pub fn is_done(&self) -> bool {
        matches!(self.outcome, Outcome::Done)
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Done => None,
            Outcome::Failed(err) => Some(err),
        }
    }
}

/// Adapts one listing of an [`ApiClient`] to the pager.
struct ApiPageSource {
    client: Arc<dyn ApiClient>,
    target: Target,
    kind: PageKind,
    limit: usize,
}

#[async_trait]
impl PageSource for ApiPageSource {
    type Item = RawItem;

    async fn fetch(&mut self, cursor: Option<&str>) -> std::result::Result<Page<RawItem>, ApiError> {
        self.client
            .fetch_page(&self.target, self.kind, cursor, self.limit)
            .await
    }
}

/// Shared wiring for every run in one invocation.
pub struct CollectionPipeline {
    client: Arc<dyn ApiClient>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn ResumeStore>,
    sink: Arc<dyn OutputSink>,
    settings: CollectorSettings,
    cancel: CancellationToken,
}

impl CollectionPipeline {
    pub fn new(
        client: Arc<dyn ApiClient>,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn ResumeStore>,
        sink: Arc<dyn OutputSink>,
        settings: CollectorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            limiter,
            store,
            sink,
            settings,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve a raw reference through the rate limiter. Cooldowns and
    /// transient errors are retried like page fetches.
    pub async fn resolve(&self, raw: &str) -> Result<Target> {
        let reference = TargetRef::parse(raw)?;
        let mut backoff = self.settings.retry.start();
        let mut rng = StdRng::from_entropy();

        let target = loop {
            self.limiter.acquire(&self.cancel).await?;
            let resolved = tokio::select! {
                r = tokio::time::timeout(
                    self.settings.request_timeout,
                    self.client.resolve_target(&reference),
                ) => r.unwrap_or(Err(ApiError::Timeout)),
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };

            match resolved {
                Ok(target) => break target,
                Err(ApiError::FloodWait(wait))
                    if wait <= self.settings.max_flood_wait && backoff.spend() =>
                {
                    warn!(reference = raw, wait_secs = wait.as_secs(), "flood wait while resolving");
                    metrics::record_flood_wait(wait);
                    self.limiter.note_cooldown(wait);
                }
                Err(err) if err.is_transient() && !matches!(err, ApiError::FloodWait(_)) => {
                    let Some(delay) = backoff.next_delay(&mut rng) else {
                        return Err(Error::RetriesExhausted {
                            target: raw.to_string(),
                            attempts: backoff.attempts(),
                            last_error: err.to_string(),
                        });
                    };
                    warn!(reference = raw, error = %err, delay_ms = delay.as_millis() as u64, "retrying resolve");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                Err(err) => return Err(Error::from_api(raw, err)),
            }
        };

        info!(
            reference = raw,
            id = target.id(),
            kind = %target.kind(),
            title = target.title(),
            "target resolved"
        );
        Ok(target)
    }

    /// Drop any saved progress for this (target, job).
    pub fn reset(&self, target: &Target, job: Job) -> Result<()> {
        self.store.clear(&target.key(), &job.key())
    }

    /// Resolve then run.
    pub async fn run(&self, raw: &str, job: Job) -> RunReport {
        match self.resolve(raw).await {
            Ok(target) => self.run_resolved(&target, job).await,
            Err(err) => RunReport::failed(raw, job, err),
        }
    }

    pub async fn run_resolved(&self, target: &Target, job: Job) -> RunReport {
        let started = Instant::now();
        metrics::record_pipeline_start(job.label());

        let mut report = RunReport::new(target.reference(), job);
        let result = self.collect(target, job, &mut report).await;

        let outcome_label = match &result {
            Ok(()) => {
                info!(
                    target_key = %target.key(),
                    job = %job.key(),
                    rows = report.rows_written,
                    invite_links = report.invite_links_written,
                    duplicates = report.duplicates,
                    malformed = report.malformed,
                    "collection done"
                );
                "done"
            }
            Err(Error::Cancelled) => {
                info!(target_key = %target.key(), job = %job.key(), "collection cancelled");
                "cancelled"
            }
            Err(err) => {
                warn!(target_key = %target.key(), job = %job.key(), error = %err, "collection failed");
                "failed"
            }
        };
        metrics::record_pipeline_result(job.label(), started.elapsed(), outcome_label);

        if let Err(err) = result {
            report.outcome = Outcome::Failed(err);
        }
        report
    }

    async fn collect(&self, target: &Target, job: Job, report: &mut RunReport) -> Result<()> {
        // Init
        let target_key = target.key();
        let job_key = job.key();
        let checkpoint = self.store.load(&target_key, &job_key)?;

        let (start, mut dedup, mut invite_dedup, mut rows_total) = match checkpoint {
            Some(cp) => {
                info!(
                    target_key = %target_key,
                    job = %job_key,
                    seq = cp.cursor.seq,
                    seen = cp.seen.len(),
                    rows = cp.rows_written,
                    "resuming from checkpoint"
                );
                report.resumed = true;
                (
                    cp.cursor,
                    Deduplicator::from_snapshot(cp.seen),
                    Deduplicator::from_snapshot(cp.invite_seen),
                    cp.rows_written,
                )
            }
            None => (
                CollectionCursor::start(),
                Deduplicator::new(),
                Deduplicator::new(),
                0,
            ),
        };

        let source = ApiPageSource {
            client: self.client.clone(),
            target: target.clone(),
            kind: job.page_kind(),
            limit: self.settings.page_size,
        };
        let options = PagerOptions {
            retry: self.settings.retry.clone(),
            request_timeout: self.settings.request_timeout,
            max_flood_wait: self.settings.max_flood_wait,
            target: target.reference().to_string(),
            mode: job.label(),
        };
        let mut pager = CursorPager::new(
            source,
            self.limiter.clone(),
            self.cancel.clone(),
            options,
            start,
        );

        let crawl_invites = job.writes(CollectionMode::InviteLinks);

        loop {
            // Paging
            let batch = pager.next_batch().await;
            report.pages = pager.pages();
            let Some(batch) = batch? else {
                break;
            };

            let dup_before = dedup.duplicates() + invite_dedup.duplicates();
            let mut rows: Vec<CollectedEntity> = Vec::with_capacity(batch.items.len());

            for item in batch.items {
                // Filtering
                let Some(key) = item.identity_key() else {
                    warn!(target_key = %target_key, "item without identity skipped");
                    report.malformed += 1;
                    metrics::record_malformed(job.label());
                    continue;
                };

                // Transforming. A key is only marked seen once its item is
                // usable, so a later well-formed copy still gets through.
                let entity = match transform(item, target.title()) {
                    Ok(entity) => entity,
                    Err(reason) => {
                        warn!(target_key = %target_key, key = %key, reason = %reason, "malformed item skipped");
                        report.malformed += 1;
                        metrics::record_malformed(job.label());
                        continue;
                    }
                };
                if !dedup.observe(&key) {
                    continue;
                }

                let mut links = Vec::new();
                if crawl_invites {
                    if let CollectedEntity::Message(message) = &entity {
                        for candidate in extract_invite_links(&message.text) {
                            match candidate.parsed {
                                Ok(link) => {
                                    let link_key = IdentityKey::Link(link.key().to_string());
                                    if invite_dedup.observe(&link_key) {
                                        links.push(CollectedEntity::InviteLink(link));
                                    }
                                }
                                Err(reason) => {
                                    warn!(
                                        target_key = %target_key,
                                        message_id = message.id,
                                        link = %candidate.raw,
                                        reason = %reason,
                                        "malformed invite link skipped"
                                    );
                                    report.malformed += 1;
                                    metrics::record_malformed(CollectionMode::InviteLinks.label());
                                }
                            }
                        }
                    }
                }

                if job.writes(entity.mode()) {
                    rows.push(entity);
                }
                rows.extend(links);
            }

            let dup_in_batch = dedup.duplicates() + invite_dedup.duplicates() - dup_before;
            report.duplicates += dup_in_batch;
            if dup_in_batch > 0 {
                metrics::record_duplicates(job.label(), dup_in_batch);
            }

            // A stop request before the flush discards the whole batch.
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Flushing
            let mut written = 0u64;
            for entity in rows {
                let mode = entity.mode();
                self.sink.write_row(mode, target, entity.to_row())?;
                metrics::record_rows(mode.label(), 1);
                if mode == CollectionMode::InviteLinks {
                    report.invite_links_written += 1;
                } else {
                    report.rows_written += 1;
                }
                written += 1;
            }
            self.sink.flush()?;
            rows_total += written;
            report.batches_flushed += 1;

            self.store.save(&RunCheckpoint {
                target_key: target_key.clone(),
                job_key: job_key.clone(),
                cursor: batch.cursor_after.clone(),
                seen: dedup.snapshot(),
                invite_seen: invite_dedup.snapshot(),
                rows_written: rows_total,
                updated_at: Utc::now(),
            })?;

            debug!(
                target_key = %target_key,
                seq = batch.cursor_after.seq,
                rows = written,
                total = rows_total,
                "batch flushed"
            );
        }

        // Done
        self.store.clear(&target_key, &job_key)?;
        Ok(())
    }
}
