//! Cursor-driven paging over a remote listing.
//!
//! [`CursorPager`] turns a stateful paginated call into a sequence of batches,
//! one page at a time. Every fetch goes through the shared [`RateLimiter`] and
//! is bounded by the request timeout. Transient failures retry the same cursor;
//! the cursor only moves after a page is returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::backoff::RetryPolicy;
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ApiError, Error, Result};
use crate::metrics;

/// Where to resume in a paginated listing.
///
/// `token` is opaque to the engine; `None` means "from the beginning".
/// `seq` counts pages consumed and only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCursor {
    pub token: Option<String>,
    pub seq: u64,
}

impl CollectionCursor {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn is_start(&self) -> bool {
        self.token.is_none() && self.seq == 0
    }

    fn advance(&self, token: Option<String>) -> Self {
        Self {
            token,
            seq: self.seq + 1,
        }
    }
}

/// One page as returned by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    /// The source moved past an exhausted sub-listing without reading
    /// items. Such a page never counts as an empty page.
    pub skipped: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self {
            items,
            next_cursor,
            skipped: false,
        }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }

    /// No items, but the listing continues at `next_cursor`.
    pub fn skip(next_cursor: String) -> Self {
        Self {
            items: Vec::new(),
            next_cursor: Some(next_cursor),
            skipped: true,
        }
    }
}

/// A single paginated listing.
#[async_trait]
pub trait PageSource: Send {
    type Item: Send;

    async fn fetch(&mut self, cursor: Option<&str>) -> std::result::Result<Page<Self::Item>, ApiError>;
}

/// Items of one page plus the cursor that resumes right after them.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub cursor_after: CollectionCursor,
}

#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Cooldowns longer than this end the run instead of waiting.
    pub max_flood_wait: Duration,
    /// Label used in logs and errors.
    pub target: String,
    /// Metrics label.
    pub mode: &'static str,
}

pub struct CursorPager<S: PageSource> {
    source: S,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    options: PagerOptions,
    cursor: CollectionCursor,
    empty_streak: u8,
    finished: bool,
    rng: StdRng,
    pages: u64,
    retries: u64,
}

impl<S: PageSource> CursorPager<S> {
    pub fn new(
        source: S,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
        options: PagerOptions,
        start: CollectionCursor,
    ) -> Self {
        Self {
            source,
            limiter,
            cancel,
            options,
            cursor: start,
            empty_streak: 0,
            finished: false,
            rng: StdRng::from_entropy(),
            pages: 0,
            retries: 0,
        }
    }

    /// Last cursor whose page was returned. On error this is still the
    /// last good position.
    pub fn cursor(&self) -> &CollectionCursor {
        &self.cursor
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetch the next page. `Ok(None)` once the listing is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Batch<S::Item>>> {
        if self.finished {
            return Ok(None);
        }

        let page = self.fetch_with_retry().await?;
        self.pages += 1;

        if page.skipped {
            debug!(chat = %self.options.target, "source skipped ahead");
        } else if page.items.is_empty() {
            self.empty_streak += 1;
            if self.empty_streak >= 2 {
                debug!(chat = %self.options.target, "two empty pages in a row, stopping");
                self.finished = true;
                return Ok(None);
            }
        } else {
            self.empty_streak = 0;
        }

        let current = self.cursor.token.clone();
        match &page.next_cursor {
            None => self.finished = true,
            Some(next) if current.as_deref() == Some(next.as_str()) => {
                warn!(
                    chat = %self.options.target,
                    cursor = %next,
                    "cursor did not advance, stopping"
                );
                self.finished = true;
            }
            Some(_) => {}
        }

        // The last page keeps its own token so a resume re-reads it.
        let token = if self.finished {
            current
        } else {
            page.next_cursor
        };
        self.cursor = self.cursor.advance(token);

        Ok(Some(Batch {
            items: page.items,
            cursor_after: self.cursor.clone(),
        }))
    }

    async fn fetch_with_retry(&mut self) -> Result<Page<S::Item>> {
        let mut backoff = self.options.retry.start();
        let mode = self.options.mode;

        loop {
            self.limiter.acquire(&self.cancel).await?;

            let token = self.cursor.token.clone();
            let result = tokio::select! {
                fetched = tokio::time::timeout(
                    self.options.request_timeout,
                    self.source.fetch(token.as_deref()),
                ) => fetched.unwrap_or(Err(ApiError::Timeout)),
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };

            let err = match result {
                Ok(page) => {
                    metrics::record_api_call(mode, "ok");
                    return Ok(page);
                }
                Err(err) => err,
            };

            match err {
                ApiError::FloodWait(wait) => {
                    metrics::record_api_call(mode, "flood_wait");
                    metrics::record_flood_wait(wait);
                    if wait > self.options.max_flood_wait || !backoff.spend() {
                        return Err(Error::RateLimited {
                            target: self.options.target.clone(),
                            wait_secs: wait.as_secs(),
                        });
                    }
                    self.retries += 1;
                    warn!(
                        chat = %self.options.target,
                        wait_secs = wait.as_secs(),
                        attempt = backoff.attempts(),
                        "flood wait, cooling down"
                    );
                    self.limiter.note_cooldown(wait);
                }
                err if err.is_transient() => {
                    metrics::record_api_call(mode, "transient");
                    let Some(delay) = backoff.next_delay(&mut self.rng) else {
                        return Err(Error::RetriesExhausted {
                            target: self.options.target.clone(),
                            attempts: backoff.attempts(),
                            last_error: err.to_string(),
                        });
                    };
                    self.retries += 1;
                    warn!(
                        chat = %self.options.target,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        attempt = backoff.attempts(),
                        "transient error, retrying same cursor"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                err => {
                    metrics::record_api_call(mode, "error");
                    return Err(Error::from_api(&self.options.target, err));
                }
            }
        }
    }
}
