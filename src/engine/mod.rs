//! Collection engine: pacing, paging, dedup, checkpoints and the pipeline
//! that ties them together.

pub mod backoff;
pub mod checkpoint;
pub mod dedup;
pub mod pager;
pub mod pipeline;
pub mod rate_limiter;

pub use backoff::{Backoff, RetryPolicy};
pub use checkpoint::{FileResumeStore, MemoryResumeStore, ResumeStore, RunCheckpoint};
pub use dedup::{Deduplicator, IdentityKey, SeenSet};
pub use pager::{Batch, CollectionCursor, CursorPager, Page, PageSource, PagerOptions};
pub use pipeline::{CollectionPipeline, Job, Outcome, RunReport};
pub use rate_limiter::RateLimiter;
