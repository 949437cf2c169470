//! tgspyder: Telegram OSINT collector
//!
//! This library provides:
//! - Member, message and invite-link collection from groups and channels
//! - Pacing, cooldown handling and bounded retries against the API
//! - Checkpoints so an interrupted run resumes without duplicate rows
//! - User and sticker pack lookups
//! - CSV output and Prometheus metrics

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod invites;
pub mod metrics;
pub mod model;
pub mod proxy;
pub mod session;
pub mod sink;
pub mod target;
pub mod telegram;

// Re-export common types
pub use client::{ApiClient, PageKind};
pub use config::{CollectorSettings, Config, StoredSettings};
pub use engine::{CollectionPipeline, Job, RunReport};
pub use error::{ApiError, Error, FailureKind, Result};
pub use session::{check_session_exists, get_client, SessionLock};

// Commands module uses re-exported types, so it must be declared after the re-exports
pub mod commands;
