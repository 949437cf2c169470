//! Error types for the collector
//!
//! Two layers: [`ApiError`] is what the platform client surfaces for a single
//! call, [`Error`] is what the engine and commands return.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by a single call to the remote API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("flood wait requested for {}s", .0.as_secs())]
    FloodWait(Duration),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("not visible: {0}")]
    NotVisible(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Transient errors are retried by the pager; everything else fails the target.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::FloodWait(_) | ApiError::Timeout | ApiError::Network(_)
        )
    }

    /// Classify an RPC error by its name as reported by the server.
    ///
    /// `value` carries the numeric suffix the server attaches to names like
    /// `FLOOD_WAIT_30`.
    pub fn from_rpc(code: i32, name: &str, value: Option<u32>) -> Self {
        match name {
            "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT" | "FLOOD_TEST_PHONE_WAIT" => {
                ApiError::FloodWait(Duration::from_secs(u64::from(value.unwrap_or(1))))
            }
            "TIMEOUT" | "RPC_CALL_FAIL" | "RPC_MCGET_FAIL" | "WORKER_BUSY_TOO_LONG_RETRY" => {
                ApiError::Timeout
            }
            "CHANNEL_PRIVATE"
            | "CHANNEL_INVALID"
            | "CHAT_ADMIN_REQUIRED"
            | "CHAT_FORBIDDEN"
            | "CHAT_WRITE_FORBIDDEN"
            | "USER_BANNED_IN_CHANNEL"
            | "INVITE_HASH_EXPIRED"
            | "INVITE_REQUEST_SENT"
            | "CHANNELS_TOO_MUCH" => ApiError::NotVisible(name.to_string()),
            "USERNAME_NOT_OCCUPIED"
            | "USERNAME_INVALID"
            | "INVITE_HASH_INVALID"
            | "INVITE_HASH_EMPTY"
            | "PEER_ID_INVALID"
            | "STICKERSET_INVALID"
            | "USER_ID_INVALID" => ApiError::NotFound(name.to_string()),
            _ if code == 420 => ApiError::FloodWait(Duration::from_secs(u64::from(
                value.unwrap_or(1),
            ))),
            _ if code == 403 => ApiError::NotVisible(name.to_string()),
            _ if code >= 500 || code < 0 => ApiError::Network(format!("{} ({})", name, code)),
            _ => ApiError::Malformed(format!("{} ({})", name, code)),
        }
    }
}

/// Extract flood wait seconds from an error string (best-effort).
///
/// Used when only the rendered error text is available.
pub fn parse_flood_wait_seconds(error: &str) -> Option<u64> {
    for marker in ["FLOOD_WAIT_", "SLOWMODE_WAIT_"] {
        if let Some(idx) = error.find(marker) {
            let start = idx + marker.len();
            let secs = error[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>();
            if let Ok(v) = secs.parse::<u64>() {
                return Some(v);
            }
        }
    }

    if error.contains("FLOOD_WAIT") {
        if let Some(idx) = error.find("value:") {
            let start = idx + "value:".len();
            let secs = error[start..]
                .trim_start()
                .trim_start_matches("Some(")
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>();
            if let Ok(v) = secs.parse::<u64>() {
                return Some(v);
            }
        }
    }

    None
}

impl From<grammers_client::InvocationError> for ApiError {
    fn from(err: grammers_client::InvocationError) -> Self {
        match err {
            grammers_client::InvocationError::Rpc(rpc) => {
                ApiError::from_rpc(rpc.code, &rpc.name, rpc.value)
            }
            grammers_client::InvocationError::Io(io) => ApiError::Network(io.to_string()),
            other => {
                let text = other.to_string();
                match parse_flood_wait_seconds(&text) {
                    Some(secs) => ApiError::FloodWait(Duration::from_secs(secs)),
                    None => ApiError::Network(text),
                }
            }
        }
    }
}

/// How a per-target run failed, for the end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotVisible,
    NotFound,
    RateLimited,
    RetriesExhausted,
    Malformed,
    Cancelled,
    Fatal,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::NotVisible => "not visible",
            FailureKind::NotFound => "not found",
            FailureKind::RateLimited => "rate-limited, gave up",
            FailureKind::RetriesExhausted => "network retries exhausted",
            FailureKind::Malformed => "malformed response",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Fatal => "fatal",
        }
    }

    /// Suggested follow-up for an investigator.
    pub fn hint(&self) -> &'static str {
        match self {
            FailureKind::NotVisible => {
                "the account cannot see this target; join it or use an account with access"
            }
            FailureKind::NotFound => "check the reference; the target does not resolve",
            FailureKind::RateLimited => {
                "the platform asked for a long cooldown; rerun later to resume from the checkpoint"
            }
            FailureKind::RetriesExhausted => {
                "the network kept failing; rerun to resume from the checkpoint"
            }
            FailureKind::Malformed => "the platform returned data the collector cannot read",
            FailureKind::Cancelled => "stopped on request; rerun to resume from the checkpoint",
            FailureKind::Fatal => "fix the configuration and rerun",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session file not found: {0}")]
    SessionNotFound(String),

    #[error("Session is locked by another process")]
    SessionLocked,

    #[error("Failed to acquire session lock: {0}")]
    LockError(String),

    #[error("Telegram API error: {0}")]
    TelegramError(String),

    #[error("Target '{target}' is not visible: {reason}")]
    TargetNotVisible { target: String, reason: String },

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Gave up on '{target}' after a {wait_secs}s cooldown request")]
    RateLimited { target: String, wait_secs: u64 },

    #[error("Gave up on '{target}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Malformed response for '{target}': {detail}")]
    MalformedResponse { target: String, detail: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),

    #[error("Missing API credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Output error: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authorization required")]
    AuthorizationRequired,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Lift an API error into a per-target error.
    pub fn from_api(target: &str, err: ApiError) -> Self {
        match err {
            ApiError::NotVisible(reason) => Error::TargetNotVisible {
                target: target.to_string(),
                reason,
            },
            ApiError::NotFound(reason) => Error::TargetNotFound(format!("{}: {}", target, reason)),
            ApiError::Malformed(detail) => Error::MalformedResponse {
                target: target.to_string(),
                detail,
            },
            ApiError::FloodWait(wait) => Error::RateLimited {
                target: target.to_string(),
                wait_secs: wait.as_secs(),
            },
            ApiError::Timeout | ApiError::Network(_) => Error::RetriesExhausted {
                target: target.to_string(),
                attempts: 1,
                last_error: err.to_string(),
            },
        }
    }

    /// Errors that abort the whole invocation before any pipeline starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SessionNotFound(_)
                | Error::SessionLocked
                | Error::LockError(_)
                | Error::CheckpointStore(_)
                | Error::MissingCredentials(_)
                | Error::InvalidProxy(_)
                | Error::Config(_)
                | Error::AuthorizationRequired
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::TargetNotVisible { .. } => FailureKind::NotVisible,
            Error::TargetNotFound(_) | Error::InvalidArgument(_) => FailureKind::NotFound,
            Error::RateLimited { .. } => FailureKind::RateLimited,
            Error::RetriesExhausted { .. } | Error::ConnectionError(_) => {
                FailureKind::RetriesExhausted
            }
            Error::MalformedResponse { .. } | Error::SerializationError(_) => {
                FailureKind::Malformed
            }
            Error::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Fatal,
        }
    }
}

impl From<grammers_client::InvocationError> for Error {
    fn from(err: grammers_client::InvocationError) -> Self {
        Error::TelegramError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Output(err.to_string())
    }
}
