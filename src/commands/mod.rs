//! Command implementations
//!
//! Each module backs one group of CLI flags. Setup shared by every command
//! that talks to Telegram lives here.

pub mod collect;
pub mod lookup;
pub mod proxy;
pub mod sticker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, StoredSettings};
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{Error, Result};
use crate::proxy::{parse_proxy, ProxyConfig};
use crate::session::{get_client, require_direct_transport, SessionLock};
use crate::telegram::GrammersClient;

pub use collect::{exit_code, print_summary, run_targets, CollectRequest};
pub use lookup::lookup_user;
pub use sticker::lookup_sticker_pack;

/// One step of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetProxy(String),
    RemoveProxy,
    LookupUser(String),
    StickerPack(String),
    Collect(CollectRequest),
}

/// Everything requested on one command line.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub set_proxy: Option<String>,
    pub remove_proxy: bool,
    pub user: Option<String>,
    pub sticker_pack: Option<String>,
    pub collect: CollectRequest,
}

impl Invocation {
    /// Requested steps in run order: proxy update, user lookup, sticker
    /// pack, then target collection. Collection is left out only when no
    /// targets were given.
    pub fn actions(self) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if let Some(raw) = self.set_proxy {
            actions.push(Action::SetProxy(raw));
        }
        if self.remove_proxy {
            actions.push(Action::RemoveProxy);
        }
        if let Some(raw) = self.user {
            actions.push(Action::LookupUser(raw));
        }
        if let Some(raw) = self.sticker_pack {
            actions.push(Action::StickerPack(raw));
        }

        if self.collect.targets.is_empty() {
            if actions.is_empty() {
                return Err(Error::InvalidArgument("no targets given".to_string()));
            }
        } else if self.collect.jobs().is_empty() {
            return Err(Error::InvalidArgument(
                "choose at least one of --members, --chats, --crawl-invites".to_string(),
            ));
        } else {
            actions.push(Action::Collect(self.collect));
        }
        Ok(actions)
    }
}

/// Process exit code for an error that ended a step.
pub fn error_exit_code(err: &Error) -> i32 {
    match err {
        Error::Cancelled => 130,
        err if err.is_fatal() => 2,
        _ => 1,
    }
}

/// Worst of two step exit codes: cancelled, then fatal, then failed.
pub fn combine_exit_codes(a: i32, b: i32) -> i32 {
    fn rank(code: i32) -> u8 {
        match code {
            0 => 0,
            130 => 3,
            2 => 2,
            _ => 1,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

/// Everything a command needs to reach Telegram. The lock is held for the
/// lifetime of the session.
pub struct Session {
    pub client: Arc<GrammersClient>,
    pub limiter: Arc<RateLimiter>,
    _lock: SessionLock,
}

/// A one-off `--proxy` wins over the stored one.
pub fn effective_proxy(
    override_proxy: Option<&str>,
    stored: &StoredSettings,
) -> Result<Option<ProxyConfig>> {
    match override_proxy {
        Some(raw) => parse_proxy(raw),
        None => match stored.proxy.as_deref() {
            Some(raw) => parse_proxy(raw),
            None => Ok(None),
        },
    }
}

/// Validate credentials, lock the session and connect.
pub async fn open_session(
    config: &Config,
    override_proxy: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Session> {
    let stored = StoredSettings::load_from(&StoredSettings::default_path()?)?;
    let (api_id, _api_hash) = config.credentials(&stored)?;
    let proxy = effective_proxy(override_proxy, &stored)?;
    require_direct_transport(proxy.as_ref())?;

    let lock = SessionLock::acquire(&config.lock_file)?;
    let telegram = get_client(&config.session_name, api_id, proxy.as_ref()).await?;

    let limiter = Arc::new(RateLimiter::new(config.collector.min_spacing));
    let client = Arc::new(GrammersClient::new(
        telegram,
        limiter.clone(),
        cancel.clone(),
        config.collector.aggressive_members,
    ));

    Ok(Session {
        client,
        limiter,
        _lock: lock,
    })
}
