//! Single user lookup (`--user`).

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::ApiClient;
use crate::config::Config;
use crate::engine::rate_limiter::RateLimiter;
use crate::error::{ApiError, Error, Result};
use crate::metrics;
use crate::model::{CollectedEntity, CollectionMode, UserProfile};
use crate::sink::{CsvSink, OutputSink};
use crate::target::{Target, TargetKind, TargetRef};

use super::open_session;

/// Resolve a user by `@name`, name or numeric id.
pub async fn lookup_user(
    client: &dyn ApiClient,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
    raw: &str,
) -> Result<Option<UserProfile>> {
    let reference = TargetRef::parse(raw)?;
    if matches!(reference, TargetRef::Invite(_)) {
        return Err(Error::InvalidArgument(format!(
            "'{}' is an invite link, not a user",
            raw
        )));
    }

    limiter.acquire(cancel).await?;
    let mode = CollectionMode::Users.label();
    match client.lookup_user(&reference).await {
        Ok(profile) => {
            metrics::record_api_call(mode, "ok");
            Ok(profile)
        }
        Err(err) => {
            if let ApiError::FloodWait(wait) = &err {
                metrics::record_flood_wait(*wait);
                limiter.note_cooldown(*wait);
            }
            metrics::record_api_call(mode, "error");
            Err(Error::from_api(raw, err))
        }
    }
}

/// Write the profile as one row under `users/`.
pub fn write_profile(sink: &dyn OutputSink, raw: &str, profile: &UserProfile) -> Result<()> {
    let target = Target::new(raw, profile.id, TargetKind::User, profile.id.to_string());
    let entity = CollectedEntity::UserProfile(profile.clone());
    sink.write_row(entity.mode(), &target, entity.to_row())?;
    sink.flush()
}

pub fn print_profile(profile: &UserProfile) {
    println!("User ID:      {}", profile.id);
    println!(
        "Username:     {}",
        profile
            .username
            .as_deref()
            .map(|u| format!("@{}", u))
            .unwrap_or_else(|| "-".to_string())
    );
    let name = profile.full_name();
    println!("Name:         {}", if name.is_empty() { "-" } else { &name });
    println!("Phone:        {}", profile.phone.as_deref().unwrap_or("-"));
    if let Some(link) = profile.profile_link() {
        println!("Profile link: {}", link);
    }
}

pub async fn run(
    config: &Config,
    raw: &str,
    proxy: Option<&str>,
    cancel: CancellationToken,
) -> Result<()> {
    let session = open_session(config, proxy, &cancel).await?;
    let profile = lookup_user(session.client.as_ref(), &session.limiter, &cancel, raw)
        .await?
        .ok_or_else(|| Error::TargetNotFound(format!("{} is not a user", raw)))?;

    print_profile(&profile);
    let sink = CsvSink::new(&config.output_dir);
    write_profile(&sink, raw, &profile)?;
    for (path, _) in sink.written_files() {
        info!(path = %path.display(), "user saved");
    }
    Ok(())
}
