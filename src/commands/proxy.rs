//! `--set-proxy` / `--remove-proxy`.

use std::path::Path;

use tracing::info;

use crate::config::StoredSettings;
use crate::error::{Error, Result};
use crate::proxy::{parse_proxy, ProxyConfig};

/// Validate and persist a proxy. Returns the parsed form.
pub fn set_proxy(path: &Path, raw: &str) -> Result<ProxyConfig> {
    let proxy = parse_proxy(raw)?
        .ok_or_else(|| Error::InvalidProxy("empty proxy string".to_string()))?;

    let mut settings = StoredSettings::load_from(path)?;
    settings.set_proxy(Some(raw.to_string()));
    settings.save_to(path)?;
    info!(proxy = %proxy.redacted(), path = %path.display(), "proxy saved");
    Ok(proxy)
}

/// Clear the stored proxy. Returns whether one was set.
pub fn remove_proxy(path: &Path) -> Result<bool> {
    let mut settings = StoredSettings::load_from(path)?;
    let had_proxy = settings.proxy.is_some();
    settings.set_proxy(None);
    settings.save_to(path)?;
    Ok(had_proxy)
}

pub fn run_set(raw: &str) -> Result<()> {
    let proxy = set_proxy(&StoredSettings::default_path()?, raw)?;
    println!("Proxy set to {}", proxy.redacted());
    Ok(())
}

pub fn run_remove() -> Result<()> {
    if remove_proxy(&StoredSettings::default_path()?)? {
        println!("Proxy removed");
    } else {
        println!("No proxy was set");
    }
    Ok(())
}
