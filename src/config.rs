//! Configuration for the collector
//!
//! Engine settings come from `tgspyder.yml` (with `.env` and `${VAR}`
//! placeholders). Credentials and the saved proxy live in a small JSON file in
//! the home directory that `--set-proxy` / `--remove-proxy` rewrite.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::backoff::RetryPolicy;
use crate::error::{Error, Result};

/// Default constants (fallback if tgspyder.yml not found)
pub const SESSION_NAME: &str = "tgspyder";
pub const LOCK_FILE: &str = "tgspyder.lock";
pub const CONFIG_FILE: &str = "tgspyder.yml";
pub const STORED_SETTINGS_FILE: &str = ".tgspyder.conf";
pub const DEFAULT_OUTPUT_DIR: &str = "TGSpyder Output";
pub const DEFAULT_CHECKPOINT_DIR: &str = ".tgspyder/checkpoints";
pub const DEFAULT_MIN_SPACING_MS: u64 = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_FLOOD_WAIT_SECS: u64 = 3600;

/// YAML config structures
#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    telegram: Option<TelegramConfig>,
    collector: Option<CollectorConfig>,
    output: Option<OutputConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramConfig {
    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    api_id: Option<String>,
    api_hash: Option<String>,
    session_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CollectorConfig {
    min_spacing_ms: Option<u64>,
    page_size: Option<usize>,
    request_timeout_secs: Option<u64>,
    max_flood_wait_secs: Option<u64>,
    aggressive_members: Option<bool>,
    retry: Option<RetryConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryConfig {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputConfig {
    dir: Option<String>,
    checkpoint_dir: Option<String>,
}

/// Deserialize a value that can be either a string or a number
fn deserialize_string_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let value: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {:?}",
            other
        ))),
    }
}

/// Knobs for paging, pacing and retries.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub min_spacing: Duration,
    /// Up to 200. History requests cap it at 100.
    pub page_size: usize,
    pub request_timeout: Duration,
    /// Cooldowns longer than this end the run as rate-limited.
    pub max_flood_wait: Duration,
    pub aggressive_members: bool,
    pub retry: RetryPolicy,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(DEFAULT_MIN_SPACING_MS),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_flood_wait: Duration::from_secs(DEFAULT_MAX_FLOOD_WAIT_SECS),
            aggressive_members: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub api_id: i32,
    pub api_hash: String,
    pub session_name: String,
    pub lock_file: String,
    pub output_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub collector: CollectorSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Load configuration from tgspyder.yml or use defaults
    /// Environment variables take precedence over tgspyder.yml values
    pub fn new() -> Self {
        Self::load_from_file(CONFIG_FILE)
            .or_else(|_| Self::load_from_file(Path::new("..").join(CONFIG_FILE)))
            .unwrap_or_else(|_| Self::from_yaml(YamlConfig::default()))
    }

    /// Resolve a value: prefer env var if config value looks like ${VAR}
    fn resolve_env_string(value: Option<String>, env_key: &str) -> String {
        if let Some(ref v) = value {
            if v.starts_with("${") && v.ends_with('}') {
                let var_name = &v[2..v.len() - 1];
                if let Ok(env_val) = std::env::var(var_name) {
                    return env_val;
                }
                // Unresolved placeholder is treated as unset
                return std::env::var(env_key).unwrap_or_default();
            }
        }
        if let Ok(env_val) = std::env::var(env_key) {
            return env_val;
        }
        value.unwrap_or_default()
    }

    /// Resolve an integer value from string config or env var
    fn resolve_env_i32(value: Option<String>, env_key: &str) -> i32 {
        if let Some(ref v) = value {
            if v.starts_with("${") && v.ends_with('}') {
                let var_name = &v[2..v.len() - 1];
                if let Ok(env_val) = std::env::var(var_name) {
                    if let Ok(parsed) = env_val.parse::<i32>() {
                        return parsed;
                    }
                }
            }
            if let Ok(parsed) = v.parse::<i32>() {
                return parsed;
            }
        }
        if let Ok(env_val) = std::env::var(env_key) {
            if let Ok(parsed) = env_val.parse::<i32>() {
                return parsed;
            }
        }
        0
    }

    /// Load .env file into environment variables using dotenvy
    fn load_dotenv() {
        if dotenvy::dotenv().is_err() {
            let _ = dotenvy::from_filename("../.env");
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_dotenv();

        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let yaml: YamlConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(Self::from_yaml(yaml))
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        let telegram = yaml.telegram.unwrap_or_default();
        let collector = yaml.collector.unwrap_or_default();
        let output = yaml.output.unwrap_or_default();
        let retry = collector.retry.unwrap_or_default();

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
            base_delay: retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            jitter: retry.jitter.unwrap_or(defaults.jitter).clamp(0.0, 1.0),
        };

        let output_dir = std::env::var("TGSPYDER_OUTPUT_DIR")
            .ok()
            .or(output.dir)
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());

        Self {
            api_id: Self::resolve_env_i32(telegram.api_id, "TG_API_ID"),
            api_hash: Self::resolve_env_string(telegram.api_hash, "TG_API_HASH"),
            session_name: telegram
                .session_name
                .unwrap_or_else(|| SESSION_NAME.to_string()),
            lock_file: LOCK_FILE.to_string(),
            output_dir: PathBuf::from(output_dir),
            checkpoint_dir: PathBuf::from(
                output
                    .checkpoint_dir
                    .unwrap_or_else(|| DEFAULT_CHECKPOINT_DIR.to_string()),
            ),
            collector: CollectorSettings {
                min_spacing: Duration::from_millis(
                    collector.min_spacing_ms.unwrap_or(DEFAULT_MIN_SPACING_MS),
                ),
                page_size: collector.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 200),
                request_timeout: Duration::from_secs(
                    collector
                        .request_timeout_secs
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                ),
                max_flood_wait: Duration::from_secs(
                    collector
                        .max_flood_wait_secs
                        .unwrap_or(DEFAULT_MAX_FLOOD_WAIT_SECS),
                ),
                aggressive_members: collector.aggressive_members.unwrap_or(false),
                retry,
            },
        }
    }

    /// Pick usable credentials: env/YAML first, then the stored settings file.
    pub fn credentials(&self, stored: &StoredSettings) -> Result<(i32, String)> {
        let api_id = if self.api_id != 0 {
            self.api_id
        } else {
            stored.api_id.unwrap_or(0)
        };
        let api_hash = if !self.api_hash.is_empty() {
            self.api_hash.clone()
        } else {
            stored.api_hash.clone().unwrap_or_default()
        };

        if api_id == 0 {
            return Err(Error::MissingCredentials(
                "api_id (set TG_API_ID, tgspyder.yml or ~/.tgspyder.conf)".to_string(),
            ));
        }
        if api_hash.is_empty() {
            return Err(Error::MissingCredentials(
                "api_hash (set TG_API_HASH, tgspyder.yml or ~/.tgspyder.conf)".to_string(),
            ));
        }
        Ok((api_id, api_hash))
    }
}

/// Credentials and proxy persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl StoredSettings {
    /// Fixed process-wide location: `~/.tgspyder.conf`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(STORED_SETTINGS_FILE))
            .ok_or_else(|| Error::Config("cannot determine home directory".to_string()))
    }

    /// Missing file yields empty settings; an unreadable file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut settings: StoredSettings = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        // Older files store "" for unset values
        settings.normalize();
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
    }

    fn normalize(&mut self) {
        fn blank(value: &mut Option<String>) {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        blank(&mut self.api_hash);
        blank(&mut self.phone);
        blank(&mut self.bot_token);
        blank(&mut self.proxy);
        if self.api_id == Some(0) {
            self.api_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};
    use tempfile::tempdir;

    static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn unset(key: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(value) => std::env::set_var(&self.key, value),
                None => std::env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn defaults_without_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _g = EnvGuard::unset("TGSPYDER_OUTPUT_DIR");
        let config = Config::from_yaml(YamlConfig::default());
        assert_eq!(config.session_name, SESSION_NAME);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(config.collector.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(
            config.collector.min_spacing,
            Duration::from_millis(DEFAULT_MIN_SPACING_MS)
        );
    }

    #[test]
    fn loads_collector_section() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("tgspyder.yml");
        std::fs::write(
            &path,
            r#"
telegram:
  api_id: 12345
  api_hash: "abc"
collector:
  min_spacing_ms: 250
  page_size: 50
  aggressive_members: true
  retry:
    max_retries: 3
    base_delay_ms: 100
    max_delay_ms: 800
    jitter: 0.5
output:
  checkpoint_dir: "state"
"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.collector.min_spacing, Duration::from_millis(250));
        assert_eq!(config.collector.page_size, 50);
        assert!(config.collector.aggressive_members);
        assert_eq!(config.collector.retry.max_retries, 3);
        assert_eq!(config.collector.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.collector.retry.max_delay, Duration::from_millis(800));
        assert_eq!(config.checkpoint_dir, PathBuf::from("state"));
    }

    #[test]
    fn page_size_is_clamped_to_api_maximum() {
        let yaml: YamlConfig = serde_yaml::from_str("collector:\n  page_size: 5000\n").unwrap();
        let config = Config::from_yaml(yaml);
        assert_eq!(config.collector.page_size, 200);
    }

    #[test]
    fn env_placeholders_are_resolved_from_environment() {
        let _lock = ENV_LOCK.lock().unwrap();
        let yaml = r#"
telegram:
  api_id: "${MY_TG_ID}"
  api_hash: "${MY_TG_HASH}"
"#;
        let _guards = [
            EnvGuard::set("MY_TG_ID", "4242"),
            EnvGuard::set("MY_TG_HASH", "hash_from_env"),
        ];
        let parsed: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        let config = Config::from_yaml(parsed);
        assert_eq!(config.api_id, 4242);
        assert_eq!(config.api_hash, "hash_from_env");
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yml");
        std::fs::write(&path, "collector: [unclosed").unwrap();
        let err = Config::load_from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn credentials_fall_back_to_stored_settings() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _g = [EnvGuard::unset("TG_API_ID"), EnvGuard::unset("TG_API_HASH")];
        let config = Config::from_yaml(YamlConfig::default());
        let stored = StoredSettings {
            api_id: Some(77),
            api_hash: Some("stored".to_string()),
            ..Default::default()
        };
        assert_eq!(config.credentials(&stored).unwrap(), (77, "stored".to_string()));
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _g = [EnvGuard::unset("TG_API_ID"), EnvGuard::unset("TG_API_HASH")];
        let config = Config::from_yaml(YamlConfig::default());
        let err = config.credentials(&StoredSettings::default()).unwrap_err();
        assert!(matches!(err, Error::MissingCredentials(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn stored_settings_round_trip_and_blank_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".tgspyder.conf");

        // Format written by earlier versions of the tool
        std::fs::write(
            &path,
            r#"{"api_id": 1, "api_hash": "h", "phone": "", "bot_token": "", "proxy": ""}"#,
        )
        .unwrap();
        let mut settings = StoredSettings::load_from(&path).unwrap();
        assert_eq!(settings.proxy, None);
        assert_eq!(settings.phone, None);

        settings.set_proxy(Some(" socks5://127.0.0.1:9050 ".to_string()));
        settings.save_to(&path).unwrap();
        let reloaded = StoredSettings::load_from(&path).unwrap();
        assert_eq!(reloaded.proxy.as_deref(), Some("socks5://127.0.0.1:9050"));
        assert_eq!(reloaded.api_id, Some(1));

        let mut cleared = reloaded;
        cleared.set_proxy(None);
        assert_eq!(cleared.proxy, None);
    }

    #[test]
    fn missing_stored_settings_file_is_empty() {
        let dir = tempdir().unwrap();
        let settings = StoredSettings::load_from(&dir.path().join("nope.conf")).unwrap();
        assert_eq!(settings, StoredSettings::default());
    }
}
