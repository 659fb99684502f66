use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    Disabled,
    Fixed,
    Dynamic,
}

impl Default for ProxyMode {
    fn default() -> Self {
        Self::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    Sequential,
    Random,
    RandomNoRepeat,
    PerAccount,
}

impl Default for RotationStrategy {
    fn default() -> Self {
        Self::Sequential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub mode: ProxyMode,

    #[serde(default)]
    pub fixed_url: Option<String>,

    #[serde(default)]
    pub rotation_strategy: RotationStrategy,

    // How often the sequential strategy advances its current proxy (seconds)
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: u64,

    // Quarantine length after a proxy failure (seconds)
    #[serde(default = "default_cooldown_duration")]
    pub cooldown_duration: u64,

    // Used by per_account when no stable account identity is available
    #[serde(default)]
    pub fallback_strategy: RotationStrategy,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            fixed_url: None,
            rotation_strategy: RotationStrategy::default(),
            rotation_interval: default_rotation_interval(),
            cooldown_duration: default_cooldown_duration(),
            fallback_strategy: RotationStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    // Where accounts.json / proxies.txt live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // Business retry cap per request (account/proxy re-picks)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    // Fixed wait between generic retries (seconds)
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    #[serde(default = "default_overload_retry_attempts")]
    pub overload_retry_attempts: usize,

    // Per-account exclusion after an upstream overload report (seconds)
    #[serde(default = "default_overload_cooldown")]
    pub overload_cooldown: u64,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_session_cap")]
    pub per_account_session_cap: usize,

    // Idle web-session lifetime (seconds)
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,

    // Total upstream budget for one request (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    // Smaller budget for credential-validity probes (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,

    #[serde(default)]
    pub proxy: ProxySettings,

    // Legacy fixed-proxy shortcut. Recognized on load, migrated into
    // `proxy` and removed from the file on first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            retry_attempts: default_retry_attempts(),
            retry_interval: default_retry_interval(),
            overload_retry_attempts: default_overload_retry_attempts(),
            overload_cooldown: default_overload_cooldown(),
            max_concurrent_requests: default_max_concurrent_requests(),
            per_account_session_cap: default_session_cap(),
            session_ttl: default_session_ttl(),
            request_timeout: default_request_timeout(),
            probe_timeout: default_probe_timeout(),
            proxy: ProxySettings::default(),
            proxy_url: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5201
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_retry_attempts() -> usize {
    3
}
fn default_retry_interval() -> u64 {
    1
}
fn default_overload_retry_attempts() -> usize {
    5
}
fn default_overload_cooldown() -> u64 {
    30
}
fn default_max_concurrent_requests() -> usize {
    100
}
fn default_session_cap() -> usize {
    3
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_request_timeout() -> u64 {
    600
}
fn default_probe_timeout() -> u64 {
    30
}
fn default_rotation_interval() -> u64 {
    300
}
fn default_cooldown_duration() -> u64 {
    300
}

// Translate the legacy top-level `proxy_url` into fixed mode. Returns true
// when the config changed and should be rewritten.
pub fn migrate_legacy_proxy_url(config: &mut AppConfig) -> bool {
    let url = match config.proxy_url.take() {
        Some(u) if !u.trim().is_empty() => u,
        Some(_) => return true,
        None => return false,
    };
    if config.proxy.mode == ProxyMode::Disabled && config.proxy.fixed_url.is_none() {
        tracing::info!("[Config] Migrating legacy proxy_url to proxy.mode=fixed");
        config.proxy.mode = ProxyMode::Fixed;
        config.proxy.fixed_url = Some(url);
    } else {
        tracing::warn!("[Config] Ignoring legacy proxy_url: proxy settings already configured");
    }
    true
}

pub fn load_config(path: &Path) -> AppConfig {
    let mut config = match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("[Config] Failed to parse {}: {}, using defaults", path.display(), e);
                AppConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("[Config] No config at {}, using defaults", path.display());
            AppConfig::default()
        }
    };

    if migrate_legacy_proxy_url(&mut config) {
        if let Err(e) = save_config(path, &config) {
            tracing::warn!("[Config] Failed to persist migrated config: {}", e);
        }
    }

    config
}

pub fn save_config(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_string_pretty(config).expect("config serializes");
    std::fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = AppConfig::default();
        assert_eq!(c.retry_attempts, 3);
        assert_eq!(c.retry_interval, 1);
        assert_eq!(c.overload_retry_attempts, 5);
        assert_eq!(c.overload_cooldown, 30);
        assert_eq!(c.max_concurrent_requests, 100);
        assert_eq!(c.proxy.mode, ProxyMode::Disabled);
    }

    #[test]
    fn legacy_proxy_url_migrates_to_fixed_mode() {
        let mut c: AppConfig =
            serde_json::from_str(r#"{"proxy_url": "http://10.0.0.1:8080"}"#).unwrap();
        assert!(migrate_legacy_proxy_url(&mut c));
        assert_eq!(c.proxy.mode, ProxyMode::Fixed);
        assert_eq!(c.proxy.fixed_url.as_deref(), Some("http://10.0.0.1:8080"));
        assert!(c.proxy_url.is_none());

        // Idempotent: nothing left to migrate on the next load.
        assert!(!migrate_legacy_proxy_url(&mut c));
    }

    #[test]
    fn legacy_proxy_url_does_not_clobber_configured_pool() {
        let mut c: AppConfig = serde_json::from_str(
            r#"{"proxy_url": "http://old:1", "proxy": {"mode": "dynamic"}}"#,
        )
        .unwrap();
        assert!(migrate_legacy_proxy_url(&mut c));
        assert_eq!(c.proxy.mode, ProxyMode::Dynamic);
        assert!(c.proxy.fixed_url.is_none());
    }

    #[test]
    fn migrated_file_parses_through_new_schema_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"proxy_url": "socks5://10.0.0.2:1080"}"#).unwrap();

        let first = load_config(&path);
        assert_eq!(first.proxy.mode, ProxyMode::Fixed);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("proxy_url"));
        let second = load_config(&path);
        assert_eq!(
            second.proxy.fixed_url.as_deref(),
            Some("socks5://10.0.0.2:1080")
        );
    }
}
