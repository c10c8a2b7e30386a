use crate::error::{PreviewError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HMAC secret for session tokens. Unset means sessions cannot be verified.
    #[serde(default)]
    pub session_secret: Option<String>,
}

fn default_port() -> u16 {
    3141
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            session_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// REST container platform reached over HTTPS.
    Http,
    /// In-process provider for local development.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Container image running the Metro bundler.
    #[serde(default = "default_image")]
    pub image: String,
    /// Port the bundler listens on inside the container.
    #[serde(default = "default_bundler_port")]
    pub port: u16,
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_logs_timeout")]
    pub logs_timeout_secs: u64,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Memory
}

fn default_image() -> String {
    "node:20-bookworm".to_string()
}

fn default_bundler_port() -> u16 {
    8081
}

fn default_create_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_status_timeout() -> u64 {
    15
}

fn default_logs_timeout() -> u64 {
    20
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: None,
            token: None,
            image: default_image(),
            port: default_bundler_port(),
            create_timeout_secs: default_create_timeout(),
            request_timeout_secs: default_request_timeout(),
            status_timeout_secs: default_status_timeout(),
            logs_timeout_secs: default_logs_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// LifecycleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_monitor_retries")]
    pub monitor_max_retries: u32,
    #[serde(default = "default_monitor_backoff")]
    pub monitor_backoff_ms: u64,
    /// Run a reconciliation sweep every N monitor ticks.
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every: u32,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    1800
}

/// Upper bound accepted by [`Config::validate`].
pub const MAX_MONITOR_RETRIES: u32 = 10;

fn default_monitor_retries() -> u32 {
    3
}

fn default_monitor_backoff() -> u64 {
    250
}

fn default_reconcile_every() -> u32 {
    10
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            idle_timeout_secs: default_idle_timeout(),
            monitor_max_retries: default_monitor_retries(),
            monitor_backoff_ms: default_monitor_backoff(),
            reconcile_every: default_reconcile_every(),
        }
    }
}

impl LifecycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn monitor_backoff(&self) -> Duration {
        Duration::from_millis(self.monitor_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// QrConfig / RateLimitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_qr_size")]
    pub default_size: u32,
}

/// Upper bound accepted by [`Config::validate`].
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 3600;

fn default_cache_ttl() -> u64 {
    3600
}

fn default_qr_size() -> u32 {
    256
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            default_size: default_qr_size(),
        }
    }
}

impl QrConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

fn default_max_requests() -> u32 {
    10
}

fn default_window() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub qr: QrConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load `.preview/config.yaml` under `root`, falling back to defaults when
    /// the file is absent, then apply environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&data)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Overlay `PREVIEW_*` variables. `lookup` is injected so tests do not
    /// touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("PREVIEW_PROVIDER_TOKEN") {
            self.provider.token = Some(token);
        }
        if let Some(url) = lookup("PREVIEW_PROVIDER_URL") {
            self.provider.base_url = Some(url);
            self.provider.kind = ProviderKind::Http;
        }
        if let Some(secret) = lookup("PREVIEW_SESSION_SECRET") {
            self.server.session_secret = Some(secret);
        }
        if let Some(port) = lookup("PREVIEW_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Check the config for problems that will only show up at runtime.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.provider.kind == ProviderKind::Http {
            match self.provider.base_url.as_deref() {
                None | Some("") => warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "provider.kind is http but provider.base_url is not set".into(),
                }),
                Some(u) if !(u.starts_with("http://") || u.starts_with("https://")) => {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("provider.base_url '{u}' is not an http(s) URL"),
                    })
                }
                Some(_) => {}
            }
            if self.provider.token.is_none() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: "provider.token is not set; requests will be unauthenticated".into(),
                });
            }
        }

        if self.server.session_secret.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "server.session_secret is not set; every API request will be rejected"
                    .into(),
            });
        }

        if self.rate_limit.max_requests == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rate_limit.max_requests must be at least 1".into(),
            });
        }
        if self.rate_limit.window_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rate_limit.window_secs must be at least 1".into(),
            });
        }

        if self.lifecycle.poll_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "lifecycle.poll_interval_secs must be at least 1".into(),
            });
        }
        if self.lifecycle.monitor_max_retries > MAX_MONITOR_RETRIES {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "lifecycle.monitor_max_retries must be at most {MAX_MONITOR_RETRIES}"
                ),
            });
        }
        if self.qr.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("qr.cache_ttl_secs must be at most {MAX_CACHE_TTL_SECS} (one week)"),
            });
        }
        if self.lifecycle.idle_timeout_secs < self.lifecycle.poll_interval_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "lifecycle.idle_timeout_secs ({}) is shorter than poll_interval_secs ({}); \
                     containers may be stopped between two polls",
                    self.lifecycle.idle_timeout_secs, self.lifecycle.poll_interval_secs
                ),
            });
        }

        warnings
    }

    /// Fail on `Error`-level warnings.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PreviewError::InvalidConfig(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.provider.kind, ProviderKind::Memory);
        assert_eq!(config.qr.cache_ttl_secs, 3600);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".preview")).unwrap();
        std::fs::write(
            dir.path().join(".preview/config.yaml"),
            "provider:\n  kind: http\n  base_url: https://containers.example.com\nlifecycle:\n  idle_timeout_secs: 600\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(
            config.provider.base_url.as_deref(),
            Some("https://containers.example.com")
        );
        assert_eq!(config.provider.port, 8081);
        assert_eq!(config.lifecycle.idle_timeout_secs, 600);
        assert_eq!(config.lifecycle.poll_interval_secs, 30);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.qr.default_size = 512;
        config.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.qr.default_size, 512);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PREVIEW_PROVIDER_URL", "https://p.example.com"),
            ("PREVIEW_PROVIDER_TOKEN", "tok"),
            ("PREVIEW_PORT", "8080"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(config.provider.token.as_deref(), Some("tok"));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn http_provider_without_url_is_an_error() {
        let mut config = Config::default();
        config.provider.kind = ProviderKind::Http;
        let warnings = config.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("base_url")));
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn extreme_retry_and_ttl_values_are_errors() {
        let mut config = Config::default();
        config.lifecycle.monitor_max_retries = u32::MAX;
        config.qr.cache_ttl_secs = u64::MAX;
        let errors: Vec<String> = config
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        assert!(errors.iter().any(|m| m.contains("monitor_max_retries")));
        assert!(errors.iter().any(|m| m.contains("cache_ttl_secs")));
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn default_config_has_only_soft_warnings() {
        let config = Config::default();
        assert!(config.ensure_valid().is_ok());
        assert!(config
            .validate()
            .iter()
            .any(|w| w.message.contains("session_secret")));
    }
}
