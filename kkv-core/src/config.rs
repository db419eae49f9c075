//! Configuration loading for the KKV client.
//!
//! Hosts and topic are required. Timing knobs fall back to the documented
//! defaults when absent from the file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PUT_INTERVAL_MS: u64 = 50;
pub const DEFAULT_PUT_RETRIES: u32 = 5;
pub const DEFAULT_DEBOUNCE_MS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Longest stream line accepted as a record (16 MiB).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Retry budget for a single `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PutOptions {
    /// Wait between attempts.
    #[serde(default = "default_put_interval_ms")]
    pub interval_ms: u64,
    /// Attempts allowed after the first one.
    #[serde(default = "default_put_retries")]
    pub n_retries: u32,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_PUT_INTERVAL_MS,
            n_retries: DEFAULT_PUT_RETRIES,
        }
    }
}

impl PutOptions {
    pub fn new(interval_ms: u64, n_retries: u32) -> Self {
        Self {
            interval_ms,
            n_retries,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Total number of attempts this budget allows.
    pub fn max_attempts(&self) -> u32 {
        self.n_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL of the read-through cache, e.g. `http://cache-kkv`.
    pub cache_host: String,
    /// Base URL of the write proxy, e.g. `http://pixy`.
    pub proxy_host: String,
    pub topic_name: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Gzip write bodies before sending them to the proxy.
    #[serde(default)]
    pub gzip_payloads: bool,
    #[serde(default)]
    pub put: PutOptions,
    /// Stream lines longer than this are skipped as malformed.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

impl ClientConfig {
    pub fn new(
        cache_host: impl Into<String>,
        proxy_host: impl Into<String>,
        topic_name: impl Into<String>,
    ) -> Self {
        Self {
            cache_host: cache_host.into(),
            proxy_host: proxy_host.into(),
            topic_name: topic_name.into(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            gzip_payloads: false,
            put: PutOptions::default(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_gzip_payloads(mut self, enabled: bool) -> Self {
        self.gzip_payloads = enabled;
        self
    }

    pub fn with_put_options(mut self, put: PutOptions) -> Self {
        self.put = put;
        self
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Host part of the cache URL, used as the `cache_host` metric label.
    ///
    /// `http://cache-kkv:8080/` becomes `cache-kkv`. Falls back to the raw
    /// setting when it does not look like a URL.
    pub fn cache_host_label(&self) -> String {
        let without_scheme = self
            .cache_host
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.cache_host);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host);
        if host.is_empty() {
            self.cache_host.clone()
        } else {
            host.to_string()
        }
    }

    /// Load from `--config <path>` or `KKV_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host("cache_host", &self.cache_host)?;
        validate_host("proxy_host", &self.proxy_host)?;
        if self.topic_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "topic_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.debounce_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "debounce_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_record_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_record_bytes",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn validate_host(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must start with http:// or https://".to_string(),
        });
    }
    Ok(())
}

fn default_put_interval_ms() -> u64 {
    DEFAULT_PUT_INTERVAL_MS
}

fn default_put_retries() -> u32 {
    DEFAULT_PUT_RETRIES
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("KKV_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
