//! Widget configuration.
//!
//! One top-level [`Config`] composed of per-concern sections, loadable from
//! TOML. Every field has a serde default so an empty file (or no file at
//! all) yields a working development configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// API / messaging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cross-context messaging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Origins allowed to issue requests. `["*"]` allows all.
    #[serde(default = "d_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Protocol version stamped on every envelope; inbound requests with a
    /// different version are rejected.
    #[serde(default = "d_api_version")]
    pub version: String,

    /// Default RPC timeout in milliseconds.
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum serialized envelope size in bytes.
    #[serde(default = "d_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl ApiConfig {
    /// Whether `origin` may issue requests.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|o| o == "*" || o == origin)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_allowed_origins(),
            version: d_api_version(),
            request_timeout_ms: d_request_timeout_ms(),
            max_request_bytes: d_max_request_bytes(),
        }
    }
}

fn d_allowed_origins() -> Vec<String> {
    vec!["*".into()]
}

fn d_api_version() -> String {
    "1.0.0".into()
}

fn d_request_timeout_ms() -> u64 {
    5_000
}

fn d_max_request_bytes() -> usize {
    1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process map, optionally persisted to a JSON file.
    #[default]
    Local,
    /// Remote backend over HTTP.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the local adapter's state file. `None` = memory only.
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    /// Base URL of the remote backend (HTTP adapter only).
    #[serde(default = "d_store_base_url")]
    pub base_url: String,

    /// Optional bearer token for the remote backend.
    #[serde(default)]
    pub api_key: Option<String>,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "d_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Local,
            state_path: None,
            base_url: d_store_base_url(),
            api_key: None,
            timeout_ms: d_store_timeout_ms(),
        }
    }
}

fn d_store_base_url() -> String {
    "http://localhost:3000".into()
}

fn d_store_timeout_ms() -> u64 {
    10_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result polling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Desktop-side result polling schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between attempts during the initial window.
    #[serde(default = "d_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Interval between attempts once the initial window has elapsed.
    #[serde(default = "d_slow_interval_ms")]
    pub slow_interval_ms: u64,

    /// Elapsed time after which polling switches to the slow interval.
    #[serde(default = "d_slow_after_ms")]
    pub slow_after_ms: u64,

    /// Elapsed time after which polling stops with a terminal expiry error.
    #[serde(default = "d_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
}

impl PollingConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms)
    }

    pub fn slow_after(&self) -> Duration {
        Duration::from_millis(self.slow_after_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: d_initial_interval_ms(),
            slow_interval_ms: d_slow_interval_ms(),
            slow_after_ms: d_slow_after_ms(),
            hard_timeout_ms: d_hard_timeout_ms(),
        }
    }
}

fn d_initial_interval_ms() -> u64 {
    2_500
}

fn d_slow_interval_ms() -> u64 {
    5_000
}

fn d_slow_after_ms() -> u64 {
    30_000
}

fn d_hard_timeout_ms() -> u64 {
    600_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Session time-to-live in milliseconds (expiry is lazy, checked on read).
    #[serde(default = "d_session_expiry_ms")]
    pub expiry_ms: u64,
}

impl SessionsConfig {
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.expiry_ms as i64)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            expiry_ms: d_session_expiry_ms(),
        }
    }
}

fn d_session_expiry_ms() -> u64 {
    60 * 60 * 1000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.api.allowed_origins.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "api.allowed_origins".into(),
                message: "at least one origin (or \"*\") is required".into(),
            });
        }

        if self.api.allowed_origins.iter().any(|o| o == "*") {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "api.allowed_origins".into(),
                message: "wildcard \"*\" allows all origins (not recommended for production)"
                    .into(),
            });
        }

        if self.api.version.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "api.version".into(),
                message: "version must not be empty".into(),
            });
        }

        if self.api.max_request_bytes == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "api.max_request_bytes".into(),
                message: "request size budget must be greater than 0".into(),
            });
        }

        if self.store.backend == StoreBackend::Http && self.store.base_url.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "store.base_url".into(),
                message: "base_url is required for the http backend".into(),
            });
        }

        if self.polling.initial_interval_ms == 0 || self.polling.slow_interval_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "polling".into(),
                message: "poll intervals must be greater than 0".into(),
            });
        }

        if self.polling.hard_timeout_ms <= self.polling.slow_after_ms {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "polling.hard_timeout_ms".into(),
                message: "hard timeout must exceed the initial polling window".into(),
            });
        }

        if self.sessions.expiry_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.expiry_ms".into(),
                message: "session expiry must be greater than 0".into(),
            });
        }

        errors
    }
}
