use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Process-level configuration, sourced from the environment via Figment.
/// Field names map to env vars in UPPER_SNAKE_CASE (`Env::raw()`).
///
/// Out-of-range values are clamped silently by [`BasicConfig::clamped`];
/// unparseable environments fall back to defaults as a whole.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// HTTP server listen port. Env: `PORT`. Default: `8080`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Deployment environment tag ("development", "production").
    /// Env: `ENV`. Default: `production`.
    #[serde(default = "default_env")]
    pub env: String,

    /// Serve the bundled dashboard assets. Env: `ENABLE_WEB_UI`.
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub enable_web_ui: bool,

    /// Access key clients must present (`x-api-key` or bearer).
    /// Env: `PROXY_ACCESS_KEY`. Empty disables inbound auth.
    #[serde(default, deserialize_with = "de_string_lax")]
    pub proxy_access_key: String,

    /// Log level: one of error|warn|info|debug. Env: `LOG_LEVEL`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Pretty-print inbound request bodies at debug level.
    /// Env: `ENABLE_REQUEST_LOGS`.
    #[serde(default, deserialize_with = "de_flag")]
    pub enable_request_logs: bool,

    /// Pretty-print upstream response bodies at debug level.
    /// Env: `ENABLE_RESPONSE_LOGS`.
    #[serde(default, deserialize_with = "de_flag")]
    pub enable_response_logs: bool,

    /// Drop access-log lines for polling endpoints. Env: `QUIET_POLLING_LOGS`.
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub quiet_polling_logs: bool,

    /// Emit raw (non-ANSI) log output. Env: `RAW_LOG_OUTPUT`.
    #[serde(default, deserialize_with = "de_flag")]
    pub raw_log_output: bool,

    /// Per-SSE-event debug logging: off|summary|full. Env: `SSE_DEBUG_LEVEL`.
    #[serde(default = "default_sse_debug_level")]
    pub sse_debug_level: String,

    /// Whole-request upstream timeout in milliseconds. Env: `REQUEST_TIMEOUT`.
    /// Default: `600000` (10 min). Clamped to [1000, 3600000].
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout: u64,

    /// Inbound body cap in MiB. Env: `MAX_REQUEST_BODY_SIZE_MB`.
    /// Default: `10`. Clamped to [1, 100].
    #[serde(default = "default_max_body_mb")]
    pub max_request_body_size_mb: u64,

    /// Env: `ENABLE_CORS`.
    #[serde(default, deserialize_with = "de_flag")]
    pub enable_cors: bool,

    /// Allowed CORS origin; `*` means any. Env: `CORS_ORIGIN`.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,

    /// Sliding-window size for per-key metrics. Env: `METRICS_WINDOW_SIZE`.
    /// Default: `10`. Clamped to [1, 1000].
    #[serde(default = "default_metrics_window_size")]
    pub metrics_window_size: usize,

    /// Failure-rate threshold opening the breaker. Env:
    /// `METRICS_FAILURE_THRESHOLD`. Default: `0.5`. Clamped to (0, 1].
    #[serde(default = "default_metrics_failure_threshold")]
    pub metrics_failure_threshold: f64,

    /// Persist per-key metrics to the embedded store (consumed by the
    /// persistence collaborator). Env: `METRICS_PERSISTENCE_ENABLED`.
    #[serde(default, deserialize_with = "de_flag")]
    pub metrics_persistence_enabled: bool,

    /// Metrics retention in days. Env: `METRICS_RETENTION_DAYS`.
    /// Default: `7`. Clamped to [3, 30].
    #[serde(default = "default_metrics_retention_days")]
    pub metrics_retention_days: u64,

    /// Seconds to wait for upstream response headers.
    /// Env: `RESPONSE_HEADER_TIMEOUT`. Default: `60`. Clamped to [30, 120].
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout: u64,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            env: default_env(),
            enable_web_ui: true,
            proxy_access_key: String::new(),
            log_level: default_log_level(),
            enable_request_logs: false,
            enable_response_logs: false,
            quiet_polling_logs: true,
            raw_log_output: false,
            sse_debug_level: default_sse_debug_level(),
            request_timeout: default_request_timeout_ms(),
            max_request_body_size_mb: default_max_body_mb(),
            enable_cors: false,
            cors_origin: default_cors_origin(),
            metrics_window_size: default_metrics_window_size(),
            metrics_failure_threshold: default_metrics_failure_threshold(),
            metrics_persistence_enabled: false,
            metrics_retention_days: default_metrics_retention_days(),
            response_header_timeout: default_response_header_timeout(),
        }
    }
}

impl BasicConfig {
    /// Builds a Figment that merges defaults and environment variables.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(BasicConfig::default()))
            .merge(Env::raw())
    }

    /// Loads from the environment. Never fails: an unextractable
    /// environment logs a warning and yields defaults.
    pub fn from_env() -> Self {
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            warn!("environment configuration invalid, using defaults: {err}");
            Self::default()
        });
        cfg.clamped()
    }

    /// Silently clamp every knob into its documented range.
    pub fn clamped(mut self) -> Self {
        self.request_timeout = self.request_timeout.clamp(1_000, 3_600_000);
        self.max_request_body_size_mb = self.max_request_body_size_mb.clamp(1, 100);
        self.metrics_window_size = self.metrics_window_size.clamp(1, 1_000);
        if !(self.metrics_failure_threshold > 0.0 && self.metrics_failure_threshold <= 1.0) {
            self.metrics_failure_threshold = default_metrics_failure_threshold();
        }
        self.metrics_retention_days = self.metrics_retention_days.clamp(3, 30);
        self.response_header_timeout = self.response_header_timeout.clamp(30, 120);

        if !matches!(self.log_level.as_str(), "error" | "warn" | "info" | "debug") {
            self.log_level = default_log_level();
        }
        if !matches!(self.sse_debug_level.as_str(), "off" | "summary" | "full") {
            self.sse_debug_level = default_sse_debug_level();
        }
        self
    }

    pub fn max_body_bytes(&self) -> usize {
        (self.max_request_body_size_mb as usize) * 1024 * 1024
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    pub fn response_header_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout)
    }

    pub fn sse_debug_summary(&self) -> bool {
        matches!(self.sse_debug_level.as_str(), "summary" | "full")
    }

    pub fn sse_debug_full(&self) -> bool {
        self.sse_debug_level == "full"
    }
}

/// Accept booleans in the forms env vars actually arrive in: `1`/`0`,
/// `true`/`false`, `yes`/`no` (case-insensitive).
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::String(s) => Ok(matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )),
        _ => Err(serde::de::Error::custom("expected a boolean-like value")),
    }
}

fn de_string_lax<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected a string or a number")),
    }
}

fn default_port() -> u16 {
    8080
}

fn default_env() -> String {
    "production".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sse_debug_level() -> String {
    "off".to_string()
}

fn default_request_timeout_ms() -> u64 {
    600_000
}

fn default_max_body_mb() -> u64 {
    10
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_metrics_window_size() -> usize {
    10
}

fn default_metrics_failure_threshold() -> f64 {
    0.5
}

fn default_metrics_retention_days() -> u64 {
    7
}

fn default_response_header_timeout() -> u64 {
    60
}
