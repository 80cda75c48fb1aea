use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_ledger::DEFAULT_WINDOW;
use relay_policy::{BreakerConfig, RetryPolicy};
use relay_queue::PushOptions;
use relay_stream::TicketConfig;
use relay_tools::HttpToolConfig;
use relay_types::error::DEFAULT_TRANSIENT_PATTERNS;
use relay_types::TransientMatcher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::LogFormat;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("./relay.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub transient_patterns: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            transient_patterns: DEFAULT_TRANSIENT_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketSection {
    pub ttl_secs: u64,
    pub retention_secs: u64,
    pub events_path: String,
}

impl Default for TicketSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            retention_secs: 86_400,
            events_path: "/v1/tools/events".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySection {
    pub window_secs: u64,
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW.as_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// JSONL ledger file; entries stay in memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Queues the server drains in the background.
    pub workers: Vec<String>,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval_ms: 250,
            workers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub http: Vec<HttpToolConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    pub log_format: LogFormat,
    pub store: StoreSection,
    pub breaker: BreakerSection,
    pub retry: RetrySection,
    pub tickets: TicketSection,
    pub idempotency: IdempotencySection,
    pub telemetry: TelemetrySection,
    pub queue: QueueSection,
    pub tools: ToolsSection,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7000".into(),
            log_format: LogFormat::Pretty,
            store: StoreSection::default(),
            breaker: BreakerSection::default(),
            retry: RetrySection::default(),
            tickets: TicketSection::default(),
            idempotency: IdempotencySection::default(),
            telemetry: TelemetrySection::default(),
            queue: QueueSection::default(),
            tools: ToolsSection::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// File named by `RELAY_CONFIG` (or defaults), then `RELAY_*` overrides, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = match env("RELAY_CONFIG") {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        cfg.apply_env(&env)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("RELAY_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = env("RELAY_STORE") {
            self.store.backend = match v.trim().to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "sqlite" => StoreBackend::Sqlite,
                other => return Err(ConfigError::Invalid(format!("RELAY_STORE={other}"))),
            };
        }
        if let Some(v) = env("RELAY_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = env("RELAY_TELEMETRY_FILE") {
            self.telemetry.path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("RELAY_LOG_FORMAT") {
            self.log_format = LogFormat::parse(&v)
                .ok_or_else(|| ConfigError::Invalid(format!("RELAY_LOG_FORMAT={v}")))?;
        }
        if let Some(v) = env("RELAY_WORKERS") {
            self.queue.workers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.threshold == 0 {
            return Err(ConfigError::Invalid("breaker.threshold must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if self.tickets.ttl_secs == 0 {
            return Err(ConfigError::Invalid("tickets.ttl_secs must be > 0".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker.threshold,
            reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_backoff(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_delay_ms),
            self.retry.multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn transient_matcher(&self) -> TransientMatcher {
        TransientMatcher::new(self.retry.transient_patterns.iter().cloned())
    }

    pub fn ticket_config(&self) -> TicketConfig {
        TicketConfig {
            ttl: Duration::from_secs(self.tickets.ttl_secs),
            retention: Duration::from_secs(self.tickets.retention_secs),
        }
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency.window_secs)
    }

    pub fn push_options(&self, priority: Option<f64>) -> PushOptions {
        PushOptions {
            priority: priority.unwrap_or(PushOptions::default().priority),
            max_attempts: self.queue.max_attempts,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = RelayConfig::load_with(env(&[])).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:7000");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.breaker_config().threshold, 5);
        assert_eq!(cfg.ticket_config().ttl, Duration::from_secs(300));
        assert_eq!(cfg.idempotency_window(), Duration::from_secs(1800));
        assert!(cfg.transient_matcher().is_transient("HTTP 503 from upstream"));
    }

    #[test]
    fn yaml_then_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        fs::write(
            &path,
            "listen: 127.0.0.1:9000\n\
             breaker:\n  threshold: 2\n\
             retry:\n  transient_patterns: [\"try again\"]\n\
             tools:\n  http:\n    - name: crm\n      url: http://crm.local/invoke\n      provider: crm-vendor\n",
        )
        .unwrap();
        let path_str = path.display().to_string();
        let cfg = RelayConfig::load_with(env(&[
            ("RELAY_CONFIG", path_str.as_str()),
            ("RELAY_LISTEN", "127.0.0.1:9100"),
            ("RELAY_STORE", "sqlite"),
            ("RELAY_WORKERS", "reports, payroll,"),
            ("RELAY_LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9100");
        assert_eq!(cfg.breaker.threshold, 2);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.queue.workers, vec!["reports", "payroll"]);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.tools.http[0].timeout_ms, 30_000);
        let matcher = cfg.transient_matcher();
        assert!(matcher.is_transient("please Try Again later"));
        assert!(!matcher.is_transient("timeout"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = RelayConfig::default();
        cfg.retry.initial_delay_ms = 10_000;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = RelayConfig::default();
        cfg.breaker.threshold = 0;
        assert!(cfg.validate().is_err());

        for multiplier in [f64::NAN, f64::INFINITY, 0.5] {
            let mut cfg = RelayConfig::default();
            cfg.retry.multiplier = multiplier;
            assert!(cfg.validate().is_err(), "multiplier {multiplier} accepted");
        }

        assert!(RelayConfig::load_with(env(&[("RELAY_STORE", "redis")])).is_err());
    }
}
