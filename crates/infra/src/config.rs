//! Configuration loading and representation.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `remitsync.toml`, then `REMITSYNC__*` environment variables (nested keys
//! separated by `__`, e.g. `REMITSYNC__REMOTE__JOURNAL_ID=7`). A `.env` file
//! is loaded first when present.

use std::time::Duration;

use serde::Deserialize;

use remitsync_remote::{CircuitBreakerConfig, RetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Fatal-configuration: the pipeline cannot talk to the remote side.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub journal_id: i64,
    /// 0 means "not configured".
    #[serde(default)]
    pub payment_method_line_id: i64,
    pub idempotency_field: String,
    pub request_timeout_secs: u64,
}

impl RemoteSettings {
    pub fn payment_method(&self) -> Option<i64> {
        (self.payment_method_line_id > 0).then_some(self.payment_method_line_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub amount_tolerance: f64,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub commit_interval: usize,
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
    pub continuation_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowSettings {
    pub max_requests: usize,
    pub window_ms: u64,
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub success_threshold: u32,
}

impl FlowSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            success_threshold: self.success_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_sleep_ms: u64,
}

impl RetrySettings {
    pub fn config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_sleep: Duration::from_millis(self.max_sleep_ms),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub remote: RemoteSettings,
    pub pipeline: PipelineSettings,
    pub flow: FlowSettings,
    pub retry: RetrySettings,
    /// In-memory store when absent.
    #[serde(default)]
    pub database_url: Option<String>,
    pub bind_address: String,
}

impl Settings {
    /// Load from `remitsync.toml` (optional) and the environment.
    pub fn load() -> Result<Self, SettingsError> {
        let _ = dotenvy::dotenv();
        let builder = Self::defaults()?
            .add_source(config::File::with_name("remitsync").required(false))
            .add_source(
                config::Environment::with_prefix("REMITSYNC")
                    .separator("__")
                    .try_parsing(true),
            );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parse from a TOML document layered over the defaults.
    pub fn from_toml(toml: &str) -> Result<Self, SettingsError> {
        let builder = Self::defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Ok(builder.build()?.try_deserialize()?)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, SettingsError> {
        Ok(config::Config::builder()
            .set_default("remote.idempotency_field", "payment_reference")?
            .set_default("remote.request_timeout_secs", 30)?
            .set_default("pipeline.amount_tolerance", 0.01)?
            .set_default("pipeline.batch_size", 30)?
            .set_default("pipeline.max_concurrent_batches", 5)?
            .set_default("pipeline.commit_interval", 10)?
            .set_default("pipeline.max_attempts", 5)?
            .set_default("pipeline.poll_interval_secs", 120)?
            .set_default("pipeline.continuation_delay_secs", 5)?
            .set_default("flow.max_requests", 5)?
            .set_default("flow.window_ms", 1000)?
            .set_default("flow.failure_threshold", 10)?
            .set_default("flow.open_timeout_secs", 300)?
            .set_default("flow.success_threshold", 3)?
            .set_default("retry.max_retries", 6)?
            .set_default("retry.base_backoff_ms", 1500)?
            .set_default("retry.max_sleep_ms", 20000)?
            .set_default("bind_address", "0.0.0.0:8080")?)
    }

    /// Fatal-configuration checks. Run at startup and before every pass.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let remote = &self.remote;
        for (name, value) in [
            ("remote.url", &remote.url),
            ("remote.database", &remote.database),
            ("remote.username", &remote.username),
            ("remote.password", &remote.password),
            ("remote.idempotency_field", &remote.idempotency_field),
        ] {
            if value.trim().is_empty() {
                return Err(SettingsError::Invalid(format!("{name} is required")));
            }
        }
        if remote.journal_id <= 0 {
            return Err(SettingsError::Invalid(
                "remote.journal_id must be a positive id".to_string(),
            ));
        }
        let p = &self.pipeline;
        if !p.amount_tolerance.is_finite() || p.amount_tolerance < 0.0 {
            return Err(SettingsError::Invalid(
                "pipeline.amount_tolerance must be >= 0".to_string(),
            ));
        }
        if p.batch_size == 0 || p.max_concurrent_batches == 0 || p.commit_interval == 0 {
            return Err(SettingsError::Invalid(
                "pipeline batch_size, max_concurrent_batches and commit_interval must be > 0"
                    .to_string(),
            ));
        }
        if p.max_attempts == 0 {
            return Err(SettingsError::Invalid(
                "pipeline.max_attempts must be > 0".to_string(),
            ));
        }
        if self.flow.max_requests == 0 || self.flow.window_ms == 0 {
            return Err(SettingsError::Invalid(
                "flow.max_requests and flow.window_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [remote]
        url = "https://ledger.example.com"
        database = "acme"
        username = "sync"
        password = "secret"
        journal_id = 7
    "#;

    #[test]
    fn defaults_fill_everything_but_the_connection() {
        let s = Settings::from_toml(MINIMAL).unwrap();
        assert_eq!(s.remote.idempotency_field, "payment_reference");
        assert_eq!(s.remote.payment_method(), None);
        assert_eq!(s.pipeline.batch_size, 30);
        assert_eq!(s.pipeline.commit_interval, 10);
        assert_eq!(s.pipeline.amount_tolerance, 0.01);
        assert_eq!(s.flow.breaker(), CircuitBreakerConfig::default());
        assert_eq!(s.retry.config(), RetryConfig::default());
        assert_eq!(s.bind_address, "0.0.0.0:8080");
        assert_eq!(s.database_url, None);
        s.validate().unwrap();
    }

    #[test]
    fn missing_connection_fields_are_fatal() {
        let s = Settings::from_toml("[remote]\njournal_id = 7").unwrap();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("remote.url"));
    }

    #[test]
    fn journal_and_tolerance_are_checked() {
        let mut s = Settings::from_toml(MINIMAL).unwrap();
        s.remote.journal_id = 0;
        assert!(matches!(s.validate(), Err(SettingsError::Invalid(_))));

        let mut s = Settings::from_toml(MINIMAL).unwrap();
        s.pipeline.amount_tolerance = -1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn payment_method_is_optional() {
        let toml = format!("{MINIMAL}\npayment_method_line_id = 3\n");
        let s = Settings::from_toml(&toml).unwrap();
        assert_eq!(s.remote.payment_method(), Some(3));
    }
}
