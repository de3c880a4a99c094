//! Startup configuration.
//!
//! Built once (defaults, optionally overlaid with environment values read a
//! single time by the caller) and passed by reference into the orchestrator
//! and its collaborators. No component reads ambient environment state.

use crate::retry::RetryPolicy;
use crate::sync::ConflictStrategy;
use std::path::PathBuf;
use std::time::Duration;

/// Remote object store settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Store root URL; `None` disables remote synchronization.
    pub base_url: Option<String>,
    /// Bearer token for the store, when required.
    pub bearer_token: Option<String>,
    /// Remote prefix for report artifacts.
    pub reports_prefix: String,
    /// Remote prefix for evidence/log artifacts.
    pub logs_prefix: String,
    /// Conflict policy for report artifacts.
    pub report_conflict_strategy: ConflictStrategy,
    /// Conflict policy for evidence/log artifacts.
    pub log_conflict_strategy: ConflictStrategy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            bearer_token: None,
            reports_prefix: "reports".to_string(),
            logs_prefix: "logs".to_string(),
            report_conflict_strategy: ConflictStrategy::VersionSuffix,
            log_conflict_strategy: ConflictStrategy::VersionSuffix,
        }
    }
}

impl RemoteConfig {
    /// Whether a remote store is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }
}

/// Confirmation-form settings.
#[derive(Debug, Clone, Default)]
pub struct FormConfig {
    /// Form endpoint; `None` disables submission.
    pub url: Option<String>,
}

impl FormConfig {
    /// Whether form submission is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

/// Flat application configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Catalog endpoint. Default: the public fake-store products API.
    pub api_endpoint: String,
    /// SQLite database path. Default: `data/products.db`.
    pub database_path: PathBuf,
    /// Directory for raw snapshots. Default: `data`.
    pub data_dir: PathBuf,
    /// Directory for report artifacts. Default: `reports`.
    pub report_dir: PathBuf,
    /// Directory for evidence artifacts. Default: `evidence`.
    pub evidence_dir: PathBuf,
    /// Remote store settings.
    pub remote: RemoteConfig,
    /// Confirmation-form settings.
    pub form: FormConfig,
    /// Step retry policy. Default: 3 attempts from 1s, capped at 30s.
    pub retry: RetryPolicy,
    /// Network retry policy for remote transfers. Default: 4 attempts from
    /// 2s, capped at 60s.
    pub network_retry: RetryPolicy,
    /// HTTP request timeout. Default: 30s.
    pub http_timeout: Duration,
    /// Per-probe health check timeout. Default: 5s.
    pub probe_timeout: Duration,
    /// Run-level timeout; `None` disables it. Default: none.
    pub run_timeout: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://fakestoreapi.com/products".to_string(),
            database_path: PathBuf::from("data/products.db"),
            data_dir: PathBuf::from("data"),
            report_dir: PathBuf::from("reports"),
            evidence_dir: PathBuf::from("evidence"),
            remote: RemoteConfig::default(),
            form: FormConfig::default(),
            retry: RetryPolicy::default(),
            network_retry: RetryPolicy::network(),
            http_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            run_timeout: None,
        }
    }
}

impl AppConfig {
    /// Builds the configuration from process environment variables, falling
    /// back to the documented defaults. Intended to be called exactly once
    /// at startup by the binary shell.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(endpoint) = read_env("CONVEYOR_API_ENDPOINT") {
            config.api_endpoint = endpoint;
        }
        if let Some(path) = read_env("CONVEYOR_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(dir) = read_env("CONVEYOR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = read_env("CONVEYOR_REPORT_DIR") {
            config.report_dir = PathBuf::from(dir);
        }
        if let Some(dir) = read_env("CONVEYOR_EVIDENCE_DIR") {
            config.evidence_dir = PathBuf::from(dir);
        }
        config.remote.base_url = read_env("CONVEYOR_REMOTE_BASE_URL");
        config.remote.bearer_token = read_env("CONVEYOR_REMOTE_TOKEN");
        if let Some(strategy) = read_env("CONVEYOR_REPORT_CONFLICT_STRATEGY") {
            config.remote.report_conflict_strategy = parse_strategy(&strategy)
                .unwrap_or(config.remote.report_conflict_strategy);
        }
        config.form.url = read_env("CONVEYOR_FORM_URL");

        if let Some(attempts) = read_parsed::<usize>("CONVEYOR_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = read_parsed::<u64>("CONVEYOR_BASE_DELAY_SECS") {
            config.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = read_parsed::<u64>("CONVEYOR_MAX_DELAY_SECS") {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = read_parsed::<u64>("CONVEYOR_RUN_TIMEOUT_SECS") {
            config.run_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = read_parsed::<u64>("CONVEYOR_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_parsed::<u64>("CONVEYOR_PROBE_TIMEOUT_SECS") {
            config.probe_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = read_env(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, value = %raw, "unparseable configuration value ignored");
            None
        }
    }
}

fn parse_strategy(raw: &str) -> Option<ConflictStrategy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "version_suffix" | "version-suffix" => Some(ConflictStrategy::VersionSuffix),
        "fail" => Some(ConflictStrategy::Fail),
        other => {
            tracing::warn!(value = other, "unknown conflict strategy ignored");
            None
        }
    }
}
