//! Configuration for cirrus-formation.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{FormationError, FormationResult};
use crate::policy::FailurePolicy;

/// Top-level configuration for the formation service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FormationConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Deferred scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Orchestrator behaviour configuration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Backend adapter configuration.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl FormationConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `formation.toml` in the current directory (if present)
    /// 3. Environment variables with `CIRRUS_FORMATION_` prefix
    pub fn load() -> FormationResult<Self> {
        Figment::new()
            .merge(Toml::file("formation.toml"))
            .merge(Env::prefixed("CIRRUS_FORMATION_").split("__"))
            .extract()
            .map_err(|e| FormationError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> FormationResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CIRRUS_FORMATION_").split("__"))
            .extract()
            .map_err(|e| FormationError::Config(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/cirrus".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Deferred scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Queue formation jobs are submitted to.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Delay between two polls of a pending backend operation (seconds).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How many times a single wait state may re-arm before the unit fails.
    ///
    /// Zero polls until the backend reports success or an error.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Maximum number of steps executing at the same time.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

fn default_queue() -> String {
    "formation".to_owned()
}

const fn default_poll_interval_secs() -> u64 {
    10
}

const fn default_max_poll_attempts() -> u32 {
    180 // 30 minutes at the default interval
}

const fn default_dispatch_concurrency() -> usize {
    16
}

impl SchedulerConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Re-arm limit per wait state, `None` when unbounded.
    #[must_use]
    pub const fn poll_limit(&self) -> Option<u32> {
        if self.max_poll_attempts == 0 {
            None
        } else {
            Some(self.max_poll_attempts)
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
            dispatch_concurrency: default_dispatch_concurrency(),
        }
    }
}

/// Orchestrator behaviour configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    /// What happens to the rest of an experiment once a unit fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Backend adapter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Which adapter implementation to use.
    #[serde(default)]
    pub adapter_type: AdapterType,
}

/// Type of backend adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterType {
    /// In-memory adapters that accept every request.
    ///
    /// Real control-plane clients are injected through
    /// [`FormationService::new`](crate::service::FormationService::new).
    #[default]
    Mock,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = FormationConfig::default();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.scheduler.queue, "formation");
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.scheduler.poll_limit(), Some(180));
        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.backend.adapter_type, AdapterType::Mock);
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [database]
            url = "postgres://user:pass@db:5432/cirrus"
            max_connections = 20

            [scheduler]
            poll_interval_secs = 3
            max_poll_attempts = 0

            [orchestrator]
            failure_policy = "abort"
        "#;

        let config: FormationConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database.url, "postgres://user:pass@db:5432/cirrus");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.scheduler.poll_interval_secs, 3);
        assert_eq!(config.scheduler.poll_limit(), None);
        assert_eq!(config.scheduler.queue, "formation");
        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::Abort);
    }

    #[test]
    fn config_from_file() {
        let path = std::env::temp_dir().join(format!("formation-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[scheduler]\nqueue = \"formation-test\"\ndispatch_concurrency = 2\n",
        )
        .unwrap();

        let config = FormationConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.scheduler.queue, "formation-test");
        assert_eq!(config.scheduler.dispatch_concurrency, 2);
        assert_eq!(config.scheduler.max_poll_attempts, 180);
    }
}
