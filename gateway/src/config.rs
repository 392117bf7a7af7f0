//! Process configuration.
//!
//! Values come from an optional TOML file overlaid by `GATEWAY_*`
//! environment variables; nested keys use `__` (`GATEWAY_STORAGE__URL`).
//!
//! | Key                           | Default         |
//! |-------------------------------|-----------------|
//! | `listen`                      | `0.0.0.0:12003` |
//! | `log_filter`                  | `gateway=info`  |
//! | `storage.driver`              | `memory`        |
//! | `storage.url`                 | none            |
//! | `storage.max_connections`     | `10`            |
//! | `cache_path`                  | none            |
//! | `defaults.sample`             | `400`           |
//! | `defaults.time_range`         | `-1h`           |
//! | `query.timeout_secs`          | `30`            |
//! | `query.concurrency`           | `4`             |
//! | `poller.shutdown_grace_secs`  | `10`            |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use gateway_core::query::{QueryDefaults, DEFAULT_SAMPLE, DEFAULT_TIME_RANGE};
use gateway_poller::WorkerConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub driver: StorageDriver,
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { driver: StorageDriver::Memory, url: None, max_connections: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub sample: usize,
    pub time_range: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self { sample: DEFAULT_SAMPLE, time_range: DEFAULT_TIME_RANGE.to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub timeout_secs: u64,
    /// Connector calls in flight per points request.
    pub concurrency: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { timeout_secs: 30, concurrency: 4 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub shutdown_grace_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { shutdown_grace_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    /// Directive added on top of `RUST_LOG`.
    pub log_filter: String,
    pub storage: StorageConfig,
    pub cache_path: Option<PathBuf>,
    pub defaults: DefaultsConfig,
    pub query: QueryConfig,
    pub poller: PollerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:12003".to_string(),
            log_filter: "gateway=info".to_string(),
            storage: StorageConfig::default(),
            cache_path: None,
            defaults: DefaultsConfig::default(),
            query: QueryConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Reads `path` when it exists, then the environment.
    pub fn load(path: &Path) -> Result<Self> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn query_defaults(&self) -> QueryDefaults {
        QueryDefaults {
            sample: self.defaults.sample,
            time_range: self.defaults.time_range.clone(),
            timeout: Duration::from_secs(self.query.timeout_secs),
            concurrency: self.query.concurrency.max(1),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            cache_path: self.cache_path.clone(),
            shutdown_grace: Duration::from_secs(self.poller.shutdown_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.listen, "0.0.0.0:12003");
        assert_eq!(config.storage.driver, StorageDriver::Memory);
        assert_eq!(config.storage.max_connections, 10);
        assert_eq!(config.defaults.sample, 400);
        assert_eq!(config.query_defaults().timeout, Duration::from_secs(30));
        assert_eq!(config.worker_config().shutdown_grace, Duration::from_secs(10));
        assert!(config.cache_path.is_none());
    }

    #[test]
    fn file_overrides_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
listen = "127.0.0.1:9000"
cache_path = "/var/cache/gateway"

[storage]
driver = "postgres"
url = "postgres://localhost/gateway"

[defaults]
time_range = "-6h"

[query]
concurrency = 0
"#,
        );
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.storage.driver, StorageDriver::Postgres);
        assert_eq!(config.storage.url.as_deref(), Some("postgres://localhost/gateway"));
        assert_eq!(config.storage.max_connections, 10);
        assert_eq!(config.defaults.time_range, "-6h");
        assert_eq!(config.defaults.sample, 400);
        assert_eq!(config.query_defaults().concurrency, 1);
        assert_eq!(
            config.worker_config().cache_path,
            Some(PathBuf::from("/var/cache/gateway"))
        );
    }

    #[test]
    fn unknown_storage_driver_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[storage]\ndriver = \"sqlite\"\n");
        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("sqlite"), "{err:#}");
    }
}
