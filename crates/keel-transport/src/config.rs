use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bucket::ObjectStoreTransport;
use crate::disk::DiskTransport;
use crate::error::{TransportError, TransportResult};
use crate::hooks::TransportHooks;
use crate::memory::MemoryTransport;
use crate::sqlite::SqliteTransport;
use crate::traits::Transport;

/// Environment variables consulted when object store settings are missing.
pub const ENV_ACCESS_KEY: &str = "ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "SECRET_KEY";
pub const ENV_REGION: &str = "REGION";
pub const ENV_BUCKET_NAME: &str = "BUCKET_NAME";
pub const ENV_BUCKET_PATH: &str = "BUCKET_PATH";
pub const ENV_ENDPOINT: &str = "ENDPOINT";

/// Platform data directory, or the temp directory when there is none.
pub fn data_root() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub base_path: PathBuf,
    pub application_scope: String,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            base_path: data_root().join("Keel"),
            application_scope: "Objects".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub base_path: PathBuf,
    pub application_name: String,
    pub scope: String,
    /// Records per transaction in `save_objects`.
    pub batch_size: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            base_path: data_root(),
            application_name: "Keel".to_string(),
            scope: "Data".to_string(),
            batch_size: 1000,
        }
    }
}

/// Write-behind settings for [`ObjectStoreTransport`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Delay between the first enqueue and the flush it triggers.
    pub flush_interval_ms: u64,
    /// Records taken from the queue per flush pass.
    pub batch_size: usize,
    pub max_concurrent_puts: usize,
    /// Upper bound on a single `write_complete` wait.
    pub write_timeout_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    /// Log and skip failed PUTs instead of aborting the batch.
    pub continue_on_error: bool,
    /// Extra attempts for transient PUT failures.
    pub max_retries: usize,
}

impl FlushConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms.max(1))
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_initial_ms).max(1))
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            batch_size: 1000,
            max_concurrent_puts: 16,
            write_timeout_ms: 10 * 60 * 1000,
            poll_initial_ms: 10,
            poll_max_ms: 500,
            continue_on_error: false,
            max_retries: 3,
        }
    }
}

/// S3-compatible bucket settings.
///
/// Unset fields fall back to the environment when the transport is built
/// (see [`ObjectStoreTransport::s3`]).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
    pub path_prefix: Option<String>,
    pub allow_http: bool,
    pub flush: FlushConfig,
}

impl ObjectStoreConfig {
    /// Fill missing fields from the process environment.
    pub fn with_env_fallback(self) -> Self {
        self.with_fallback(|key| std::env::var(key).ok())
    }

    /// Fill missing fields from `lookup`, keyed by the `ENV_*` names.
    pub fn with_fallback(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fill = |slot: &mut Option<String>, key: &str| {
            if slot.is_none() {
                *slot = lookup(key).filter(|v| !v.is_empty());
            }
        };
        fill(&mut self.access_key, ENV_ACCESS_KEY);
        fill(&mut self.secret_key, ENV_SECRET_KEY);
        fill(&mut self.region, ENV_REGION);
        fill(&mut self.bucket, ENV_BUCKET_NAME);
        fill(&mut self.path_prefix, ENV_BUCKET_PATH);
        fill(&mut self.endpoint, ENV_ENDPOINT);
        self
    }

    /// The bucket name, or a configuration error.
    pub fn require_bucket(&self) -> TransportResult<&str> {
        self.bucket
            .as_deref()
            .ok_or_else(|| TransportError::Config("object store bucket is not set".to_string()))
    }
}

impl fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("path_prefix", &self.path_prefix)
            .field("allow_http", &self.allow_http)
            .field("flush", &self.flush)
            .finish()
    }
}

/// Which transport to build, as read from a config file:
///
/// ```toml
/// kind = "sqlite"
/// base_path = "/var/lib/keel"
/// scope = "Cache"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Memory,
    Disk(DiskConfig),
    Sqlite(SqliteConfig),
    ObjectStore(ObjectStoreConfig),
}

impl TransportConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> TransportResult<Self> {
        toml::from_str(text).map_err(|e| TransportError::Config(e.to_string()))
    }

    /// Construct the configured transport.
    ///
    /// Object store transports spawn their flush worker, so this must run
    /// inside a tokio runtime for that kind.
    pub fn build(&self) -> TransportResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match self {
            Self::Memory => Arc::new(MemoryTransport::new()),
            Self::Disk(config) => Arc::new(DiskTransport::new(config)?),
            Self::Sqlite(config) => Arc::new(SqliteTransport::new(config)?),
            Self::ObjectStore(config) => Arc::new(ObjectStoreTransport::s3(config, TransportHooks::default())?),
        };
        Ok(transport)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Sqlite(SqliteConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let flush = FlushConfig::default();
        assert_eq!(flush.flush_interval(), Duration::from_millis(500));
        assert_eq!(flush.batch_size, 1000);
        assert!(!flush.continue_on_error);

        let sqlite = SqliteConfig::default();
        assert_eq!(sqlite.application_name, "Keel");
        assert_eq!(sqlite.scope, "Data");

        assert_eq!(DiskConfig::default().application_scope, "Objects");
    }

    #[test]
    fn parse_sqlite_from_toml() {
        let config = TransportConfig::from_toml_str(
            r#"
            kind = "sqlite"
            base_path = "/tmp/keel"
            scope = "Cache"
            "#,
        )
        .unwrap();
        match config {
            TransportConfig::Sqlite(c) => {
                assert_eq!(c.base_path, PathBuf::from("/tmp/keel"));
                assert_eq!(c.scope, "Cache");
                assert_eq!(c.application_name, "Keel");
                assert_eq!(c.batch_size, 1000);
            }
            other => panic!("expected sqlite, got {other:?}"),
        }
    }

    #[test]
    fn parse_object_store_with_nested_flush() {
        let config = TransportConfig::from_toml_str(
            r#"
            kind = "object_store"
            bucket = "models"
            path_prefix = "streams/main"

            [flush]
            flush_interval_ms = 50
            continue_on_error = true
            "#,
        )
        .unwrap();
        let TransportConfig::ObjectStore(c) = config else {
            panic!("expected object_store");
        };
        assert_eq!(c.bucket.as_deref(), Some("models"));
        assert_eq!(c.flush.flush_interval_ms, 50);
        assert!(c.flush.continue_on_error);
        assert_eq!(c.flush.batch_size, 1000);
    }

    #[test]
    fn parse_memory_and_reject_unknown_kind() {
        assert_eq!(
            TransportConfig::from_toml_str("kind = \"memory\"").unwrap(),
            TransportConfig::Memory
        );
        let err = TransportConfig::from_toml_str("kind = \"ftp\"").unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn explicit_settings_beat_environment() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BUCKET_NAME, "from-env"),
            (ENV_REGION, "eu-west-1"),
            (ENV_SECRET_KEY, ""),
        ]);
        let config = ObjectStoreConfig {
            bucket: Some("explicit".to_string()),
            ..Default::default()
        }
        .with_fallback(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bucket.as_deref(), Some("explicit"));
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.secret_key, None);
        assert_eq!(config.require_bucket().unwrap(), "explicit");
    }

    #[test]
    fn missing_bucket_is_a_config_error() {
        let err = ObjectStoreConfig::default().require_bucket().unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = ObjectStoreConfig {
            secret_key: Some("hunter2".to_string()),
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn build_disk_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = TransportConfig::Disk(DiskConfig {
            base_path: dir.path().to_path_buf(),
            application_scope: "Scope".to_string(),
        });
        let transport = config.build().unwrap();
        assert_eq!(transport.name(), "Disk");
        assert!(dir.path().join("Scope").is_dir());
    }
}
