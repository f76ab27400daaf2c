use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROPERTY_KEY: &str = "file_loader_cache_metadata";
pub const DEFAULT_CACHE_DIRECTORY: &str = "cached_files";
const DEFAULT_USER_AGENT: &str = concat!("file-loader/", env!("CARGO_PKG_VERSION"));

/// Configurable options for the file loader.
///
/// Field names follow the loader's configuration keys so the struct can be
/// deserialized straight from an application config file; durations are
/// expressed in milliseconds there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Key of the durable property holding the cache metadata
    pub cache_property_key: String,

    /// Time since last use after which a cached file is stale
    #[serde(rename = "cache_expiration", with = "duration_ms")]
    pub ttl: Duration,

    /// Name of the directory holding cached files
    pub cache_directory: String,

    /// Directory the cache directory and metadata property live under.
    /// Defaults to the platform data directory.
    pub cache_root: Option<PathBuf>,

    /// Maximum number of simultaneous transport operations
    #[serde(rename = "cache_requests")]
    pub max_concurrent_requests: usize,

    /// Per-request transport timeout
    #[serde(rename = "http_timeout", with = "duration_ms")]
    pub timeout: Duration,

    /// Maximum redirect hops followed for one request
    pub max_redirects: usize,

    /// User agent string
    pub user_agent: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_property_key: DEFAULT_PROPERTY_KEY.to_owned(),
            ttl: Duration::from_millis(3_600_000), // 1 hour
            cache_directory: DEFAULT_CACHE_DIRECTORY.to_owned(),
            cache_root: None,
            max_concurrent_requests: 10,
            timeout: Duration::from_millis(10_000),
            max_redirects: 5,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl LoaderConfig {
    pub fn builder() -> crate::builder::LoaderConfigBuilder {
        crate::builder::LoaderConfigBuilder::new()
    }

    /// Parse a configuration from JSON, filling absent keys with defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Root directory for cache files and metadata.
    ///
    /// Uses the configured root if set, otherwise the platform data directory
    /// (application support on macOS), falling back to the system temp dir.
    pub fn resolved_root(&self) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("file-loader")
    }

    /// Full path of the directory holding cached files.
    pub fn cache_dir(&self) -> PathBuf {
        self.resolved_root().join(&self.cache_directory)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
