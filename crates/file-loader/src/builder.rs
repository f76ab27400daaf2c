//! # Builder for LoaderConfig
//!
//! Fluent construction of [`LoaderConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use file_loader::LoaderConfig;
//!
//! let config = LoaderConfig::builder()
//!     .with_ttl(Duration::from_secs(15 * 60))
//!     .with_max_concurrent_requests(4)
//!     .with_cache_directory("thumbnails")
//!     .build();
//!
//! assert_eq!(config.max_concurrent_requests, 4);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::LoaderConfig;

/// Builder for creating LoaderConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
        }
    }

    /// Set the key of the durable metadata property
    pub fn with_property_key(mut self, key: impl Into<String>) -> Self {
        self.config.cache_property_key = key.into();
        self
    }

    /// Set how long an unused cached file stays fresh
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Set the name of the cache directory
    pub fn with_cache_directory(mut self, name: impl Into<String>) -> Self {
        self.config.cache_directory = name.into();
        self
    }

    /// Set the root directory, overriding the platform data directory
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.cache_root = Some(root.into());
        self
    }

    /// Set the maximum number of simultaneous transport operations.
    /// Zero is raised to one.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = max.max(1);
        self
    }

    /// Set the default per-request transport timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the maximum number of redirect hops per request
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Build the LoaderConfig instance
    pub fn build(self) -> LoaderConfig {
        self.config
    }
}

impl Default for LoaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
