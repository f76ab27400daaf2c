use anyhow::{Context, Result};
use config::{Config, Environment, File};
use dirs::config_dir;
use file_loader::LoaderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::ConfigOverrides;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Loader settings, using the loader's own key names
    #[serde(flatten)]
    pub loader: LoaderConfig,

    /// Log level filter used when RUST_LOG is unset
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Load configuration from defaults, then the config file, then
    /// `FILE_LOADER__*` environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        if let Some(path) = config_path {
            // An explicitly requested file must exist.
            builder = builder.add_source(File::from(path));
        } else if let Some(default_path) = Self::default_config_path() {
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FILE_LOADER")
                .prefix_separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("file-loader").join("config.toml"))
    }

    /// Apply command-line overrides
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(root) = &overrides.cache_root {
            self.loader.cache_root = Some(root.clone());
        }
        if let Some(ttl) = overrides.ttl_ms {
            self.loader.ttl = Duration::from_millis(ttl);
        }
        if let Some(max) = overrides.max_concurrent {
            self.loader.max_concurrent_requests = max.max(1);
        }
        if let Some(timeout) = overrides.timeout_ms {
            self.loader.timeout = Duration::from_millis(timeout);
        }
    }

    /// Show current configuration as a formatted string
    pub fn show(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration for display")
    }
}
