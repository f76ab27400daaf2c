use std::sync::Arc;

use file_loader::{FileLoader, LoaderConfig, ManualConnectivity, RequestOptions, TransportOptions};
use futures::future::join_all;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::headers::parse_headers;

/// Options for the `get` command
pub struct GetOptions<'a> {
    pub urls: &'a [String],
    pub force: bool,
    pub headers: &'a [String],
}

/// Build the loader. With `offline` set, connectivity reports no network, so
/// only fresh cached entries are served.
pub fn open_loader(config: LoaderConfig, offline: bool) -> Result<FileLoader, AppError> {
    let loader = FileLoader::builder(config)
        .with_connectivity(Arc::new(ManualConnectivity::new(!offline)))
        .build()?;
    Ok(loader)
}

/// Resolve every URL concurrently and print where each file lives.
pub async fn get(loader: &FileLoader, options: GetOptions<'_>) -> Result<(), AppError> {
    let transport = TransportOptions {
        headers: parse_headers(options.headers)?,
        ..TransportOptions::default()
    };

    let requests = options.urls.iter().map(|url| {
        let request = RequestOptions::new()
            .with_force(options.force)
            .with_transport(transport.clone());
        async move { (url, loader.request(url, request).await) }
    });

    let total = options.urls.len();
    let mut failed = 0;
    for (url, result) in join_all(requests).await {
        match result {
            Ok(entry) => {
                let state = if entry.downloaded() {
                    "downloaded"
                } else {
                    "cached"
                };
                println!("{url} -> {} ({state})", entry.local_path().display());
            }
            Err(e) => {
                failed += 1;
                error!(url = %url, error = %e, "Request failed");
            }
        }
    }

    if failed > 0 {
        return Err(AppError::RequestsFailed { failed, total });
    }
    info!("Resolved {total} URL(s)");
    Ok(())
}

/// Run one garbage collection pass.
pub fn gc(loader: &FileLoader, force: bool) -> Result<(), AppError> {
    let report = loader.gc(force)?;
    println!(
        "Scanned {} entries, removed {} (and {} temporary files)",
        report.scanned, report.expunged, report.temp_files
    );
    Ok(())
}

pub fn show_config(config: &AppConfig) -> Result<(), AppError> {
    println!("{}", config.show()?);
    Ok(())
}

pub fn show_config_path() -> Result<(), AppError> {
    let path = AppConfig::default_config_path().ok_or_else(|| {
        AppError::Initialization("no configuration directory on this platform".to_string())
    })?;
    println!("{}", path.display());
    Ok(())
}
