//! # File Loader
//!
//! A caching downloader for remotely fetched files on resource-constrained
//! clients. A file is fetched once, stored under a cache directory and
//! served from disk until it has gone unused for longer than the configured
//! TTL.
//!
//! ## Features
//!
//! - Deterministic, filesystem-safe ids derived from URLs
//! - One fetch per URL no matter how many callers ask concurrently
//! - Bounded number of simultaneous network transfers, admitted FIFO
//! - Explicit redirect handling with a hop limit
//! - Unchanged downloads detected by content fingerprint and not rewritten
//! - Garbage collection of stale entries
//!
//! ```no_run
//! use file_loader::{FileLoader, LoaderConfig, RequestOptions};
//!
//! # async fn run() -> Result<(), file_loader::CacheError> {
//! let loader = FileLoader::new(LoaderConfig::default())?;
//! let entry = loader
//!     .request("https://example.com/image.png", RequestOptions::default())
//!     .await?;
//! println!("{}", entry.local_path().display());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod connectivity;
pub mod entry;
pub mod error;
pub mod gate;
pub mod gc;
pub mod identity;
pub mod loader;
pub mod metadata;
pub mod progress;
pub mod transport;

pub use builder::LoaderConfigBuilder;
pub use config::LoaderConfig;
pub use connectivity::{AlwaysOnline, Connectivity, ManualConnectivity};
pub use entry::{CacheEntry, CacheStore};
pub use error::{CacheError, TransportError};
pub use gc::{GarbageCollector, PruneReport};
pub use identity::{content_fingerprint, resource_id};
pub use loader::{FileLoader, FileLoaderBuilder, RequestOptions};
pub use metadata::{EntryMeta, FilePropertyStore, MemoryPropertyStore, MetadataStore, PropertyStore};
pub use progress::{Progress, ProgressCallback, ProgressSink};
pub use transport::{ReqwestTransport, Transport, TransportOptions, TransportResponse, create_client};
