//! # Cache Entry
//!
//! [`CacheStore`] owns the cache directory, the TTL and the metadata store.
//! [`CacheEntry`] is the value object for one cached resource; it is built on
//! demand from an id and keeps a handle to its store so that its own
//! mutations persist.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, warn};

use crate::config::LoaderConfig;
use crate::error::Result;
use crate::identity::{content_fingerprint, resource_id};
use crate::metadata::{EntryMeta, FilePropertyStore, MetadataStore, PropertyStore};

const TEMP_EXTENSION: &str = "tmp";

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Shared on-disk cache state: where files live, how long they stay fresh,
/// and the metadata describing them.
pub struct CacheStore {
    cache_dir: PathBuf,
    ttl: Duration,
    metadata: Mutex<MetadataStore>,
}

impl CacheStore {
    /// Open the cache described by `config`, keeping metadata in a JSON
    /// property file next to the cache directory.
    pub fn open(config: &LoaderConfig) -> Result<Arc<Self>> {
        let backend = Arc::new(FilePropertyStore::new(config.resolved_root()));
        Self::with_backend(
            config.cache_dir(),
            config.ttl,
            config.cache_property_key.clone(),
            backend,
        )
    }

    /// Open a cache with an explicit metadata backend.
    pub fn with_backend(
        cache_dir: impl Into<PathBuf>,
        ttl: Duration,
        property_key: impl Into<String>,
        backend: Arc<dyn PropertyStore>,
    ) -> Result<Arc<Self>> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;

        let metadata = MetadataStore::load(property_key, backend);
        debug!(dir = ?cache_dir, entries = metadata.len(), "Opened cache store");

        Ok(Arc::new(Self {
            cache_dir,
            ttl,
            metadata: Mutex::new(metadata),
        }))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build the entry for a URL.
    pub fn entry_for_url(self: &Arc<Self>, url: &str) -> CacheEntry {
        self.entry(resource_id(url))
    }

    /// Build the entry for an id, loading its persisted state if any.
    ///
    /// Metadata alone does not make an entry cached: the file has to exist.
    pub fn entry(self: &Arc<Self>, id: impl Into<String>) -> CacheEntry {
        let id = id.into();
        let path = self.cache_dir.join(&id);
        let meta = self.metadata.lock().get(&id).cloned();

        let mut entry = CacheEntry {
            store: Arc::clone(self),
            id,
            path,
            last_used_at: 0,
            fingerprint: None,
            is_cached: false,
            downloaded: false,
            pending: false,
        };

        if let Some(meta) = meta {
            entry.is_cached = entry.exists();
            entry.last_used_at = meta.last_used_at;
            entry.fingerprint = meta.fingerprint;
        }
        entry
    }

    /// Ids of every entry in the metadata store.
    pub fn ids(&self) -> Vec<String> {
        self.metadata.lock().ids()
    }

    pub fn len(&self) -> usize {
        self.metadata.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.metadata.lock().contains(id)
    }

    /// Delete temporary files left behind by interrupted writes.
    ///
    /// Must not race with an in-progress write, whose rename would then fail.
    pub fn remove_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for dirent in std::fs::read_dir(&self.cache_dir)? {
            let path = dirent?.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) && path.is_file() {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if removed > 0 {
            debug!(dir = ?self.cache_dir, removed, "Removed stray temporary files");
        }
        Ok(removed)
    }

    fn set_meta(&self, id: &str, meta: EntryMeta) -> Result<()> {
        self.metadata.lock().set(id, meta)
    }

    fn delete_meta(&self, id: &str) -> Result<()> {
        self.metadata.lock().delete(id)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("cache_dir", &self.cache_dir)
            .field("ttl", &self.ttl)
            .field("metadata", &*self.metadata.lock())
            .finish()
    }
}

/// One cached (or cacheable) resource.
#[derive(Clone)]
pub struct CacheEntry {
    store: Arc<CacheStore>,
    id: String,
    path: PathBuf,
    last_used_at: u64,
    fingerprint: Option<String>,
    is_cached: bool,
    downloaded: bool,
    pending: bool,
}

impl CacheEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn is_cached(&self) -> bool {
        self.is_cached
    }

    /// Whether the bytes were written by the fetch that produced this entry.
    pub fn downloaded(&self) -> bool {
        self.downloaded
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_used_at(&self) -> u64 {
        self.last_used_at
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub(crate) fn set_downloaded(&mut self, downloaded: bool) {
        self.downloaded = downloaded;
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    /// Write `data` to the local path and refresh the fingerprint.
    ///
    /// Returns whether the file is present afterwards; success of the write
    /// itself is not taken as proof.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<bool> {
        let temp_path = self.path.with_extension(TEMP_EXTENSION);

        if let Err(e) = fs::write(&temp_path, data).await {
            warn!(path = ?temp_path, error = %e, "Failed to write cache data file");
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            warn!(from = ?temp_path, to = ?self.path, error = %e, "Failed to rename temporary data file");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        self.fingerprint = Some(content_fingerprint(data));
        debug!(id = %self.id, size = data.len(), "Wrote cache file");
        Ok(self.exists())
    }

    pub fn update_last_used_at(&mut self) -> &mut Self {
        self.last_used_at = now_millis();
        self
    }

    /// Persist this entry's metadata and mark it cached.
    pub fn save(&mut self) -> Result<&mut Self> {
        self.persist()?;
        self.is_cached = true;
        Ok(self)
    }

    fn persist(&self) -> Result<()> {
        self.store.set_meta(
            &self.id,
            EntryMeta {
                last_used_at: self.last_used_at,
                fingerprint: self.fingerprint.clone(),
            },
        )
    }

    /// Whether more than the TTL has passed since this entry was last used.
    ///
    /// With `invalidate`, the entry is first aged to the epoch and persisted,
    /// so every later check (from any caller) sees it as expired.
    pub fn expired(&mut self, invalidate: bool) -> Result<bool> {
        if invalidate {
            self.last_used_at = 0;
            // Never create metadata for an entry that was not stored.
            if self.store.contains(&self.id) {
                self.persist()?;
            }
        }
        Ok(self.is_expired())
    }

    pub fn is_expired(&self) -> bool {
        let age = now_millis().saturating_sub(self.last_used_at);
        u128::from(age) > self.store.ttl().as_millis()
    }

    /// Delete the cached file and forget its metadata.
    pub fn expunge(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_meta(&self.id)?;
        self.is_cached = false;
        debug!(id = %self.id, "Expunged cache entry");
        Ok(())
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} file",
            self.id,
            if self.is_cached { "cached" } else { "new" }
        )?;
        if self.pending {
            f.write_str(" (pending)")?;
        }
        if self.downloaded {
            f.write_str(" (downloaded)")?;
        }
        if self.is_expired() {
            f.write_str(" (expired)")?;
        }
        if self.last_used_at > 0 {
            write!(f, ", last used: {}", self.last_used_at)?;
        }
        if let Some(fingerprint) = &self.fingerprint {
            write!(f, ", fingerprint: {fingerprint}")?;
        }
        write!(f, " {}", self.path.display())
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("last_used_at", &self.last_used_at)
            .field("fingerprint", &self.fingerprint)
            .field("is_cached", &self.is_cached)
            .field("downloaded", &self.downloaded)
            .field("pending", &self.pending)
            .finish()
    }
}
