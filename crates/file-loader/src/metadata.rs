//! # Metadata Store
//!
//! Persists the mapping from resource id to `{last_used_at, fingerprint}`.
//! The mapping lives in memory and is rewritten wholesale into a single
//! durable property after every mutation.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Durable key-value property backend.
pub trait PropertyStore: Send + Sync {
    /// Read the raw value of a property, `None` if it was never written.
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace the raw value of a property.
    fn store(&self, key: &str, value: &[u8]) -> io::Result<()>;
}

/// Stores each property as `<root>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FilePropertyStore {
    root: PathBuf,
}

impl FilePropertyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn property_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl PropertyStore for FilePropertyStore {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.property_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, key: &str, value: &[u8]) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let path = self.property_path(key);
        let temp_path = path.with_extension("tmp");

        std::fs::write(&temp_path, value)?;
        if let Err(e) = std::fs::rename(&temp_path, &path) {
            warn!(from = ?temp_path, to = ?path, error = %e, "Failed to rename temporary property file");
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(())
    }
}

/// In-process property backend, nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryPropertyStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.values.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

/// Persisted state of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Milliseconds since the UNIX epoch of the last request served
    pub last_used_at: u64,
    /// Fingerprint of the bytes on disk
    pub fingerprint: Option<String>,
}

pub struct MetadataStore {
    key: String,
    entries: BTreeMap<String, EntryMeta>,
    backend: Arc<dyn PropertyStore>,
}

impl MetadataStore {
    /// Load the mapping held by property `key`.
    ///
    /// A missing property is an empty cache. An unreadable or corrupt one is
    /// logged and treated as empty, so the next save overwrites it.
    pub fn load(key: impl Into<String>, backend: Arc<dyn PropertyStore>) -> Self {
        let key = key.into();
        let entries = match backend.load(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to parse cache metadata, starting empty");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache metadata, starting empty");
                BTreeMap::new()
            }
        };

        debug!(key = %key, entries = entries.len(), "Loaded cache metadata");
        Self {
            key,
            entries,
            backend,
        }
    }

    pub fn get(&self, id: &str) -> Option<&EntryMeta> {
        self.entries.get(id)
    }

    pub fn set(&mut self, id: impl Into<String>, meta: EntryMeta) -> Result<()> {
        self.entries.insert(id.into(), meta);
        self.save()
    }

    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.entries.remove(id);
        self.save()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of every id currently stored.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the full mapping.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec(&self.entries)?;
        self.backend.store(&self.key, &json)?;
        Ok(())
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("key", &self.key)
            .field("entries", &self.entries.len())
            .finish()
    }
}
