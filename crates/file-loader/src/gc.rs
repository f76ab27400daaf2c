//! # Garbage Collector
//!
//! Sweeps the metadata store and expunges stale entries.

use std::sync::Arc;

use tracing::info;

use crate::entry::CacheStore;
use crate::error::Result;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Entries examined
    pub scanned: usize,
    /// Entries deleted
    pub expunged: usize,
    /// Leftover temporary files deleted (forced sweeps only)
    pub temp_files: usize,
}

#[derive(Debug, Clone)]
pub struct GarbageCollector {
    store: Arc<CacheStore>,
}

impl GarbageCollector {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Expunge every expired entry, or every entry when `force` is set. A
    /// forced sweep also deletes temporary files left by interrupted writes.
    ///
    /// Runs to completion synchronously. The first entry that cannot be
    /// expunged aborts the sweep and its error is returned; entries already
    /// removed stay removed.
    pub fn prune(&self, force: bool) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for id in self.store.ids() {
            report.scanned += 1;
            let mut entry = self.store.entry(id);
            if force || entry.is_expired() {
                entry.expunge()?;
                report.expunged += 1;
            }
        }

        if force {
            report.temp_files = self.store.remove_temp_files()?;
        }

        info!(
            scanned = report.scanned,
            expunged = report.expunged,
            temp_files = report.temp_files,
            force,
            "Pruned file cache"
        );
        Ok(report)
    }
}
