//! Progress side channel for in-flight downloads.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Download progress of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes received so far
    pub received: u64,
    /// Expected total, when the server announced one
    pub total: Option<u64>,
}

impl Progress {
    /// Completed fraction in `0.0..=1.0`, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.received as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Fans progress of one fetch out to every caller joined on it.
#[derive(Clone, Default)]
pub struct ProgressSink {
    subscribers: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: ProgressCallback) {
        self.subscribers.lock().push(callback);
    }

    pub fn report(&self, progress: Progress) {
        // Snapshot first so callbacks may subscribe without deadlocking.
        let subscribers = self.subscribers.lock().clone();
        for callback in subscribers {
            callback(progress);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
