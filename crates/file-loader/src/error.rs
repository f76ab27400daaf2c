use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

/// Failures raised by a [`Transport`](crate::transport::Transport) while
/// fetching a single URL, or while following its redirects.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {after:?}")]
    Timeout {
        after: Duration,
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("Server returned status code {0}")]
    Status(StatusCode),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Redirect status {0} without a usable Location header")]
    BadRedirect(StatusCode),

    #[error("Transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Http(Arc::new(err))
    }
}

// Cloneable so that every caller joined on one fetch receives the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Network offline")]
    NetworkOffline,

    #[error("Failed to fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to save data to {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    #[error("Invalid invocation: {0}")]
    Invocation(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Metadata serialization error: {0}")]
    Metadata(Arc<serde_json::Error>),

    #[error("Failed to initialize file loader: {0}")]
    Init(String),

    #[error("Fetch task failed: {0}")]
    TaskFailed(String),
}

impl CacheError {
    pub(crate) fn transport(url: impl Into<String>, source: TransportError) -> Self {
        CacheError::Transport {
            url: url.into(),
            source,
        }
    }

    /// Whether this error was caused by the network rather than local state.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            CacheError::NetworkOffline | CacheError::Transport { .. }
        )
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Metadata(Arc::new(err))
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
