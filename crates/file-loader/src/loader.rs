//! # File Loader
//!
//! The download coordinator. A [`FileLoader`] resolves a URL to a
//! [`CacheEntry`], serving fresh entries from disk and otherwise fetching the
//! resource through its [`Transport`].
//!
//! - At most one fetch per resource id is outstanding; later callers join it.
//! - At most `max_concurrent_requests` fetches talk to the network at once;
//!   the rest wait in FIFO order.
//! - Redirects are followed here, inside the same fetch, up to
//!   `max_redirects` hops.
//! - Unchanged content (same fingerprint) is not rewritten.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::LoaderConfig;
use crate::connectivity::{AlwaysOnline, Connectivity};
use crate::entry::{CacheEntry, CacheStore};
use crate::error::{CacheError, Result, TransportError};
use crate::gate::{AdmissionGate, GatePermit, Ticket};
use crate::gc::{GarbageCollector, PruneReport};
use crate::identity::{content_fingerprint, resource_id};
use crate::metadata::PropertyStore;
use crate::progress::{Progress, ProgressCallback, ProgressSink};
use crate::transport::{ReqwestTransport, Transport, TransportOptions, TransportResponse};

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry>>>;

/// Per-request options.
#[derive(Clone)]
pub struct RequestOptions {
    /// Skip the freshness check and always rewrite the file
    pub force: bool,
    /// Fail fast with [`CacheError::NetworkOffline`] when the connectivity
    /// probe reports no network
    pub offline_check: bool,
    /// Receives download progress of the fetch serving this request
    pub on_progress: Option<ProgressCallback>,
    /// Passed through to the transport
    pub transport: TransportOptions,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            force: false,
            offline_check: true,
            on_progress: None,
            transport: TransportOptions::default(),
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_offline_check(mut self, enabled: bool) -> Self {
        self.offline_check = enabled;
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("force", &self.force)
            .field("offline_check", &self.offline_check)
            .field("on_progress", &self.on_progress.is_some())
            .field("transport", &self.transport)
            .finish()
    }
}

struct InFlight {
    fetch: SharedFetch,
    progress: ProgressSink,
}

struct Inner {
    config: LoaderConfig,
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn Connectivity>,
    gate: AdmissionGate,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Caching downloader. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FileLoader {
    inner: Arc<Inner>,
}

enum Admission {
    Fresh(CacheEntry),
    Wait(SharedFetch),
}

impl FileLoader {
    /// Create a loader with the reqwest transport and on-disk metadata.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: LoaderConfig) -> FileLoaderBuilder {
        FileLoaderBuilder::new(config)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    /// Number of fetches currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Number of fetches currently admitted past the gate.
    pub fn active_transfers(&self) -> usize {
        self.inner.gate.active()
    }

    /// Resolve `url` to a cached entry, fetching it if needed.
    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<CacheEntry> {
        let parsed = Url::parse(url)
            .map_err(|e| CacheError::Invocation(format!("invalid URL {url}: {e}")))?;
        let id = resource_id(url);

        match self.admit(id, parsed, options)? {
            Admission::Fresh(entry) => {
                let entry = touch(entry).await?;
                debug!(url = %url, entry = %entry, "Serving cached file");
                Ok(entry)
            }
            Admission::Wait(fetch) => fetch.await,
        }
    }

    /// Callback-style front end over [`request`](Self::request).
    pub fn request_with_callbacks<L, E>(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
        on_load: L,
        on_error: E,
    ) -> JoinHandle<()>
    where
        L: FnOnce(CacheEntry) + Send + 'static,
        E: FnOnce(CacheError) + Send + 'static,
    {
        let loader = self.clone();
        let url = url.into();
        tokio::spawn(async move {
            match loader.request(&url, options).await {
                Ok(entry) => on_load(entry),
                Err(e) => on_error(e),
            }
        })
    }

    // Join, serve from cache, reject, or start a fetch. The in-flight lookup,
    // the gate reservation and the insert happen under a single lock
    // acquisition, so queue order is request order.
    fn admit(&self, id: String, url: Url, options: RequestOptions) -> Result<Admission> {
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(flight) = in_flight.get(&id) {
            debug!(id = %id, url = %url, "Joining in-flight fetch");
            if let Some(callback) = options.on_progress {
                flight.progress.subscribe(callback);
            }
            return Ok(Admission::Wait(flight.fetch.clone()));
        }

        let entry = self.inner.store.entry(id.clone());
        if !options.force && entry.is_cached() && !entry.is_expired() {
            return Ok(Admission::Fresh(entry));
        }

        if options.offline_check && !self.inner.connectivity.is_online() {
            debug!(id = %id, url = %url, "Rejecting request, network offline");
            return Err(CacheError::NetworkOffline);
        }

        let ticket = self.inner.gate.reserve()?;

        let progress = ProgressSink::new();
        if let Some(callback) = options.on_progress.clone() {
            progress.subscribe(callback);
        }

        let task = FetchTask {
            inner: Arc::clone(&self.inner),
            id: id.clone(),
            url,
            options,
            progress: progress.clone(),
        };
        let handle = tokio::spawn(task.run(ticket));
        let fetch = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(CacheError::TaskFailed(e.to_string())))
        }
        .boxed()
        .shared();

        in_flight.insert(
            id,
            InFlight {
                fetch: fetch.clone(),
                progress,
            },
        );
        Ok(Admission::Wait(fetch))
    }

    /// Expunge expired entries, or all entries when `force` is set.
    pub fn prune(&self, force: bool) -> Result<PruneReport> {
        GarbageCollector::new(Arc::clone(&self.inner.store)).prune(force)
    }

    /// Alias of [`prune`](Self::prune).
    pub fn gc(&self, force: bool) -> Result<PruneReport> {
        self.prune(force)
    }

    /// Sweep expired entries every `interval` until the handle is aborted.
    pub fn spawn_gc_task(&self, interval: Duration) -> JoinHandle<()> {
        let collector = GarbageCollector::new(Arc::clone(&self.inner.store));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let collector = collector.clone();
                match tokio::task::spawn_blocking(move || collector.prune(false)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Cache sweep failed"),
                    Err(e) => warn!(error = %e, "Cache sweep task failed"),
                }
            }
        })
    }

    /// Stop admitting fetches. Queued and future fetches fail with
    /// [`CacheError::Invocation`]; fetches already admitted run to completion.
    pub fn shutdown(&self) {
        self.inner.gate.close();
        debug!("File loader shut down");
    }
}

impl fmt::Debug for FileLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLoader")
            .field("store", &self.inner.store)
            .field("in_flight", &self.in_flight())
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}

/// Removes the in-flight record, then releases the gate slot, however the
/// fetch ends.
struct FlightGuard {
    inner: Arc<Inner>,
    id: String,
    permit: Option<GatePermit>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.id);
        self.permit.take();
    }
}

struct FetchTask {
    inner: Arc<Inner>,
    id: String,
    url: Url,
    options: RequestOptions,
    progress: ProgressSink,
}

impl FetchTask {
    async fn run(self, ticket: Ticket) -> Result<CacheEntry> {
        let mut guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            id: self.id.clone(),
            permit: None,
        };
        guard.permit = Some(ticket.admitted().await?);

        let mut entry = self.inner.store.entry(self.id.clone());
        entry.set_pending(true);
        debug!(url = %self.url, entry = %entry, "Downloading");

        let response = self.fetch_following_redirects().await?;

        let fingerprint = content_fingerprint(&response.body);
        if self.options.force || !entry.exists() || entry.fingerprint() != Some(fingerprint.as_str())
        {
            let path = entry.local_path().to_path_buf();
            match entry.write(&response.body).await {
                Ok(true) => entry.set_downloaded(true),
                Ok(false) => return Err(CacheError::Write { path, source: None }),
                Err(e) => {
                    return Err(CacheError::Write {
                        path,
                        source: Some(Arc::new(e)),
                    });
                }
            }
        } else {
            debug!(id = %self.id, "Content unchanged, skipping write");
        }

        let mut entry = touch(entry).await?;
        entry.set_pending(false);
        debug!(url = %self.url, entry = %entry, "Fetch complete");
        Ok(entry)
    }

    async fn fetch_following_redirects(&self) -> Result<TransportResponse> {
        let timeout = self
            .options
            .transport
            .timeout
            .unwrap_or(self.inner.config.timeout);
        let max_redirects = self.inner.config.max_redirects;
        let mut url = self.url.clone();
        let mut hops = 0;

        loop {
            let response = self
                .inner
                .transport
                .fetch(&url, &self.options.transport, timeout, &self.progress)
                .await
                .map_err(|e| CacheError::transport(url.as_str(), e))?;
            let status = response.status;

            if status.is_success() {
                return Ok(response);
            }

            if !status.is_redirection() {
                return Err(CacheError::transport(
                    url.as_str(),
                    TransportError::Status(status),
                ));
            }

            let Some(next) = response
                .location
                .as_deref()
                .and_then(|location| url.join(location).ok())
            else {
                return Err(CacheError::transport(
                    url.as_str(),
                    TransportError::BadRedirect(status),
                ));
            };

            if hops >= max_redirects {
                return Err(CacheError::transport(
                    self.url.as_str(),
                    TransportError::TooManyRedirects(max_redirects),
                ));
            }
            hops += 1;
            debug!(from = %url, to = %next, status = %status, hop = hops, "Following redirect");
            url = next;
        }
    }
}

/// Stamp `entry` as used now and persist it. Metadata persistence is
/// blocking file I/O, so it runs on the blocking pool.
async fn touch(mut entry: CacheEntry) -> Result<CacheEntry> {
    tokio::task::spawn_blocking(move || {
        entry.update_last_used_at().save()?;
        Ok(entry)
    })
    .await
    .map_err(|e| CacheError::TaskFailed(e.to_string()))?
}

/// Assembles a [`FileLoader`] from its collaborators.
pub struct FileLoaderBuilder {
    config: LoaderConfig,
    transport: Option<Arc<dyn Transport>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    property_store: Option<Arc<dyn PropertyStore>>,
}

impl FileLoaderBuilder {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            transport: None,
            connectivity: None,
            property_store: None,
        }
    }

    /// Use a custom transport instead of reqwest.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a connectivity probe. Without one the loader assumes it is online.
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Keep metadata in a custom property backend instead of a JSON file.
    pub fn with_property_store(mut self, store: Arc<dyn PropertyStore>) -> Self {
        self.property_store = Some(store);
        self
    }

    pub fn build(self) -> Result<FileLoader> {
        let config = self.config;

        let store = match self.property_store {
            Some(backend) => CacheStore::with_backend(
                config.cache_dir(),
                config.ttl,
                config.cache_property_key.clone(),
                backend,
            )?,
            None => CacheStore::open(&config)?,
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(&config).map_err(|e| CacheError::Init(e.to_string()))?,
            ),
        };

        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(AlwaysOnline));
        let gate = AdmissionGate::new(config.max_concurrent_requests);

        debug!(
            dir = ?store.cache_dir(),
            ttl = ?config.ttl,
            max_concurrent = gate.capacity(),
            "File loader ready"
        );

        Ok(FileLoader {
            inner: Arc::new(Inner {
                config,
                store,
                transport,
                connectivity,
                gate,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }
}
