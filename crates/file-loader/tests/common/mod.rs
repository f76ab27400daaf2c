#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use file_loader::{
    Connectivity, FileLoader, LoaderConfig, MemoryPropertyStore, Progress, ProgressSink,
    Transport, TransportError, TransportOptions, TransportResponse,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Scripted in-memory transport.
///
/// Responses are queued per URL; the last queued response repeats. URLs with
/// no script answer 200 with the URL itself as body. In held mode every
/// fetch blocks until the test releases it.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<TransportResponse, TransportError>>>>,
    calls: Mutex<Vec<(Url, TransportOptions, Duration)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    release: Semaphore,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_permits(Semaphore::MAX_PERMITS))
    }

    /// Every fetch waits for [`release`](Self::release).
    pub fn held() -> Arc<Self> {
        Arc::new(Self::with_permits(0))
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            release: Semaphore::new(permits),
        }
    }

    pub fn script(&self, url: &str, response: Result<TransportResponse, TransportError>) {
        self.scripts
            .lock()
            .entry(url.to_owned())
            .or_default()
            .push_back(response);
    }

    pub fn respond(&self, url: &str, body: &'static str) {
        self.script(url, Ok(TransportResponse::ok(Bytes::from_static(body.as_bytes()))));
    }

    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn called_urls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(u, _, _)| u.to_string()).collect()
    }

    pub fn call(&self, index: usize) -> (Url, TransportOptions, Duration) {
        self.calls.lock()[index].clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &Url) -> Result<TransportResponse, TransportError> {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(url.as_str()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Ok(TransportResponse::ok(Bytes::from(url.to_string()))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        url: &Url,
        options: &TransportOptions,
        timeout: Duration,
        progress: &ProgressSink,
    ) -> Result<TransportResponse, TransportError> {
        self.calls
            .lock()
            .push((url.clone(), options.clone(), timeout));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        self.release.acquire().await.unwrap().forget();

        self.active.fetch_sub(1, Ordering::SeqCst);
        let response = self.next_response(url);
        if let Ok(response) = &response {
            let len = response.body.len() as u64;
            progress.report(Progress {
                received: len,
                total: Some(len),
            });
        }
        response
    }
}

pub struct Offline;

impl Connectivity for Offline {
    fn is_online(&self) -> bool {
        false
    }
}

pub fn config(root: &std::path::Path) -> LoaderConfig {
    LoaderConfig::builder()
        .with_cache_root(root)
        .with_max_concurrent_requests(10)
        .build()
}

pub fn loader(root: &std::path::Path, transport: Arc<ScriptedTransport>) -> FileLoader {
    loader_with(config(root), transport)
}

pub fn loader_with(config: LoaderConfig, transport: Arc<ScriptedTransport>) -> FileLoader {
    init_tracing();
    FileLoader::builder(config)
        .with_transport(transport)
        .with_property_store(Arc::new(MemoryPropertyStore::new()))
        .build()
        .unwrap()
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
