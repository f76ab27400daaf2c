mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use file_loader::{
    CacheError, FileLoader, LoaderConfig, ManualConnectivity, RequestOptions, TransportError,
    TransportOptions, TransportResponse, content_fingerprint, resource_id,
};
use reqwest::StatusCode;

use common::{Offline, ScriptedTransport, config, loader, loader_with, wait_for};

const URL: &str = "http://h/a.png";

#[tokio::test]
async fn test_first_request_downloads_and_caches() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.respond(URL, "test data");
    let loader = loader(dir.path(), transport.clone());

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(entry.id(), resource_id(URL));
    assert!(entry.is_cached());
    assert!(entry.downloaded());
    assert!(!entry.is_pending());
    assert_eq!(
        entry.local_path(),
        dir.path().join("cached_files").join(resource_id(URL))
    );
    assert_eq!(std::fs::read(entry.local_path()).unwrap(), b"test data");
    assert_eq!(
        entry.fingerprint(),
        Some(content_fingerprint(b"test data").as_str())
    );
    assert_eq!(loader.in_flight(), 0);
    assert_eq!(loader.active_transfers(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::held();
    transport.respond(URL, "shared");
    let loader = loader(dir.path(), transport.clone());

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.request(URL, RequestOptions::default()).await })
        })
        .collect();

    wait_for(|| transport.calls() == 1).await;
    wait_for(|| loader.in_flight() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.calls(), 1);

    transport.release(1);
    for handle in handles {
        let entry = handle.await.unwrap().unwrap();
        assert_eq!(entry.id(), resource_id(URL));
        assert!(entry.downloaded());
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn test_fresh_entry_skips_transport() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport.clone());

    let first = loader.request(URL, RequestOptions::default()).await.unwrap();
    let second = loader.request(URL, RequestOptions::default()).await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert!(second.is_cached());
    assert!(!second.downloaded());
    assert!(second.last_used_at() >= first.last_used_at());
    assert_eq!(loader.active_transfers(), 0);
}

#[tokio::test]
async fn test_expired_entry_with_same_content_is_not_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.respond(URL, "same bytes");
    let loader = loader(dir.path(), transport.clone());

    loader.request(URL, RequestOptions::default()).await.unwrap();
    assert!(loader.store().entry_for_url(URL).expired(true).unwrap());

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();
    assert_eq!(transport.calls(), 2);
    assert!(!entry.downloaded());
    assert!(entry.is_cached());
    assert!(entry.last_used_at() > 0);
    assert!(!entry.is_expired());
    assert_eq!(
        loader.store().entry_for_url(URL).last_used_at(),
        entry.last_used_at()
    );
}

#[tokio::test]
async fn test_expired_entry_with_changed_content_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.respond(URL, "old");
    transport.respond(URL, "changed_data");
    let loader = loader(dir.path(), transport.clone());

    loader.request(URL, RequestOptions::default()).await.unwrap();
    loader.store().entry_for_url(URL).expired(true).unwrap();

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();
    assert!(entry.downloaded());
    assert_eq!(std::fs::read(entry.local_path()).unwrap(), b"changed_data");
    assert_eq!(
        entry.fingerprint(),
        Some(content_fingerprint(b"changed_data").as_str())
    );
}

#[tokio::test]
async fn test_missing_file_is_refetched_even_if_fingerprint_matches() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport.clone());

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();
    std::fs::remove_file(entry.local_path()).unwrap();

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();
    assert_eq!(transport.calls(), 2);
    assert!(entry.downloaded());
    assert!(entry.exists());
}

#[tokio::test]
async fn test_force_bypasses_freshness() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport.clone());

    loader.request(URL, RequestOptions::default()).await.unwrap();
    let entry = loader
        .request(URL, RequestOptions::new().with_force(true))
        .await
        .unwrap();

    assert_eq!(transport.calls(), 2);
    assert!(entry.downloaded());
}

#[tokio::test]
async fn test_gate_limits_concurrent_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::held();
    let loader = loader_with(
        LoaderConfig {
            max_concurrent_requests: 2,
            ..config(dir.path())
        },
        transport.clone(),
    );

    let mut handles = Vec::new();
    for name in ["a", "b", "c"] {
        let loader = loader.clone();
        let url = format!("http://h/{name}");
        handles.push(tokio::spawn(async move {
            loader.request(&url, RequestOptions::default()).await
        }));
        // Queue in a known order.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    wait_for(|| transport.calls() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.calls(), 2);
    assert_eq!(loader.active_transfers(), 2);
    assert_eq!(loader.in_flight(), 3);
    assert_eq!(
        transport.called_urls(),
        vec!["http://h/a".to_string(), "http://h/b".to_string()]
    );

    transport.release(1);
    wait_for(|| transport.calls() == 3).await;
    assert_eq!(transport.called_urls()[2], "http://h/c");

    transport.release(2);
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_cached());
    }
    assert_eq!(transport.max_active(), 2);
    assert_eq!(loader.active_transfers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_queued_fetches_start_in_request_order() {
    for round in 0..20 {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new();
        let loader = loader_with(
            LoaderConfig {
                max_concurrent_requests: 1,
                ..config(dir.path())
            },
            transport.clone(),
        );

        let urls: Vec<String> = (0..8).map(|i| format!("http://h/{round}/{i}")).collect();
        // join_all polls each request once, in order, before any can finish.
        let results = futures::future::join_all(
            urls.iter()
                .map(|url| loader.request(url, RequestOptions::default())),
        )
        .await;

        for result in results {
            assert!(result.unwrap().downloaded());
        }
        assert_eq!(transport.called_urls(), urls, "round {round}");
        assert_eq!(transport.max_active(), 1);
        assert_eq!(loader.active_transfers(), 0);
    }
}

#[tokio::test]
async fn test_offline_rejects_without_transport() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = FileLoader::builder(config(dir.path()))
        .with_transport(transport.clone())
        .with_connectivity(Arc::new(Offline))
        .with_property_store(Arc::new(file_loader::MemoryPropertyStore::new()))
        .build()
        .unwrap();

    let err = loader
        .request(URL, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NetworkOffline));
    assert!(err.to_string().to_lowercase().contains("offline"));
    assert_eq!(transport.calls(), 0);
    assert_eq!(loader.in_flight(), 0);
    assert_eq!(loader.active_transfers(), 0);

    // With the check disabled the request goes through.
    let entry = loader
        .request(URL, RequestOptions::new().with_offline_check(false))
        .await
        .unwrap();
    assert!(entry.is_cached());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_offline_still_serves_fresh_entries() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let connectivity = Arc::new(ManualConnectivity::new(true));
    let loader = FileLoader::builder(config(dir.path()))
        .with_transport(transport.clone())
        .with_connectivity(connectivity.clone())
        .with_property_store(Arc::new(file_loader::MemoryPropertyStore::new()))
        .build()
        .unwrap();

    loader.request(URL, RequestOptions::default()).await.unwrap();
    connectivity.set_online(false);

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();
    assert!(entry.is_cached());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_redirect_is_followed_under_original_id() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(
        URL,
        Ok(TransportResponse::redirect(StatusCode::FOUND, "/moved.png")),
    );
    transport.respond("http://h/moved.png", "moved data");
    let loader = loader(dir.path(), transport.clone());

    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();

    assert_eq!(
        transport.called_urls(),
        vec![URL.to_string(), "http://h/moved.png".to_string()]
    );
    assert_eq!(transport.max_active(), 1);
    assert_eq!(entry.id(), resource_id(URL));
    assert_eq!(std::fs::read(entry.local_path()).unwrap(), b"moved data");
    assert!(!loader.store().contains(&resource_id("http://h/moved.png")));
}

#[tokio::test]
async fn test_permanent_redirect_to_absolute_location() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(
        URL,
        Ok(TransportResponse::redirect(
            StatusCode::MOVED_PERMANENTLY,
            "http://cdn.example.com/a.png",
        )),
    );
    let loader = loader(dir.path(), transport.clone());

    loader.request(URL, RequestOptions::default()).await.unwrap();
    assert_eq!(transport.called_urls()[1], "http://cdn.example.com/a.png");
}

#[tokio::test]
async fn test_redirect_loop_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(URL, Ok(TransportResponse::redirect(StatusCode::FOUND, URL)));
    let loader = loader_with(
        LoaderConfig {
            max_redirects: 3,
            ..config(dir.path())
        },
        transport.clone(),
    );

    let err = loader
        .request(URL, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::Transport {
            source: TransportError::TooManyRedirects(3),
            ..
        }
    ));
    assert_eq!(transport.calls(), 4);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn test_redirect_without_location_fails() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(URL, Ok(TransportResponse::status(StatusCode::FOUND)));
    let loader = loader(dir.path(), transport.clone());

    let err = loader
        .request(URL, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::Transport {
            source: TransportError::BadRedirect(StatusCode::FOUND),
            ..
        }
    ));
}

#[tokio::test]
async fn test_failures_reject_and_clean_up() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(URL, Err(TransportError::Other("test_error".into())));
    transport.script(URL, Ok(TransportResponse::status(StatusCode::NOT_FOUND)));
    transport.respond(URL, "finally");
    let loader = loader(dir.path(), transport.clone());

    let err = loader
        .request(URL, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_network());
    assert!(err.to_string().contains("test_error"));
    assert!(!loader.store().entry_for_url(URL).is_cached());
    assert_eq!(loader.in_flight(), 0);
    assert_eq!(loader.active_transfers(), 0);

    let err = loader
        .request(URL, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::Transport {
            source: TransportError::Status(StatusCode::NOT_FOUND),
            ..
        }
    ));

    // No implicit retry: each call above hit the transport once.
    assert_eq!(transport.calls(), 2);
    let entry = loader.request(URL, RequestOptions::default()).await.unwrap();
    assert!(entry.downloaded());
}

#[tokio::test]
async fn test_transport_options_and_timeout_are_passed_through() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport.clone());

    loader.request(URL, RequestOptions::default()).await.unwrap();
    let (_, _, timeout) = transport.call(0);
    assert_eq!(timeout, Duration::from_secs(10));

    let options = RequestOptions::new().with_force(true).with_transport(
        TransportOptions::default()
            .with_header("Authorization", "Bearer token")
            .with_timeout(Duration::from_secs(2)),
    );
    loader.request(URL, options).await.unwrap();
    let (_, passed, timeout) = transport.call(1);
    assert_eq!(timeout, Duration::from_secs(2));
    assert_eq!(
        passed.headers.get("authorization").unwrap(),
        "Bearer token"
    );
}

#[tokio::test]
async fn test_progress_reaches_joined_callers() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::held();
    transport.respond(URL, "0123456789");
    let loader = loader(dir.path(), transport.clone());

    let seen = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let loader = loader.clone();
        let seen = seen.clone();
        handles.push(tokio::spawn(async move {
            let options = RequestOptions::new().with_progress(move |p| {
                assert_eq!(p.fraction(), Some(1.0));
                seen.fetch_add(p.received, Ordering::SeqCst);
            });
            loader.request(URL, options).await
        }));
    }

    wait_for(|| transport.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.release(1);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(seen.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_callback_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(URL, Err(TransportError::Other("boom".into())));
    transport.respond(URL, "ok");
    let loader = loader(dir.path(), transport);

    let (tx, rx) = tokio::sync::oneshot::channel();
    loader
        .request_with_callbacks(
            URL,
            RequestOptions::default(),
            |_| panic!("expected an error"),
            move |err| {
                let _ = tx.send(err.to_string());
            },
        )
        .await
        .unwrap();
    assert!(rx.await.unwrap().contains("boom"));

    let (tx, rx) = tokio::sync::oneshot::channel();
    loader
        .request_with_callbacks(
            URL,
            RequestOptions::default(),
            move |entry| {
                let _ = tx.send(entry.downloaded());
            },
            |err| panic!("unexpected error: {err}"),
        )
        .await
        .unwrap();
    assert!(rx.await.unwrap());
}

#[tokio::test]
async fn test_invalid_url_is_an_invocation_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport.clone());

    let err = loader
        .request("not a url", RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Invocation(_)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_rejects_new_fetches() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport.clone());

    loader.request(URL, RequestOptions::default()).await.unwrap();
    loader.shutdown();

    // Cached entries are still served.
    assert!(loader.request(URL, RequestOptions::default()).await.is_ok());

    let err = loader
        .request("http://h/other", RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Invocation(_)));
    assert_eq!(transport.calls(), 1);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn test_prune_through_loader() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = loader(dir.path(), transport);

    for name in ["a", "b", "c"] {
        loader
            .request(&format!("http://h/{name}"), RequestOptions::default())
            .await
            .unwrap();
    }
    loader
        .store()
        .entry_for_url("http://h/b")
        .expired(true)
        .unwrap();

    let report = loader.prune(false).unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.expunged, 1);
    assert!(!loader.store().contains(&resource_id("http://h/b")));

    let report = loader.gc(true).unwrap();
    assert_eq!(report.expunged, 2);
    assert!(loader.store().is_empty());
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();

    let build = |transport: Arc<ScriptedTransport>| {
        FileLoader::builder(config(dir.path()))
            .with_transport(transport)
            .build()
            .unwrap()
    };

    build(transport.clone())
        .request(URL, RequestOptions::default())
        .await
        .unwrap();
    assert!(
        dir.path()
            .join("file_loader_cache_metadata.json")
            .exists()
    );

    let entry = build(transport.clone())
        .request(URL, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.calls(), 1);
    assert!(entry.is_cached());
    assert!(!entry.downloaded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_hits_persist_last_used_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let loader = FileLoader::builder(config(dir.path()))
        .with_transport(transport.clone())
        .build()
        .unwrap();

    let first = loader.request(URL, RequestOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let hits = futures::future::join_all(
        (0..8).map(|_| loader.request(URL, RequestOptions::default())),
    )
    .await;
    for hit in hits {
        assert!(!hit.unwrap().downloaded());
    }
    assert_eq!(transport.calls(), 1);

    let raw = std::fs::read(dir.path().join("file_loader_cache_metadata.json")).unwrap();
    let stored: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    let last_used = stored[resource_id(URL)]["last_used_at"].as_u64().unwrap();
    assert!(last_used > first.last_used_at());
}
