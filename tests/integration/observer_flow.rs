//! End-to-end tests for the observer controller
//!
//! watcher → scanner → batcher → transport → router → service → HTTP stub,
//! with the response applied to a recording view.

use super::test_utils::{configure, memory_context, Captured, Reply, TestServer};
use courier::batcher::BatchConfig;
use courier::error::ErrorKind;
use courier::observer::{ItemScanner, NavigationFeed, Observer, ViewSink};
use courier::protocol::Response;
use courier::service::ServiceBackend;
use courier::transport::{self, RouterListener, TransportClient};
use courier::watch::{MutationBatch, SharedLocation, WatchConfig};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ListScanner {
    ids: Mutex<Vec<String>>,
}

impl ListScanner {
    fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            ids: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
        })
    }

    fn push(&self, id: &str) {
        self.ids.lock().push(id.to_string());
    }
}

impl ItemScanner for ListScanner {
    fn scan(&self) -> Vec<String> {
        self.ids.lock().clone()
    }
}

#[derive(Default)]
struct RecordingView {
    applied: Mutex<Vec<Response>>,
}

impl RecordingView {
    fn count(&self) -> usize {
        self.applied.lock().len()
    }

    fn last(&self) -> Option<Response> {
        self.applied.lock().last().cloned()
    }
}

impl ViewSink for RecordingView {
    fn apply(&self, response: &Response) {
        self.applied.lock().push(response.clone());
    }
}

fn lookup_reply(request: &Captured) -> Reply {
    let mut results = Map::new();
    for id in request.json()["ids"].as_array().cloned().unwrap_or_default() {
        if let Some(id) = id.as_str() {
            results.insert(id.to_string(), json!({ "seen": true }));
        }
    }
    Reply::json(200, json!({ "results": results }))
}

async fn lookup_stub() -> TestServer {
    TestServer::start(lookup_reply).await
}

fn client_for(server: Option<&TestServer>) -> TransportClient {
    let ctx = memory_context(&["*"]);
    if let Some(server) = server {
        configure(&ctx, &server.url, "");
    }
    let (client, endpoint) = transport::channel(16);
    endpoint.spawn(RouterListener::new(Arc::new(ServiceBackend::router(ctx))));
    client
}

fn fast_watch() -> WatchConfig {
    WatchConfig {
        debounce_ms: 20,
        interval_ms: 20,
    }
}

fn fast_batch() -> BatchConfig {
    BatchConfig {
        max_batch: 25,
        max_wait_ms: 10,
    }
}

fn lookups(server: &TestServer) -> Vec<Value> {
    server.requests().iter().map(|r| r.json()["ids"].clone()).collect()
}

/// Poll until `condition` holds or two seconds pass
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_initial_scan_is_looked_up_in_one_batch() {
    let server = lookup_stub().await;
    let view = Arc::new(RecordingView::default());
    let observer = Observer::start(
        client_for(Some(&server)),
        ListScanner::new(&["a", "b", "c"]),
        view.clone(),
        None,
        fast_watch(),
        fast_batch(),
    )
    .unwrap();

    assert!(eventually(|| view.count() == 1).await);
    let response = view.last().unwrap();
    assert!(response.ok);
    assert_eq!(response.get("results").unwrap().as_object().unwrap().len(), 3);
    assert_eq!(lookups(&server), vec![json!(["a", "b", "c"])]);
    observer.teardown();
}

#[tokio::test]
async fn test_subtree_change_requests_only_new_keys() {
    let server = lookup_stub().await;
    let scanner = ListScanner::new(&["a", "b"]);
    let view = Arc::new(RecordingView::default());
    let observer = Observer::start(
        client_for(Some(&server)),
        scanner.clone(),
        view.clone(),
        None,
        fast_watch(),
        fast_batch(),
    )
    .unwrap();
    assert!(eventually(|| view.count() == 1).await);

    scanner.push("c");
    for _ in 0..3 {
        observer.subtree().observe(MutationBatch::added(1));
    }
    assert!(eventually(|| view.count() == 2).await);
    assert_eq!(lookups(&server), vec![json!(["a", "b"]), json!(["c"])]);

    // Nothing new: no further lookup
    observer.subtree().observe(MutationBatch::removed(1));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(view.count(), 2);
    observer.teardown();
}

#[tokio::test]
async fn test_navigation_resets_seen_keys() {
    let server = lookup_stub().await;
    let location = SharedLocation::new("/list/1");
    let view = Arc::new(RecordingView::default());
    let observer = Observer::start(
        client_for(Some(&server)),
        ListScanner::new(&["a", "b"]),
        view.clone(),
        Some(NavigationFeed {
            location: Arc::new(location.clone()),
            history: location.subscribe(),
        }),
        fast_watch(),
        fast_batch(),
    )
    .unwrap();
    assert!(eventually(|| view.count() == 1).await);

    location.set("/list/2");
    assert!(eventually(|| view.count() == 2).await);

    // Same keys requested again, served from the service-side cache
    let response = view.last().unwrap();
    assert_eq!(response.get("cached"), Some(&json!(2)));
    assert_eq!(server.hits(), 1);
    observer.teardown();
}

#[tokio::test]
async fn test_no_lookups_after_teardown() {
    let server = lookup_stub().await;
    let scanner = ListScanner::new(&["a"]);
    let view = Arc::new(RecordingView::default());
    let observer = Observer::start(
        client_for(Some(&server)),
        scanner.clone(),
        view.clone(),
        None,
        fast_watch(),
        fast_batch(),
    )
    .unwrap();
    assert!(eventually(|| view.count() == 1).await);

    let subtree = observer.subtree().clone();
    observer.teardown();
    scanner.push("b");
    subtree.observe(MutationBatch::added(1));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(view.count(), 1);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_manual_flush_surfaces_lookup_failure() {
    let view = Arc::new(RecordingView::default());
    let observer = Observer::start(
        client_for(None),
        ListScanner::new(&["a"]),
        view.clone(),
        None,
        fast_watch(),
        BatchConfig {
            max_batch: 25,
            max_wait_ms: 60_000,
        },
    )
    .unwrap();
    assert_eq!(observer.pending(), 1);

    let err = observer.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(view.count(), 0);
    assert_eq!(observer.pending(), 0);
    observer.teardown();
}

#[tokio::test]
async fn test_failed_lookup_keys_are_requested_again() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let server = TestServer::start(move |request| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Reply::json(500, json!({ "message": "warming up" }))
        } else {
            lookup_reply(request)
        }
    })
    .await;
    let view = Arc::new(RecordingView::default());
    let observer = Observer::start(
        client_for(Some(&server)),
        ListScanner::new(&["a", "b"]),
        view.clone(),
        None,
        fast_watch(),
        BatchConfig {
            max_batch: 25,
            max_wait_ms: 60_000,
        },
    )
    .unwrap();

    let err = observer.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HttpError);
    assert_eq!(view.count(), 0);

    // The failed keys are no longer marked as requested
    assert_eq!(observer.rescan(), 2);
    observer.flush().await.unwrap();
    assert_eq!(view.count(), 1);
    assert_eq!(
        lookups(&server),
        vec![json!(["a", "b"]), json!(["a", "b"])]
    );
    assert_eq!(observer.rescan(), 0);
    observer.teardown();
}
