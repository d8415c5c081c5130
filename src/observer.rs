//! Observer controller (unprivileged side)
//!
//! Wires the pieces together: subtree or navigation change → item scan →
//! batcher → `LOOKUP_BATCH` over the transport → view sink. Holds nothing
//! privileged; every lookup goes through the [`TransportClient`].

use crate::batcher::{BatchConfig, Batcher};
use crate::error::{ErrorKind, RuntimeError};
use crate::protocol::{Request, Response};
use crate::transport::TransportClient;
use crate::watch::{
    watch_navigation, HistoryEvent, LocationSource, NavigationHandle, SubtreeWatcher, WatchConfig,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Extracts the item keys currently present on the observed surface
pub trait ItemScanner: Send + Sync {
    fn scan(&self) -> Vec<String>;
}

/// Receives successful lookup responses
pub trait ViewSink: Send + Sync {
    fn apply(&self, response: &Response);
}

/// Location feed for navigation-driven rescans
pub struct NavigationFeed {
    pub location: Arc<dyn LocationSource>,
    pub history: broadcast::Receiver<HistoryEvent>,
}

/// Keys already queued or requested
type SeenKeys = Arc<Mutex<HashSet<String>>>;

struct Scan {
    scanner: Arc<dyn ItemScanner>,
    seen: SeenKeys,
    batcher: Batcher<String, RuntimeError>,
}

impl Scan {
    /// Queue every scanned key not yet requested
    fn run(&self) -> usize {
        let fresh: Vec<String> = {
            let mut seen = self.seen.lock();
            self.scanner
                .scan()
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        let count = fresh.len();
        if count > 0 {
            debug!(count, "Queueing new item keys");
            self.batcher.enqueue_all(fresh);
        }
        count
    }

    fn reset(&self) {
        self.seen.lock().clear();
        self.batcher.clear();
    }
}

fn response_error(response: &Response) -> RuntimeError {
    let message = response
        .error
        .clone()
        .unwrap_or_else(|| "Lookup failed".to_string());
    match response.code {
        Some(ErrorKind::Timeout) => RuntimeError::Timeout,
        Some(ErrorKind::HttpError) => match response.status {
            Some(status) => RuntimeError::Http { status },
            None => RuntimeError::Internal(message),
        },
        Some(ErrorKind::NetworkError) => RuntimeError::Network(message),
        Some(ErrorKind::ParseError) => RuntimeError::Parse(message),
        Some(ErrorKind::ValidationError) => RuntimeError::Validation(message),
        Some(ErrorKind::PermissionMissing) => RuntimeError::PermissionMissing(message),
        Some(ErrorKind::TransportError) => RuntimeError::Transport(message),
        _ => RuntimeError::Internal(message),
    }
}

/// Running observer. Call [`Observer::teardown`] to stop it.
pub struct Observer {
    scan: Arc<Scan>,
    subtree: SubtreeWatcher,
    navigation: Option<NavigationHandle>,
}

impl Observer {
    /// Start observing and queue an initial scan
    pub fn start(
        client: TransportClient,
        scanner: Arc<dyn ItemScanner>,
        view: Arc<dyn ViewSink>,
        navigation: Option<NavigationFeed>,
        watch: WatchConfig,
        batch: BatchConfig,
    ) -> Result<Self, RuntimeError> {
        let seen: SeenKeys = Arc::default();
        let requested = Arc::clone(&seen);
        let batcher = Batcher::new(batch, move |ids: Vec<String>| {
            let client = client.clone();
            let view = Arc::clone(&view);
            let requested = Arc::clone(&requested);
            async move {
                let response = client
                    .send(&Request::LookupBatch { ids: ids.clone() })
                    .await;
                if response.ok {
                    view.apply(&response);
                    return Ok(());
                }
                // Failed keys become eligible for the next scan
                {
                    let mut requested = requested.lock();
                    for id in &ids {
                        requested.remove(id);
                    }
                }
                debug!(count = ids.len(), "Lookup failed; keys released for retry");
                Err(response_error(&response))
            }
        });

        let scan = Arc::new(Scan {
            scanner,
            seen,
            batcher,
        });

        let on_subtree = Arc::clone(&scan);
        let subtree = SubtreeWatcher::new(Duration::from_millis(watch.debounce_ms), move || {
            on_subtree.run();
        })?;

        let navigation = navigation.map(|feed| {
            let on_navigate = Arc::clone(&scan);
            watch_navigation(
                feed.location,
                feed.history,
                Duration::from_millis(watch.interval_ms),
                move |location| {
                    debug!(location, "Navigation observed; rescanning");
                    on_navigate.reset();
                    on_navigate.run();
                },
            )
        });

        let queued = scan.run();
        info!(queued, "Observer started");
        Ok(Self {
            scan,
            subtree,
            navigation,
        })
    }

    /// Watcher to feed with mutation batches
    pub fn subtree(&self) -> &SubtreeWatcher {
        &self.subtree
    }

    /// Scan immediately; returns how many new keys were queued
    pub fn rescan(&self) -> usize {
        self.scan.run()
    }

    /// Flush one pending slice now, surfacing lookup failures
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        self.scan.batcher.flush().await
    }

    pub fn pending(&self) -> usize {
        self.scan.batcher.pending()
    }

    /// Stop every watch and drop queued work
    pub fn teardown(self) {
        self.subtree.disconnect();
        if let Some(navigation) = self.navigation {
            navigation.dispose();
        }
        self.scan.batcher.clear();
        info!("Observer torn down");
    }
}
