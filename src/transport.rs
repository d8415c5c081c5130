//! Cross-Context Transport
//!
//! Carries serialized requests from the unprivileged side to the privileged
//! side and brings back exactly one response each. Nothing is shared by
//! reference: bodies cross as `serde_json::Value` and the client synthesizes a
//! failure response whenever the receiving side is gone.

use crate::error::ErrorKind;
use crate::protocol::{discriminant, Request, Response};
use crate::router::Router;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 256;

fn next_message_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

type ReplySlot = Arc<Mutex<Option<oneshot::Sender<Value>>>>;

/// One in-transit message
pub struct Envelope {
    pub id: u64,
    pub body: Value,
    slot: ReplySlot,
}

/// Reply channel handed to a listener
pub struct Responder {
    id: u64,
    slot: ReplySlot,
}

impl Responder {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver the response. Returns false if the channel is already closed.
    pub fn respond(self, response: Value) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }
}

/// Raw message listener on the privileged side
pub trait RawListener: Send + Sync + 'static {
    /// Handle one message. Returning `true` keeps the reply channel open for
    /// an asynchronous response; returning `false` closes it immediately.
    fn on_message(&self, body: Value, responder: Responder) -> bool;
}

/// Create a connected client/endpoint pair
pub fn channel(capacity: usize) -> (TransportClient, TransportEndpoint) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TransportClient { tx }, TransportEndpoint { rx })
}

/// Sending half, held by the unprivileged side
#[derive(Clone)]
pub struct TransportClient {
    tx: mpsc::Sender<Envelope>,
}

impl TransportClient {
    /// Send a typed request and wait for its response
    pub async fn send(&self, request: &Request) -> Response {
        let request_type = request.request_type();
        let body = match serde_json::to_value(request) {
            Ok(body) => body,
            Err(e) => {
                return Response::failure(
                    request_type,
                    ErrorKind::InternalError,
                    format!("Failed to encode request: {}", e),
                )
            }
        };

        let raw = self.send_value(body).await;
        serde_json::from_value(raw).unwrap_or_else(|e| {
            Response::failure(
                request_type,
                ErrorKind::ParseError,
                format!("Malformed response: {}", e),
            )
        })
    }

    /// Send a raw message and wait for exactly one raw response
    pub async fn send_value(&self, body: Value) -> Value {
        let id = next_message_id();
        let echo = discriminant(&body).unwrap_or("UNKNOWN").to_string();
        let (tx, rx) = oneshot::channel();
        let envelope = Envelope {
            id,
            body,
            slot: Arc::new(Mutex::new(Some(tx))),
        };

        if self.tx.send(envelope).await.is_err() {
            warn!(id, request_type = %echo, "No receiver for message");
            return disconnected(&echo, "Receiver unavailable");
        }

        match rx.await {
            Ok(response) => response,
            Err(_) => {
                warn!(id, request_type = %echo, "Receiver closed without responding");
                disconnected(&echo, "Receiver closed the channel without responding")
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn disconnected(request_type: &str, message: &str) -> Value {
    Response::failure(request_type, ErrorKind::TransportError, message).to_value()
}

/// Receiving half, owned by the privileged side
pub struct TransportEndpoint {
    rx: mpsc::Receiver<Envelope>,
}

impl TransportEndpoint {
    /// Deliver messages to `listener` until every client is dropped
    pub async fn serve<L: RawListener>(mut self, listener: L) {
        info!("Transport endpoint serving");
        while let Some(envelope) = self.rx.recv().await {
            let Envelope { id, body, slot } = envelope;
            let responder = Responder {
                id,
                slot: Arc::clone(&slot),
            };
            if !listener.on_message(body, responder) {
                // Closing the slot makes any later respond() a no-op
                slot.lock().take();
                debug!(id, "Listener declined to respond; channel closed");
            }
        }
        info!("Transport endpoint stopped");
    }

    pub fn spawn<L: RawListener>(self, listener: L) -> JoinHandle<()> {
        tokio::spawn(self.serve(listener))
    }
}

/// Listener that hands every message to a [`Router`]
///
/// Always keeps the reply channel open; dispatches run concurrently and may
/// complete out of order.
pub struct RouterListener {
    router: Arc<Router>,
}

impl RouterListener {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

impl RawListener for RouterListener {
    fn on_message(&self, body: Value, responder: Responder) -> bool {
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            let id = responder.id();
            let response = router.dispatch_value(body).await;
            if !responder.respond(response.to_value()) {
                debug!(id, "Requester went away before the response was delivered");
            }
        });
        true
    }
}
