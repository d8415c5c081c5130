//! Message Router (privileged side)
//!
//! Maps each request onto the matching [`Backend`] method with an exhaustive
//! match over [`Request`]. Raw messages whose `type` is missing or outside the
//! enumeration get the shared fallback response and never reach a handler.

use crate::error::{ErrorKind, RuntimeError};
use crate::protocol::{discriminant, Request, RequestType, Response};
use crate::store::Settings;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub type HandlerResult = Result<Response, RuntimeError>;

/// Privileged handler set, one method per request type
///
/// Validation failures are returned as `Ok(Response)` with `ok: false`. An
/// `Err` is reserved for unexpected faults and is converted at the boundary.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> HandlerResult;

    async fn get_settings(&self) -> HandlerResult;

    async fn save_settings(&self, settings: Settings) -> HandlerResult;

    async fn get_selections(&self) -> HandlerResult;

    async fn save_selection(&self, key: String, value: Value) -> HandlerResult;

    async fn exclude_item(&self, id: String) -> HandlerResult;

    async fn fetch_json(
        &self,
        url: String,
        method: Option<String>,
        headers: BTreeMap<String, String>,
        body: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> HandlerResult;

    async fn graphql(
        &self,
        endpoint: String,
        query: String,
        variables: Option<Value>,
        credential: Option<String>,
        timeout_ms: Option<u64>,
    ) -> HandlerResult;

    async fn lookup_batch(&self, ids: Vec<String>) -> HandlerResult;

    async fn get_catalog(&self, force_refresh: bool) -> HandlerResult;

    async fn search(&self, term: String) -> HandlerResult;

    async fn add_item(&self, item: Value) -> HandlerResult;
}

/// Response returned for unknown discriminants
pub fn unknown_type_response() -> Response {
    Response::failure("UNKNOWN", ErrorKind::UnknownType, "Unknown message type")
}

pub struct Router {
    backend: Arc<dyn Backend>,
    fallback: Response,
}

impl Router {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            fallback: unknown_type_response(),
        }
    }

    pub fn with_fallback(mut self, fallback: Response) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fallback(&self) -> &Response {
        &self.fallback
    }

    /// Route a typed request to its handler, returning the handler's result as-is
    pub async fn route(&self, request: Request) -> HandlerResult {
        route(self.backend.as_ref(), request).await
    }

    /// Route a typed request and convert faults into a failure response
    ///
    /// The handler runs in its own task so a panic is contained and reported
    /// as `internal_error`.
    pub async fn dispatch(&self, request: Request) -> Response {
        let request_type = request.request_type();
        debug!(%request_type, "Dispatching request");

        let backend = Arc::clone(&self.backend);
        let task = tokio::spawn(async move { route(backend.as_ref(), request).await });

        match task.await {
            Ok(Ok(response)) => {
                debug!(%request_type, ok = response.ok, "Request completed");
                response
            }
            Ok(Err(err)) => {
                warn!(%request_type, error = %err, "Handler failed");
                Response::from_error(request_type, &err)
            }
            Err(join_err) => {
                error!(%request_type, error = %join_err, "Handler aborted");
                let message = if join_err.is_panic() {
                    "Handler panicked".to_string()
                } else {
                    format!("Handler cancelled: {}", join_err)
                };
                Response::failure(request_type, ErrorKind::InternalError, message)
            }
        }
    }

    /// Entry point for raw messages arriving across the boundary
    pub async fn dispatch_value(&self, raw: Value) -> Response {
        let request_type = match discriminant(&raw).and_then(RequestType::parse) {
            Some(request_type) => request_type,
            None => {
                debug!(raw_type = ?raw.get("type"), "Unknown message type");
                return self.fallback.clone();
            }
        };

        match serde_json::from_value::<Request>(raw) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Response::invalid(
                request_type,
                format!("Malformed {} request: {}", request_type, e),
            ),
        }
    }
}

async fn route(backend: &dyn Backend, request: Request) -> HandlerResult {
    match request {
        Request::Ping => backend.ping().await,
        Request::GetSettings => backend.get_settings().await,
        Request::SaveSettings { settings } => backend.save_settings(settings).await,
        Request::GetSelections => backend.get_selections().await,
        Request::SaveSelection { key, value } => backend.save_selection(key, value).await,
        Request::ExcludeItem { id } => backend.exclude_item(id).await,
        Request::FetchJson {
            url,
            method,
            headers,
            body,
            timeout_ms,
        } => {
            backend
                .fetch_json(url, method, headers, body, timeout_ms)
                .await
        }
        Request::Graphql {
            endpoint,
            query,
            variables,
            credential,
            timeout_ms,
        } => {
            backend
                .graphql(endpoint, query, variables, credential, timeout_ms)
                .await
        }
        Request::LookupBatch { ids } => backend.lookup_batch(ids).await,
        Request::GetCatalog { force_refresh } => backend.get_catalog(force_refresh).await,
        Request::Search { term } => backend.search(term).await,
        Request::AddItem { item } => backend.add_item(item).await,
    }
}
