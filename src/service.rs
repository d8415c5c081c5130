//! Service backend (privileged side)
//!
//! Concrete handler set behind the router. All state hangs off an explicitly
//! constructed [`Context`]: configuration, the selected host capability, the
//! HTTP fetcher and the lookup cache.

use crate::cache::TtlCache;
use crate::config::CourierConfig;
use crate::error::{ErrorKind, RuntimeError};
use crate::fetch::{origin_of, FetchOutcome, FetchRequest, Fetcher, OriginGuard};
use crate::host::{self, Host};
use crate::protocol::{RequestType, Response};
use crate::router::{Backend, HandlerResult, Router};
use crate::store::{CatalogCache, Settings, Stores};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const CREDENTIAL_HEADER: &str = "X-Api-Key";

/// Shared privileged-side state
pub struct Context {
    config: CourierConfig,
    host: Arc<dyn Host>,
    fetcher: Fetcher,
    lookups: Mutex<TtlCache<String, Value>>,
}

impl Context {
    /// Build a context, selecting the host adapter from configuration
    pub fn new(config: CourierConfig) -> Result<Self, RuntimeError> {
        let host = host::select(&config.host)?;
        Self::with_host(config, host)
    }

    pub fn with_host(config: CourierConfig, host: Arc<dyn Host>) -> Result<Self, RuntimeError> {
        let guard: OriginGuard = {
            let host = Arc::clone(&host);
            Arc::new(move |origin: &str| host.permits(origin))
        };
        let fetcher = Fetcher::with_options(
            config.fetch.timeout(),
            config.fetch.connect_timeout(),
            config.fetch.user_agent.as_deref(),
            Some(guard),
        )?;
        let lookups = Mutex::new(TtlCache::new(config.cache.ttl_ms, config.cache.max_size));
        info!(host = host.name(), "Service context initialized");
        Ok(Self {
            config,
            host,
            fetcher,
            lookups,
        })
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn stores(&self) -> Stores<'_> {
        Stores::new(self.host.store())
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Number of cached lookup entries (including not-yet-purged stale ones)
    pub fn cached_lookups(&self) -> usize {
        self.lookups.lock().size()
    }
}

/// Default backend wired to a [`Context`]
pub struct ServiceBackend {
    ctx: Arc<Context>,
}

impl ServiceBackend {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Router over a fresh backend for `ctx`
    pub fn router(ctx: Arc<Context>) -> Router {
        Router::new(Arc::new(Self::new(ctx)))
    }

    /// Resolved service settings, or a validation response explaining why not
    fn service_settings(&self, request_type: RequestType) -> Result<Settings, Response> {
        let settings = self
            .ctx
            .stores()
            .settings()
            .map_err(|e| Response::from_error(request_type, &RuntimeError::from(e)))?;
        if !settings.enabled {
            return Err(Response::invalid(request_type, "Integration is disabled"));
        }
        if !settings.is_configured() {
            return Err(Response::invalid(request_type, "Service URL not configured"));
        }
        Ok(settings)
    }

    fn check_permission(&self, request_type: RequestType, url: &str) -> Result<(), Response> {
        let origin = origin_of(url).map_err(|e| Response::from_error(request_type, &e))?;
        if !self.ctx.host().permits(&origin) {
            return Err(Response::from_error(
                request_type,
                &RuntimeError::PermissionMissing(origin),
            ));
        }
        Ok(())
    }

    /// Permission-checked fetch; failures become a response carrying diagnostics
    async fn checked_fetch(
        &self,
        request_type: RequestType,
        request: FetchRequest,
    ) -> Result<FetchOutcome, Response> {
        self.check_permission(request_type, &request.url)?;
        let outcome = self.ctx.fetcher().execute(request).await;
        if outcome.ok {
            Ok(outcome)
        } else {
            Err(failure_from_outcome(request_type, outcome))
        }
    }

    /// Call the configured service, returning its JSON payload
    async fn call_service(
        &self,
        request_type: RequestType,
        settings: &Settings,
        mut request: FetchRequest,
    ) -> Result<Value, Response> {
        if !settings.api_key.is_empty() {
            request = request.with_header(CREDENTIAL_HEADER, settings.api_key.clone());
        }
        request = request.with_timeout(Duration::from_millis(settings.timeout_ms.max(1)));
        let outcome = self.checked_fetch(request_type, request).await?;
        Ok(outcome.payload.unwrap_or(Value::Null))
    }
}

fn failure_from_outcome(request_type: RequestType, outcome: FetchOutcome) -> Response {
    let mut response = Response::failure(
        request_type,
        outcome.code.unwrap_or(ErrorKind::InternalError),
        outcome.error.unwrap_or_else(|| "Request failed".to_string()),
    )
    .with_status(outcome.status);
    if let Some(payload) = outcome.payload {
        response = response.with("data", payload);
    }
    if let Some(text) = outcome.text {
        response = response.with("text", text);
    }
    response
}

/// Accept either a bare array or an object wrapping one under `key`
fn list_field(payload: Value, key: &str) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Accept either a bare id map or an object wrapping one under `key`
fn map_field(payload: Value, key: &str) -> Map<String, Value> {
    match payload {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Object(inner)) => inner,
            Some(_) => Map::new(),
            None => map,
        },
        _ => Map::new(),
    }
}

fn item_id(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, RuntimeError> {
    serde_json::to_value(value)
        .map_err(|e| RuntimeError::Internal(format!("Failed to encode payload: {}", e)))
}

#[async_trait]
impl Backend for ServiceBackend {
    async fn ping(&self) -> HandlerResult {
        Ok(Response::success(RequestType::Ping).with("version", VERSION))
    }

    async fn get_settings(&self) -> HandlerResult {
        let settings = self.ctx.stores().settings()?;
        Ok(Response::success(RequestType::GetSettings).with("settings", to_json(&settings)?))
    }

    async fn save_settings(&self, settings: Settings) -> HandlerResult {
        let request_type = RequestType::SaveSettings;
        if settings.is_configured() {
            if let Err(e) = origin_of(settings.service_url.trim()) {
                return Ok(Response::from_error(request_type, &e));
            }
        }
        if settings.timeout_ms == 0 {
            return Ok(Response::invalid(request_type, "timeoutMs must be positive"));
        }

        let settings = Settings {
            service_url: settings.service_url.trim().to_string(),
            ..settings
        };
        self.ctx.stores().save_settings(&settings)?;
        info!("Settings saved");
        Ok(Response::success(request_type).with("settings", to_json(&settings)?))
    }

    async fn get_selections(&self) -> HandlerResult {
        let selections = self.ctx.stores().selections()?;
        Ok(Response::success(RequestType::GetSelections)
            .with("selections", to_json(&selections)?))
    }

    async fn save_selection(&self, key: String, value: Value) -> HandlerResult {
        let request_type = RequestType::SaveSelection;
        if key.trim().is_empty() {
            return Ok(Response::invalid(request_type, "Selection key is required"));
        }

        let stores = self.ctx.stores();
        let mut selections = stores.selections()?;
        if value.is_null() {
            selections.selected.remove(&key);
        } else {
            selections.selected.insert(key, value);
        }
        stores.save_selections(&selections)?;
        Ok(Response::success(request_type).with("selections", to_json(&selections)?))
    }

    async fn exclude_item(&self, id: String) -> HandlerResult {
        let request_type = RequestType::ExcludeItem;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Ok(Response::invalid(request_type, "Item id is required"));
        }

        let stores = self.ctx.stores();
        let mut selections = stores.selections()?;
        selections.selected.remove(&id);
        selections.excluded.insert(id.clone());
        stores.save_selections(&selections)?;
        // Drop any cached lookup so the exclusion is visible immediately
        self.ctx.lookups.lock().delete(&id);
        debug!(id = %id, "Item excluded");
        Ok(Response::success(request_type).with("excluded", to_json(&selections.excluded)?))
    }

    async fn fetch_json(
        &self,
        url: String,
        method: Option<String>,
        headers: BTreeMap<String, String>,
        body: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> HandlerResult {
        let request_type = RequestType::FetchJson;
        let mut request = FetchRequest::get(url);
        request.method = method.unwrap_or_else(|| "GET".to_string());
        request.headers = headers;
        request.timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.ctx.fetcher().default_timeout());
        match body {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => request.body = Some(raw),
            Some(structured) => {
                let has_content_type = request
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case("content-type"));
                if !has_content_type {
                    request
                        .headers
                        .insert("Content-Type".to_string(), "application/json".to_string());
                }
                request.body = Some(structured.to_string());
            }
        }

        match self.checked_fetch(request_type, request).await {
            Ok(outcome) => {
                let mut response = Response::success(request_type)
                    .with_status(outcome.status)
                    .with("data", outcome.payload.unwrap_or(Value::Null));
                if let Some(text) = outcome.text {
                    response = response.with("text", text);
                }
                Ok(response)
            }
            Err(response) => Ok(response),
        }
    }

    async fn graphql(
        &self,
        endpoint: String,
        query: String,
        variables: Option<Value>,
        credential: Option<String>,
        timeout_ms: Option<u64>,
    ) -> HandlerResult {
        let request_type = RequestType::Graphql;
        if query.trim().is_empty() {
            return Ok(Response::invalid(request_type, "GraphQL query is required"));
        }

        let body = json!({ "query": query, "variables": variables.unwrap_or_else(|| json!({})) });
        let mut request = FetchRequest::post_json(endpoint, &body)
            .with_header("Accept", "application/json")
            .with_timeout(
                timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.ctx.fetcher().default_timeout()),
            );
        if let Some(credential) = credential.filter(|c| !c.is_empty()) {
            request = request.with_header("Authorization", format!("Bearer {}", credential));
        }

        let outcome = match self.checked_fetch(request_type, request).await {
            Ok(outcome) => outcome,
            Err(response) => return Ok(response),
        };

        let mut payload = outcome.payload.unwrap_or(Value::Null);
        let errors: Vec<String> = payload
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .map(|e| {
                        e.get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown GraphQL error")
                            .to_string()
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !errors.is_empty() {
            return Ok(
                Response::failure(request_type, ErrorKind::HttpError, errors.join("; "))
                    .with_status(outcome.status),
            );
        }

        let data = payload
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Response::success(request_type).with("data", data))
    }

    async fn lookup_batch(&self, ids: Vec<String>) -> HandlerResult {
        let request_type = RequestType::LookupBatch;
        let mut unique = HashSet::new();
        let ids: Vec<String> = ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && unique.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Ok(Response::invalid(request_type, "At least one id is required"));
        }

        let settings = match self.service_settings(request_type) {
            Ok(settings) => settings,
            Err(response) => return Ok(response),
        };

        let mut results = Map::new();
        let mut misses = Vec::new();
        {
            let mut cache = self.ctx.lookups.lock();
            for id in &ids {
                match cache.get(id) {
                    Some(value) => {
                        results.insert(id.clone(), value);
                    }
                    None => misses.push(id.clone()),
                }
            }
        }
        let cached = results.len();

        if !misses.is_empty() {
            debug!(hits = cached, misses = misses.len(), "Looking up uncached ids");
            let request = FetchRequest::post_json(
                settings.endpoint("lookup"),
                &json!({ "ids": misses }),
            );
            let payload = match self.call_service(request_type, &settings, request).await {
                Ok(payload) => payload,
                Err(response) => return Ok(response),
            };

            let fetched = map_field(payload, "results");
            let mut cache = self.ctx.lookups.lock();
            for id in &misses {
                if let Some(value) = fetched.get(id) {
                    cache.set(id.clone(), value.clone());
                    results.insert(id.clone(), value.clone());
                }
            }
        }

        Ok(Response::success(request_type)
            .with("results", Value::Object(results))
            .with("cached", cached))
    }

    async fn get_catalog(&self, force_refresh: bool) -> HandlerResult {
        let request_type = RequestType::GetCatalog;
        let stores = self.ctx.stores();
        if !force_refresh {
            let catalog = stores.catalog()?;
            let ttl_ms = self.ctx.config().cache.catalog_ttl_ms;
            if catalog.is_fresh(ttl_ms, Utc::now().timestamp_millis()) {
                return Ok(Response::success(request_type)
                    .with("items", Value::Array(catalog.items))
                    .with("cached", true));
            }
        }

        let settings = match self.service_settings(request_type) {
            Ok(settings) => settings,
            Err(response) => return Ok(response),
        };
        let request = FetchRequest::get(settings.endpoint("catalog"));
        let payload = match self.call_service(request_type, &settings, request).await {
            Ok(payload) => payload,
            Err(response) => return Ok(response),
        };

        let catalog = CatalogCache::new(list_field(payload, "items"));
        self.ctx.stores().save_catalog(&catalog)?;
        info!(items = catalog.items.len(), "Catalog refreshed");
        Ok(Response::success(request_type)
            .with("items", Value::Array(catalog.items))
            .with("cached", false))
    }

    async fn search(&self, term: String) -> HandlerResult {
        let request_type = RequestType::Search;
        let term = term.trim();
        if term.is_empty() {
            return Ok(Response::invalid(request_type, "Search term is required"));
        }

        let settings = match self.service_settings(request_type) {
            Ok(settings) => settings,
            Err(response) => return Ok(response),
        };
        let mut url = match Url::parse(&settings.endpoint("search")) {
            Ok(url) => url,
            Err(e) => {
                return Ok(Response::invalid(
                    request_type,
                    format!("Invalid service URL: {}", e),
                ))
            }
        };
        url.query_pairs_mut().append_pair("term", term);

        let payload = match self
            .call_service(request_type, &settings, FetchRequest::get(url.to_string()))
            .await
        {
            Ok(payload) => payload,
            Err(response) => return Ok(response),
        };
        Ok(Response::success(request_type)
            .with("results", Value::Array(list_field(payload, "results"))))
    }

    async fn add_item(&self, item: Value) -> HandlerResult {
        let request_type = RequestType::AddItem;
        if !item.is_object() {
            return Ok(Response::invalid(request_type, "Item must be an object"));
        }
        let id = match item_id(&item) {
            Some(id) => id,
            None => return Ok(Response::invalid(request_type, "Item id is required")),
        };

        let settings = match self.service_settings(request_type) {
            Ok(settings) => settings,
            Err(response) => return Ok(response),
        };
        let request = FetchRequest::post_json(settings.endpoint("items"), &item);
        let payload = match self.call_service(request_type, &settings, request).await {
            Ok(payload) => payload,
            Err(response) => return Ok(response),
        };

        // The added item is no longer a pending lookup
        self.ctx.lookups.lock().delete(&id);
        info!(id = %id, "Item added");
        let added = if payload.is_null() { item } else { payload };
        Ok(Response::success(request_type).with("item", added))
    }
}
