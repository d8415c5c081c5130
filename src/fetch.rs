//! Timed Fetch
//!
//! Performs exactly one outbound HTTP attempt bounded by a hard timeout and
//! normalizes every outcome (success, HTTP error, parse error, network error,
//! timeout) into a single [`FetchOutcome`] shape.
//!
//! Redirects are followed only when every hop lands on an origin the
//! fetcher's [`OriginGuard`] accepts; a denied hop fails the attempt with
//! `permission_missing` before any request reaches that origin.

use crate::error::{ErrorKind, RuntimeError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 10;

/// Decides whether an origin may be contacted while following redirects
pub type OriginGuard = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[error("Redirect to unpermitted origin {0}")]
struct RedirectDenied(String);

/// A single outbound call
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut request = Self::get(url);
        request.method = "POST".to_string();
        request
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        request.body = Some(body.to_string());
        request
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Normalized result of a fetch attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorKind>,
}

impl FetchOutcome {
    fn failure(err: &RuntimeError) -> Self {
        Self {
            ok: false,
            status: err.status(),
            error: Some(err.to_string()),
            code: Some(err.kind()),
            ..Default::default()
        }
    }
}

/// HTTP executor shared by all privileged handlers
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    default_timeout: Duration,
}

impl Fetcher {
    pub fn new(default_timeout: Duration) -> Result<Self, RuntimeError> {
        Self::with_options(default_timeout, CONNECT_TIMEOUT, None, None)
    }

    /// Build a fetcher; with a guard, every redirect hop must pass it
    pub fn with_options(
        default_timeout: Duration,
        connect_timeout: Duration,
        user_agent: Option<&str>,
        origin_guard: Option<OriginGuard>,
    ) -> Result<Self, RuntimeError> {
        // No client-wide timeout; each call is bounded by its own
        let mut builder = Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .redirect(redirect_policy(origin_guard));
        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| RuntimeError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Perform one attempt and normalize the outcome
    pub async fn execute(&self, request: FetchRequest) -> FetchOutcome {
        let started = Instant::now();
        let prepared = match self.prepare(&request) {
            Ok(prepared) => prepared,
            Err(err) => return FetchOutcome::failure(&err),
        };

        // The timer lives inside this future and is dropped on every exit
        let outcome = match tokio::time::timeout(request.timeout, self.attempt(prepared)).await {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::failure(&RuntimeError::Timeout),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if outcome.ok {
            debug!(url = %request.url, status = ?outcome.status, elapsed_ms, "Fetch completed");
        } else {
            warn!(
                url = %request.url,
                status = ?outcome.status,
                code = ?outcome.code,
                elapsed_ms,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Fetch failed"
            );
        }
        outcome
    }

    fn prepare(&self, request: &FetchRequest) -> Result<reqwest::RequestBuilder, RuntimeError> {
        let method = Method::from_str(&request.method.to_ascii_uppercase())
            .map_err(|_| RuntimeError::Validation(format!("Invalid method: {}", request.method)))?;
        let url = Url::parse(&request.url)
            .map_err(|e| RuntimeError::Validation(format!("Invalid URL {}: {}", request.url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RuntimeError::Validation(format!("Invalid header name: {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| RuntimeError::Validation(format!("Invalid header value for {}", name)))?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    async fn attempt(&self, builder: reqwest::RequestBuilder) -> FetchOutcome {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::failure(&send_error(e)),
        };

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                let mut outcome = FetchOutcome::failure(&RuntimeError::Network(e.to_string()));
                outcome.status = Some(status.as_u16());
                return outcome;
            }
        };

        let mut outcome = FetchOutcome {
            ok: true,
            status: Some(status.as_u16()),
            ..Default::default()
        };

        if is_json {
            match serde_json::from_str::<Value>(&text) {
                Ok(payload) => outcome.payload = Some(payload),
                Err(e) => {
                    let err = RuntimeError::Parse(e.to_string());
                    outcome.ok = false;
                    outcome.error = Some(err.to_string());
                    outcome.code = Some(err.kind());
                    outcome.text = Some(text);
                    return outcome;
                }
            }
        } else {
            outcome.text = Some(text);
        }

        if !status.is_success() {
            let err = RuntimeError::Http {
                status: status.as_u16(),
            };
            outcome.ok = false;
            outcome.error = Some(err.to_string());
            outcome.code = Some(err.kind());
        }
        outcome
    }
}

fn redirect_policy(origin_guard: Option<OriginGuard>) -> Policy {
    let guard = match origin_guard {
        Some(guard) => guard,
        None => return Policy::limited(MAX_REDIRECTS),
    };
    Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let origin = attempt.url().origin().ascii_serialization();
        if guard(&origin) {
            attempt.follow()
        } else {
            warn!(origin = %origin, "Redirect to unpermitted origin stopped");
            attempt.error(RedirectDenied(origin))
        }
    })
}

/// Map a send failure, surfacing a denied redirect as a permission error
fn send_error(e: reqwest::Error) -> RuntimeError {
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        if let Some(denied) = cause.downcast_ref::<RedirectDenied>() {
            return RuntimeError::PermissionMissing(denied.0.clone());
        }
        source = cause.source();
    }
    RuntimeError::Network(e.to_string())
}

/// Origin (`scheme://host[:port]`) of a URL, used for permission checks
pub fn origin_of(url: &str) -> Result<String, RuntimeError> {
    let parsed = Url::parse(url)
        .map_err(|e| RuntimeError::Validation(format!("Invalid URL {}: {}", url, e)))?;
    let origin = parsed.origin();
    if !origin.is_tuple() {
        return Err(RuntimeError::Validation(format!("URL has no origin: {}", url)));
    }
    Ok(origin.ascii_serialization())
}
