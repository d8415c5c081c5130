//! Request/Response Schema
//!
//! Every message crossing the isolation boundary is a flat JSON object with a
//! string `type` discriminant drawn from a closed enumeration. Responses always
//! carry `ok` and echo the request's `type`.

use crate::error::{ErrorKind, RuntimeError};
use crate::store::Settings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Discriminant of every request the privileged side understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Ping,
    GetSettings,
    SaveSettings,
    GetSelections,
    SaveSelection,
    ExcludeItem,
    FetchJson,
    Graphql,
    LookupBatch,
    GetCatalog,
    Search,
    AddItem,
}

impl RequestType {
    pub const ALL: [RequestType; 12] = [
        RequestType::Ping,
        RequestType::GetSettings,
        RequestType::SaveSettings,
        RequestType::GetSelections,
        RequestType::SaveSelection,
        RequestType::ExcludeItem,
        RequestType::FetchJson,
        RequestType::Graphql,
        RequestType::LookupBatch,
        RequestType::GetCatalog,
        RequestType::Search,
        RequestType::AddItem,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Ping => "PING",
            RequestType::GetSettings => "GET_SETTINGS",
            RequestType::SaveSettings => "SAVE_SETTINGS",
            RequestType::GetSelections => "GET_SELECTIONS",
            RequestType::SaveSelection => "SAVE_SELECTION",
            RequestType::ExcludeItem => "EXCLUDE_ITEM",
            RequestType::FetchJson => "FETCH_JSON",
            RequestType::Graphql => "GRAPHQL",
            RequestType::LookupBatch => "LOOKUP_BATCH",
            RequestType::GetCatalog => "GET_CATALOG",
            RequestType::Search => "SEARCH",
            RequestType::AddItem => "ADD_ITEM",
        }
    }

    /// Resolve a raw discriminant; `None` for anything outside the enumeration
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed request. Serialized with the variant name in `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Ping,
    GetSettings,
    SaveSettings {
        settings: Settings,
    },
    GetSelections,
    SaveSelection {
        key: String,
        #[serde(default)]
        value: Value,
    },
    ExcludeItem {
        id: String,
    },
    FetchJson {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Graphql {
        endpoint: String,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
        #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    LookupBatch {
        ids: Vec<String>,
    },
    GetCatalog {
        #[serde(rename = "forceRefresh", default)]
        force_refresh: bool,
    },
    Search {
        term: String,
    },
    AddItem {
        item: Value,
    },
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Ping => RequestType::Ping,
            Request::GetSettings => RequestType::GetSettings,
            Request::SaveSettings { .. } => RequestType::SaveSettings,
            Request::GetSelections => RequestType::GetSelections,
            Request::SaveSelection { .. } => RequestType::SaveSelection,
            Request::ExcludeItem { .. } => RequestType::ExcludeItem,
            Request::FetchJson { .. } => RequestType::FetchJson,
            Request::Graphql { .. } => RequestType::Graphql,
            Request::LookupBatch { .. } => RequestType::LookupBatch,
            Request::GetCatalog { .. } => RequestType::GetCatalog,
            Request::Search { .. } => RequestType::Search,
            Request::AddItem { .. } => RequestType::AddItem,
        }
    }
}

/// Exactly one of these is produced per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Response {
    pub fn success(request_type: impl fmt::Display) -> Self {
        Self {
            ok: true,
            request_type: request_type.to_string(),
            error: None,
            code: None,
            status: None,
            payload: Map::new(),
        }
    }

    pub fn failure(
        request_type: impl fmt::Display,
        code: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            ok: false,
            request_type: request_type.to_string(),
            error: Some(error.into()),
            code: Some(code),
            status: None,
            payload: Map::new(),
        }
    }

    pub fn invalid(request_type: impl fmt::Display, error: impl Into<String>) -> Self {
        Self::failure(request_type, ErrorKind::ValidationError, error)
    }

    pub fn from_error(request_type: impl fmt::Display, err: &RuntimeError) -> Self {
        let mut response = Self::failure(request_type, err.kind(), err.to_string());
        response.status = err.status();
        response
    }

    /// Attach a payload field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "ok": false,
                "type": self.request_type,
                "error": format!("Failed to encode response: {}", e),
                "code": ErrorKind::InternalError,
            })
        })
    }
}

/// Read the discriminant of a raw message
pub fn discriminant(raw: &Value) -> Option<&str> {
    raw.get("type").and_then(Value::as_str)
}
