//! Integration tests for the service backend against a local HTTP service
//!
//! Tests cover:
//! - LOOKUP_BATCH serves hits from the TTL cache and fetches only misses
//! - Catalog persistence and forced refresh
//! - Origin permission checks before any network call, including redirect hops
//! - GraphQL error folding and credential headers
//! - Settings persistence through the sled-backed host

use super::test_utils::{configure, memory_context, Reply, TestServer};
use courier::config::CourierConfig;
use courier::error::ErrorKind;
use courier::router::Backend;
use courier::service::{Context, ServiceBackend};
use courier::store::Settings;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Service stub answering the lookup, catalog, search and items endpoints
async fn service_stub() -> TestServer {
    TestServer::start(|request| {
        let path = request.target.split('?').next().unwrap_or_default().to_string();
        match (request.method.as_str(), path.as_str()) {
            ("POST", "/lookup") => {
                let mut results = Map::new();
                for id in request.json()["ids"].as_array().cloned().unwrap_or_default() {
                    if let Some(id) = id.as_str() {
                        if id != "missing" {
                            results.insert(id.to_string(), json!({ "title": format!("Title {}", id) }));
                        }
                    }
                }
                Reply::json(200, json!({ "results": results }))
            }
            ("GET", "/catalog") => Reply::json(200, json!({ "items": [{ "id": "c1" }, { "id": "c2" }] })),
            ("GET", "/search") => Reply::json(200, json!({ "results": [{ "id": "s1" }] })),
            ("POST", "/items") => Reply::json(201, request.json()),
            ("POST", "/graphql") => {
                if request.json()["query"].as_str().unwrap_or_default().contains("broken") {
                    Reply::json(
                        200,
                        json!({ "errors": [{ "message": "Field missing" }, { "message": "Bad cursor" }] }),
                    )
                } else {
                    Reply::json(200, json!({ "data": { "viewer": { "id": "v1" } } }))
                }
            }
            ("GET", "/broken") => Reply::json(500, json!({ "message": "boom" })),
            _ => Reply::json(404, json!({ "message": "not found" })),
        }
    })
    .await
}

fn lookup_ids(server: &TestServer) -> Vec<Vec<String>> {
    server
        .requests()
        .iter()
        .filter(|r| r.target == "/lookup")
        .map(|r| serde_json::from_value(r.json()["ids"].clone()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_lookup_batch_fetches_only_misses() {
    let server = service_stub().await;
    let ctx = memory_context(&[server.url.as_str()]);
    configure(&ctx, &server.url, "secret");
    let backend = ServiceBackend::new(Arc::clone(&ctx));

    let first = backend
        .lookup_batch(vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert!(first.ok);
    assert_eq!(first.get("cached"), Some(&json!(0)));
    assert_eq!(first.get("results").unwrap()["a"], json!({ "title": "Title a" }));

    let second = backend
        .lookup_batch(vec!["a".to_string(), "b".to_string(), "c".to_string(), "a".to_string()])
        .await
        .unwrap();
    assert!(second.ok);
    assert_eq!(second.get("cached"), Some(&json!(2)));
    assert_eq!(second.get("results").unwrap().as_object().unwrap().len(), 3);

    assert_eq!(
        lookup_ids(&server),
        vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()]
        ]
    );
    assert_eq!(server.requests()[0].header("x-api-key"), Some("secret"));
    assert_eq!(ctx.cached_lookups(), 3);

    // Fully cached batches never touch the network
    let third = backend.lookup_batch(vec!["b".to_string()]).await.unwrap();
    assert_eq!(third.get("cached"), Some(&json!(1)));
    assert_eq!(lookup_ids(&server).len(), 2);
}

#[tokio::test]
async fn test_lookup_batch_omits_unknown_ids_and_retries_them() {
    let server = service_stub().await;
    let ctx = memory_context(&["*"]);
    configure(&ctx, &server.url, "");
    let backend = ServiceBackend::new(ctx);

    let response = backend
        .lookup_batch(vec!["missing".to_string(), "x".to_string()])
        .await
        .unwrap();
    let results = response.get("results").unwrap().as_object().unwrap();
    assert!(results.contains_key("x"));
    assert!(!results.contains_key("missing"));

    backend.lookup_batch(vec!["missing".to_string()]).await.unwrap();
    assert_eq!(lookup_ids(&server).last().unwrap(), &vec!["missing".to_string()]);
    assert!(server.requests()[0].header("x-api-key").is_none());
}

#[tokio::test]
async fn test_empty_ids_is_validation_error() {
    let backend = ServiceBackend::new(memory_context(&["*"]));
    let response = backend
        .lookup_batch(vec![" ".to_string(), String::new()])
        .await
        .unwrap();
    assert!(!response.ok);
    assert_eq!(response.code, Some(ErrorKind::ValidationError));
}

#[tokio::test]
async fn test_denied_origin_is_permission_missing() {
    let server = service_stub().await;
    let ctx = memory_context(&["https://elsewhere.example.com"]);
    configure(&ctx, &server.url, "secret");
    let backend = ServiceBackend::new(ctx);

    let response = backend.lookup_batch(vec!["a".to_string()]).await.unwrap();
    assert!(!response.ok);
    assert_eq!(response.code, Some(ErrorKind::PermissionMissing));
    assert!(response.error.as_deref().unwrap_or_default().contains("127.0.0.1"));

    let fetched = backend
        .fetch_json(server.url.clone(), None, BTreeMap::new(), None, None)
        .await
        .unwrap();
    assert_eq!(fetched.code, Some(ErrorKind::PermissionMissing));
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_redirect_to_unpermitted_origin_is_permission_missing() {
    let target = TestServer::start(|_| Reply::json(200, json!({ "secret": "leaked" }))).await;
    let location = format!("{}/lookup", target.url);
    let redirector = TestServer::start(move |_| Reply::redirect(location.clone())).await;
    let ctx = memory_context(&[redirector.url.as_str()]);
    configure(&ctx, &redirector.url, "secret");
    let backend = ServiceBackend::new(ctx);

    let fetched = backend
        .fetch_json(format!("{}/start", redirector.url), None, BTreeMap::new(), None, Some(2_000))
        .await
        .unwrap();
    assert!(!fetched.ok);
    assert_eq!(fetched.code, Some(ErrorKind::PermissionMissing));
    assert!(fetched.error.as_deref().unwrap_or_default().contains(&target.url));
    assert!(fetched.get("data").is_none());

    // The credential-bearing service call stops at the same hop
    let looked_up = backend.lookup_batch(vec!["a".to_string()]).await.unwrap();
    assert!(!looked_up.ok);
    assert_eq!(looked_up.code, Some(ErrorKind::PermissionMissing));

    assert_eq!(redirector.hits(), 2);
    assert_eq!(target.hits(), 0);
}

#[tokio::test]
async fn test_redirect_between_permitted_origins_is_followed() {
    let target = service_stub().await;
    let location = format!("{}/catalog", target.url);
    let redirector = TestServer::start(move |_| Reply::redirect(location.clone())).await;
    let ctx = memory_context(&[redirector.url.as_str(), target.url.as_str()]);
    let backend = ServiceBackend::new(ctx);

    let fetched = backend
        .fetch_json(format!("{}/old-catalog", redirector.url), None, BTreeMap::new(), None, Some(2_000))
        .await
        .unwrap();
    assert!(fetched.ok);
    assert_eq!(fetched.status, Some(200));
    assert_eq!(
        fetched.get("data"),
        Some(&json!({ "items": [{ "id": "c1" }, { "id": "c2" }] }))
    );
    assert_eq!(target.hits(), 1);
}

#[tokio::test]
async fn test_disabled_integration_is_validation_error() {
    let server = service_stub().await;
    let ctx = memory_context(&["*"]);
    let settings = Settings {
        service_url: server.url.clone(),
        enabled: false,
        ..Settings::default()
    };
    ctx.stores().save_settings(&settings).unwrap();

    let response = ServiceBackend::new(ctx)
        .search("dune".to_string())
        .await
        .unwrap();
    assert_eq!(response.code, Some(ErrorKind::ValidationError));
    assert_eq!(response.error.as_deref(), Some("Integration is disabled"));
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn test_catalog_is_persisted_and_refreshable() {
    let server = service_stub().await;
    let ctx = memory_context(&["*"]);
    configure(&ctx, &server.url, "secret");
    let backend = ServiceBackend::new(Arc::clone(&ctx));

    let fresh = backend.get_catalog(false).await.unwrap();
    assert_eq!(fresh.get("cached"), Some(&json!(false)));
    assert_eq!(fresh.get("items").unwrap().as_array().unwrap().len(), 2);

    let cached = backend.get_catalog(false).await.unwrap();
    assert_eq!(cached.get("cached"), Some(&json!(true)));
    assert_eq!(cached.get("items"), fresh.get("items"));
    assert_eq!(server.hits(), 1);

    let forced = backend.get_catalog(true).await.unwrap();
    assert_eq!(forced.get("cached"), Some(&json!(false)));
    assert_eq!(server.hits(), 2);
    assert!(ctx.stores().catalog().unwrap().stored_at_ms > 0);
}

#[tokio::test]
async fn test_search_encodes_term() {
    let server = service_stub().await;
    let ctx = memory_context(&["*"]);
    configure(&ctx, &server.url, "");
    let backend = ServiceBackend::new(ctx);

    let response = backend.search("  dune part two ".to_string()).await.unwrap();
    assert!(response.ok);
    assert_eq!(response.get("results"), Some(&json!([{ "id": "s1" }])));
    assert_eq!(server.requests()[0].target, "/search?term=dune+part+two");
}

#[tokio::test]
async fn test_add_item_requires_id_and_posts() {
    let server = service_stub().await;
    let ctx = memory_context(&["*"]);
    configure(&ctx, &server.url, "");
    let backend = ServiceBackend::new(ctx);

    let missing = backend.add_item(json!({ "title": "No id" })).await.unwrap();
    assert_eq!(missing.code, Some(ErrorKind::ValidationError));
    assert_eq!(server.hits(), 0);

    let added = backend
        .add_item(json!({ "id": "n1", "title": "New" }))
        .await
        .unwrap();
    assert!(added.ok);
    assert_eq!(added.get("item"), Some(&json!({ "id": "n1", "title": "New" })));
    assert_eq!(server.requests()[0].target, "/items");
}

#[tokio::test]
async fn test_fetch_json_http_error_is_reported() {
    let server = service_stub().await;
    let backend = ServiceBackend::new(memory_context(&["*"]));

    let response = backend
        .fetch_json(format!("{}/broken", server.url), None, BTreeMap::new(), None, Some(2_000))
        .await
        .unwrap();
    assert!(!response.ok);
    assert_eq!(response.request_type, "FETCH_JSON");
    assert_eq!(response.code, Some(ErrorKind::HttpError));
    assert_eq!(response.status, Some(500));
    assert_eq!(response.get("data"), Some(&json!({ "message": "boom" })));
}

#[tokio::test]
async fn test_graphql_data_and_errors() {
    let server = service_stub().await;
    let backend = ServiceBackend::new(memory_context(&["*"]));
    let endpoint = format!("{}/graphql", server.url);

    let ok = backend
        .graphql(
            endpoint.clone(),
            "{ viewer { id } }".to_string(),
            Some(json!({ "first": 5 })),
            Some("tok".to_string()),
            None,
        )
        .await
        .unwrap();
    assert!(ok.ok);
    assert_eq!(ok.get("data"), Some(&json!({ "viewer": { "id": "v1" } })));

    let sent = &server.requests()[0];
    assert_eq!(sent.header("authorization"), Some("Bearer tok"));
    assert_eq!(sent.json()["variables"], json!({ "first": 5 }));

    let failed = backend
        .graphql(endpoint, "{ broken }".to_string(), None, None, None)
        .await
        .unwrap();
    assert!(!failed.ok);
    assert_eq!(failed.code, Some(ErrorKind::HttpError));
    assert_eq!(failed.error.as_deref(), Some("Field missing; Bad cursor"));
    assert!(server.requests()[1].header("authorization").is_none());
}

#[tokio::test]
async fn test_settings_persist_in_local_host() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = CourierConfig::default();
    config.host.storage_path = Some(temp_dir.path().join("db"));

    {
        let ctx = Arc::new(Context::new(config.clone()).unwrap());
        assert_eq!(ctx.host().name(), "local");
        let backend = ServiceBackend::new(ctx);
        let settings = Settings {
            service_url: " https://api.example.com/ ".to_string(),
            api_key: "k".to_string(),
            ..Settings::default()
        };
        let saved = backend.save_settings(settings).await.unwrap();
        assert!(saved.ok);
    }

    let ctx = Arc::new(Context::new(config).unwrap());
    let response = ServiceBackend::new(ctx).get_settings().await.unwrap();
    let settings: Settings =
        serde_json::from_value(response.get("settings").cloned().unwrap_or(Value::Null)).unwrap();
    assert_eq!(settings.service_url, "https://api.example.com/");
    assert_eq!(settings.api_key, "k");
    assert!(settings.enabled);
}
