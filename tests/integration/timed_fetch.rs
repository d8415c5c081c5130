//! Integration tests for the timed fetch against local HTTP servers
//!
//! Tests cover:
//! - Hard timeout against a silent endpoint
//! - HTTP error statuses keep their payload
//! - Unparseable JSON keeps the raw text
//! - Connection failures map to network errors

use super::test_utils::{closed_port_url, silent_server, Reply, TestServer};
use courier::error::ErrorKind;
use courier::fetch::{FetchRequest, Fetcher, DEFAULT_TIMEOUT};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_silent_endpoint_times_out_on_schedule() {
    let (url, _server) = silent_server().await;
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();

    let started = Instant::now();
    let outcome = fetcher
        .execute(FetchRequest::get(url).with_timeout(Duration::from_millis(50)))
        .await;
    let elapsed = started.elapsed();

    assert!(!outcome.ok);
    assert_eq!(outcome.code, Some(ErrorKind::Timeout));
    assert_eq!(outcome.error.as_deref(), Some("Timeout"));
    assert!(outcome.status.is_none());
    assert!(elapsed >= Duration::from_millis(50), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(250), "returned after {:?}", elapsed);
}

#[tokio::test]
async fn test_json_success() {
    let server = TestServer::start(|_| Reply::json(200, json!({ "hello": "world" }))).await;
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();

    let outcome = fetcher
        .execute(FetchRequest::get(format!("{}/greeting", server.url)))
        .await;
    assert!(outcome.ok);
    assert_eq!(outcome.status, Some(200));
    assert_eq!(outcome.payload, Some(json!({ "hello": "world" })));
    assert_eq!(server.requests()[0].target, "/greeting");
}

#[tokio::test]
async fn test_http_error_keeps_status_and_payload() {
    let server =
        TestServer::start(|_| Reply::json(500, json!({ "message": "upstream exploded" }))).await;
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();

    let outcome = fetcher.execute(FetchRequest::get(server.url.clone())).await;
    assert!(!outcome.ok);
    assert_eq!(outcome.code, Some(ErrorKind::HttpError));
    assert_eq!(outcome.status, Some(500));
    assert_eq!(outcome.error.as_deref(), Some("HTTP 500"));
    assert_eq!(outcome.payload, Some(json!({ "message": "upstream exploded" })));
}

#[tokio::test]
async fn test_bad_json_is_parse_error_with_text() {
    let server =
        TestServer::start(|_| Reply::raw(200, "application/json", "{ not json")).await;
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();

    let outcome = fetcher.execute(FetchRequest::get(server.url.clone())).await;
    assert!(!outcome.ok);
    assert_eq!(outcome.code, Some(ErrorKind::ParseError));
    assert_eq!(outcome.status, Some(200));
    assert_eq!(outcome.text.as_deref(), Some("{ not json"));
    assert!(outcome
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("Invalid JSON response"));
}

#[tokio::test]
async fn test_non_json_body_is_returned_as_text() {
    let server = TestServer::start(|_| Reply::raw(200, "text/plain", "pong")).await;
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();

    let outcome = fetcher.execute(FetchRequest::get(server.url.clone())).await;
    assert!(outcome.ok);
    assert_eq!(outcome.text.as_deref(), Some("pong"));
    assert!(outcome.payload.is_none());
}

#[tokio::test]
async fn test_post_sends_body_and_headers() {
    let server = TestServer::start(|request| Reply::json(201, request.json())).await;
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();

    let request = FetchRequest::post_json(format!("{}/items", server.url), &json!({ "id": "x" }))
        .with_header("X-Trace", "abc");
    let outcome = fetcher.execute(request).await;
    assert!(outcome.ok);
    assert_eq!(outcome.status, Some(201));
    assert_eq!(outcome.payload, Some(json!({ "id": "x" })));

    let seen = &server.requests()[0];
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.header("x-trace"), Some("abc"));
    assert_eq!(seen.header("content-type"), Some("application/json"));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let fetcher = Fetcher::new(DEFAULT_TIMEOUT).unwrap();
    let outcome = fetcher.execute(FetchRequest::get(closed_port_url())).await;
    assert!(!outcome.ok);
    assert_eq!(outcome.code, Some(ErrorKind::NetworkError));
    assert!(outcome.status.is_none());
}
