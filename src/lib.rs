//! Courier: Typed Cross-Context Messaging
//!
//! An unprivileged observer hands typed requests across an isolation boundary
//! to a privileged service that owns storage and network access. Requests are
//! batched, lookups are cached with per-entry expiry, and every outbound call
//! is bounded by a hard timeout.

pub mod batcher;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod logging;
pub mod observer;
pub mod protocol;
pub mod router;
pub mod service;
pub mod store;
pub mod transport;
pub mod watch;
