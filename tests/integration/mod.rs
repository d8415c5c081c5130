//! Integration tests for the Courier messaging runtime

mod observer_flow;
mod service_handlers;
mod timed_fetch;
