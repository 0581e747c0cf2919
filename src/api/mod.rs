//! HTTP API Module
//!
//! Read-only status endpoints for the replication daemon.

mod http;

pub use http::{AppState, HealthResponse, StatusResponse, StatusServer};
