//! Status Facade Library
//!
//! An instrumented `GET /` endpoint that answers `{"status":"ok"}` after a
//! simulated downstream delay, recording latency and request counts into a
//! shared [`MetricsContext`]. The metrics are scraped from a separate
//! listener owned by the same context.

pub mod delay;
pub mod handler;

pub use delay::{Delay, FixedDelay, RandomDelay};
pub use handler::{ReportPolicy, RequestLog, StatusHandler, STATUS_OPERATION};
pub use status_facade_common::{MetricsContext, MetricsServerConfig, ServerHandle};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

use status_facade_common::spawn_http_server;

/// Serves `handler` on `bind` as the application listener.
///
/// Each request is handled on its own task; a pause in one request never
/// holds up another.
///
/// # Errors
///
/// Returns error if the address cannot be bound.
pub fn spawn_status_server(handler: Arc<StatusHandler>, bind: SocketAddr) -> Result<ServerHandle> {
    // ---
    spawn_http_server("status", bind, move |req| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(req).await }
    })
}
