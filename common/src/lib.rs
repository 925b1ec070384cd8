//! Shared plumbing for the status facade service.
//!
//! Holds the observability collaborators (metrics registry, log subscriber,
//! error tracking, span tracing), the generic HTTP listener used by both
//! endpoints, and CLI policy shared by binaries.

pub mod cli;
pub mod http;
pub mod observability;

pub use cli::ColorWhen;
pub use http::{spawn_http_server, ServerHandle};
pub use observability::{
    init_tracing, CompletionGuard, Dsn, ErrorReporter, EventReporter, EventWorker, LogFormat,
    MetricsContext, MetricsServerConfig, SpanGuard, Tracer, TracerConfig,
};
