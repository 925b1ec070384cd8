//! Observability utilities (metrics, logging, error tracking, spans).

mod logging;
mod metrics;
mod reporter;
mod spans;

pub use self::logging::{init_tracing, LogFormat};
pub use self::metrics::{CompletionGuard, MetricsContext, MetricsServerConfig, LATENCY_BUCKETS};
pub use self::reporter::{
    Dsn, ErrorReporter, EventReporter, EventWorker, DEFAULT_QUEUE_CAPACITY,
};
pub use self::spans::{SpanGuard, Tracer, TracerConfig};
