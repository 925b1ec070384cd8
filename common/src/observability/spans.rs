//! Distributed-tracing collaborator.
//!
//! Spans are `tracing` spans parented on the caller's request span. The
//! [`Tracer`] owns an OpenTelemetry tracer provider; installing
//! [`Tracer::layer`] in the subscriber turns those spans into OpenTelemetry
//! spans, which the provider's sampler filters and its exporter ships to the
//! configured agent over OTLP.

use anyhow::{ensure, Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler};
use opentelemetry_sdk::{runtime, Resource};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, info_span, warn, Span, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// Instrumentation scope name reported with every span.
const INSTRUMENTATION_SCOPE: &str = "status-facade";

/// Tracer settings.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    // ---
    /// Service name attached to every span.
    pub service_name: String,

    /// Constant sampler probability in `[0, 1]`; `1.0` samples everything.
    pub sample_rate: f64,

    /// OTLP/gRPC collector address spans are exported to.
    pub agent_addr: SocketAddr,
}

impl TracerConfig {
    // ---
    pub fn new(service_name: impl Into<String>, agent_addr: SocketAddr) -> Self {
        // ---
        Self {
            service_name: service_name.into(),
            sample_rate: 1.0,
            agent_addr,
        }
    }

    fn validate(&self) -> Result<()> {
        // ---
        ensure!(
            !self.service_name.trim().is_empty(),
            "tracer service name must not be empty"
        );
        ensure!(
            (0.0..=1.0).contains(&self.sample_rate),
            "tracer sample rate must be within [0, 1], got {}",
            self.sample_rate
        );
        Ok(())
    }

    fn sampler(&self) -> Sampler {
        // ---
        let root = match self.sample_rate {
            r if r >= 1.0 => Sampler::AlwaysOn,
            r if r <= 0.0 => Sampler::AlwaysOff,
            r => Sampler::TraceIdRatioBased(r),
        };
        Sampler::ParentBased(Box::new(root))
    }

    fn trace_config(&self) -> sdktrace::Config {
        // ---
        sdktrace::Config::default()
            .with_sampler(self.sampler())
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                self.service_name.clone(),
            )]))
    }
}

/// Opens spans for named operations and exports the sampled ones.
#[derive(Clone)]
pub struct Tracer {
    config: TracerConfig,
    provider: sdktrace::TracerProvider,
}

impl Tracer {
    // ---
    /// Validates `config` and builds a tracer exporting to its agent over
    /// OTLP/gRPC in batches.
    ///
    /// Must be called from within a Tokio runtime. The connection to the
    /// agent is opened lazily, so a missing agent is not an error here.
    ///
    /// # Errors
    ///
    /// Returns error if the service name is empty, the sample rate is
    /// outside `[0, 1]`, or the exporter cannot be built.
    pub fn new(config: TracerConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(format!("http://{}", config.agent_addr))
            .build_span_exporter()
            .context("failed to build OTLP span exporter")?;

        let provider = sdktrace::TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(config.trace_config())
            .build();

        Ok(Self { config, provider })
    }

    /// Builds a tracer that hands every finished span to `exporter` as soon
    /// as it closes.
    pub fn with_exporter<E>(config: TracerConfig, exporter: E) -> Result<Self>
    where
        E: SpanExporter + 'static,
    {
        // ---
        config.validate()?;

        let provider = sdktrace::TracerProvider::builder()
            .with_simple_exporter(exporter)
            .with_config(config.trace_config())
            .build();

        Ok(Self { config, provider })
    }

    /// Parses `agent` and builds a tracer with the constant sampler.
    pub fn with_agent(service_name: &str, agent: &str) -> Result<Self> {
        // ---
        let agent_addr = agent
            .parse()
            .with_context(|| format!("invalid tracing agent address: {agent}"))?;
        Self::new(TracerConfig::new(service_name, agent_addr))
    }

    pub fn config(&self) -> &TracerConfig {
        // ---
        &self.config
    }

    /// Subscriber layer bridging `tracing` spans into this tracer's provider.
    pub fn layer<S>(&self) -> OpenTelemetryLayer<S, sdktrace::Tracer>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        // ---
        tracing_opentelemetry::layer()
            .with_tracer(self.provider.tracer(INSTRUMENTATION_SCOPE))
    }

    /// Starts a span for `operation` under `parent`.
    ///
    /// Whether it is exported is up to the sampler once the span reaches the
    /// OpenTelemetry layer.
    pub fn start_span(&self, operation: &'static str, parent: &Span) -> SpanGuard {
        // ---
        let span = info_span!(
            parent: parent,
            "span",
            otel.name = operation,
            otel.kind = "server",
            span.type = "request",
            operation,
            service = %self.config.service_name,
        );

        SpanGuard {
            span,
            operation,
            started: Instant::now(),
        }
    }

    /// Exports every span still buffered by the batch processor.
    ///
    /// Flushing blocks on the exporter, so it runs on the blocking pool.
    pub async fn flush(&self) {
        // ---
        let provider = self.provider.clone();
        match tokio::task::spawn_blocking(move || provider.force_flush()).await {
            Ok(results) => {
                for res in results {
                    if let Err(e) = res {
                        warn!("Span export flush failed: {e}");
                    }
                }
            }
            Err(e) => warn!("Span export flush task failed: {e}"),
        }
    }
}

/// An open span; closed by [`SpanGuard::finish`].
#[derive(Debug)]
pub struct SpanGuard {
    // ---
    span: Span,
    operation: &'static str,
    started: Instant,
}

impl SpanGuard {
    // ---
    pub fn span(&self) -> &Span {
        // ---
        &self.span
    }

    pub fn operation(&self) -> &'static str {
        // ---
        self.operation
    }

    /// Logs the span's duration and closes it.
    pub fn finish(self) {
        // ---
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.span.in_scope(|| {
            info!(operation = self.operation, elapsed_ms, "Reporting span");
        });
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{EnvFilter, Registry};

    /// Log sink shared between a test and its subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            let buf = self.0.lock().expect("lock poisoned");
            String::from_utf8_lossy(&buf).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn agent() -> SocketAddr {
        // ---
        "127.0.0.1:4317".parse().expect("valid address")
    }

    fn in_memory(sample_rate: f64) -> (Tracer, InMemorySpanExporter) {
        // ---
        let exporter = InMemorySpanExporter::default();
        let mut config = TracerConfig::new("status-service", agent());
        config.sample_rate = sample_rate;
        let tracer = Tracer::with_exporter(config, exporter.clone()).expect("valid tracer");
        (tracer, exporter)
    }

    #[test]
    fn test_defaults_to_constant_sampler() {
        // ---
        let config = TracerConfig::new("status-service", agent());
        assert_eq!(config.sample_rate, 1.0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        // ---
        let mut config = TracerConfig::new("status-service", agent());
        config.sample_rate = 1.5;
        assert!(Tracer::new(config.clone()).is_err());

        config.sample_rate = -0.1;
        assert!(Tracer::new(config).is_err());

        assert!(Tracer::new(TracerConfig::new("  ", agent())).is_err());
        assert!(Tracer::with_agent("status-service", "not-an-address").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_otlp_tracer_builds_without_running_agent() {
        // ---
        let tracer = Tracer::with_agent("status-service", "127.0.0.1:4317").expect("valid tracer");
        assert_eq!(tracer.config().agent_addr, agent());
        tracer.flush().await;
    }

    #[test]
    fn test_full_sampling_exports_every_span() {
        // ---
        let (tracer, exporter) = in_memory(1.0);
        let subscriber = Registry::default().with(tracer.layer());

        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..5 {
                let guard = tracer.start_span("/getStatus", &Span::current());
                assert_eq!(guard.operation(), "/getStatus");
                guard.finish();
            }
        });

        let spans = exporter.get_finished_spans().expect("exporter readable");
        assert_eq!(spans.len(), 5);
        assert!(spans.iter().all(|s| s.name == "/getStatus"));
    }

    #[test]
    fn test_zero_sampling_exports_nothing() {
        // ---
        let (tracer, exporter) = in_memory(0.0);
        let subscriber = Registry::default().with(tracer.layer());

        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..5 {
                tracer.start_span("/getStatus", &Span::current()).finish();
            }
        });

        let spans = exporter.get_finished_spans().expect("exporter readable");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_child_span_shares_request_trace() {
        // ---
        let (tracer, exporter) = in_memory(1.0);
        let subscriber = Registry::default().with(tracer.layer());

        tracing::subscriber::with_default(subscriber, || {
            let request = tracing::info_span!("request");
            tracer.start_span("/getStatus", &request).finish();
        });

        let spans = exporter.get_finished_spans().expect("exporter readable");
        assert_eq!(spans.len(), 2);
        let child = spans.iter().find(|s| s.name == "/getStatus").expect("child");
        let parent = spans.iter().find(|s| s.name == "request").expect("parent");
        assert_eq!(
            child.span_context.trace_id(),
            parent.span_context.trace_id()
        );
        assert_eq!(child.parent_span_id, parent.span_context.span_id());
    }

    #[test]
    fn test_finish_is_visible_at_default_level() {
        // ---
        let (tracer, _exporter) = in_memory(1.0);
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracer.start_span("/getStatus", &Span::current()).finish();
        });

        let out = logs.contents();
        assert!(out.contains("Reporting span"), "captured: {out:?}");
        assert!(out.contains("/getStatus"), "captured: {out:?}");
        assert!(out.contains("elapsed_ms"), "captured: {out:?}");
    }
}
