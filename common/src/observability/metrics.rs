//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. It is constructed explicitly
//! at startup and handed to every listener that needs it; clones share the
//! same underlying atomics.

use anyhow::{Context, Result};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::core::Metric;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::time::Instant;

use crate::http::{spawn_http_server, ServerHandle};

/// Namespace prefix applied to every metric name.
pub const NAMESPACE: &str = "geekbrains";

/// Latency histogram bucket upper bounds, in seconds.
pub const LATENCY_BUCKETS: [f64; 13] = [
    0.0, 25.0, 50.0, 75.0, 100.0, 200.0, 400.0, 600.0, 800.0, 1000.0, 2000.0, 4000.0, 6000.0,
];

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `0.0.0.0:84`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Thin, explicit wrapper around the `prometheus` crate so the request path
/// is just a histogram observation and a counter increment.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    /// Request durations (seconds).
    latency: Histogram,

    /// Completed requests.
    requests: IntCounter,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the request instruments.
    ///
    /// # Errors
    ///
    /// Returns error if the instruments are rejected by the registry.
    pub fn new() -> Result<Self> {
        // ---
        let registry = Registry::new_custom(Some(NAMESPACE.into()), None)
            .context("failed to create metrics registry")?;

        let latency = Histogram::with_opts(
            HistogramOpts::new("latency", "time series request").buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let requests = IntCounter::with_opts(Opts::new("request", "request for '/'"))?;

        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(requests.clone()))?;

        Ok(Self {
            registry,
            latency,
            requests,
        })
    }

    /// Starts recording a request that began at `started`.
    ///
    /// The returned guard observes the latency and bumps the request counter
    /// exactly once, on `finish()` or on drop.
    pub fn record_completion(&self, started: Instant) -> CompletionGuard {
        // ---
        CompletionGuard {
            latency: self.latency.clone(),
            requests: self.requests.clone(),
            started,
            recorded: false,
        }
    }

    /// Number of completed requests.
    pub fn request_count(&self) -> u64 {
        // ---
        self.requests.get()
    }

    /// Number of latency observations.
    pub fn latency_sample_count(&self) -> u64 {
        // ---
        self.latency.get_sample_count()
    }

    /// `(upper_bound, cumulative_count)` per bucket, excluding `+Inf`.
    pub fn latency_buckets(&self) -> Vec<(f64, u64)> {
        // ---
        self.latency
            .metric()
            .get_histogram()
            .get_bucket()
            .iter()
            .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
            .collect()
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Renders every registered metric in the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails.
    pub fn encode_text(&self) -> Result<String> {
        // ---
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output is not UTF-8")
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it and own its shutdown.
    ///
    /// # Errors
    ///
    /// Returns error if the bind address is unavailable.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> Result<ServerHandle> {
        // ---
        let registry = self.registry.clone();
        spawn_http_server("metrics", cfg.bind, move |req| {
            let registry = registry.clone();
            async move { handle_metrics_request(req, &registry) }
        })
    }
}

/// Records one completed request when finished or dropped.
#[must_use = "dropping the guard immediately records the request"]
pub struct CompletionGuard {
    // ---
    latency: Histogram,
    requests: IntCounter,
    started: Instant,
    recorded: bool,
}

impl CompletionGuard {
    // ---
    /// Seconds elapsed since the request started.
    pub fn elapsed_secs(&self) -> f64 {
        // ---
        self.started.elapsed().as_secs_f64()
    }

    /// Records the request now and returns the observed latency.
    pub fn finish(mut self) -> f64 {
        // ---
        self.record()
    }

    fn record(&mut self) -> f64 {
        // ---
        let elapsed = self.elapsed_secs();
        if !self.recorded {
            self.recorded = true;
            self.latency.observe(elapsed);
            self.requests.inc();
        }
        elapsed
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // ---
        self.record();
    }
}

fn handle_metrics_request(req: Request<Body>, registry: &Registry) -> Response<Body> {
    // ---
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return resp;
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    fn sample_value(text: &str, name: &str) -> Option<f64> {
        // ---
        text.lines()
            .filter(|line| !line.starts_with('#'))
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
            .and_then(|v| v.trim().parse().ok())
    }

    #[test]
    fn metrics_context_registers_both_instruments() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        let names: Vec<String> = ctx.gather().iter().map(|f| f.get_name().to_string()).collect();

        assert!(names.contains(&"geekbrains_latency".to_string()));
        assert!(names.contains(&"geekbrains_request".to_string()));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn fresh_context_exposes_zero_values() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        let text = ctx.encode_text().expect("encode should succeed");

        assert_eq!(sample_value(&text, "geekbrains_request"), Some(0.0));
        assert_eq!(sample_value(&text, "geekbrains_latency_count"), Some(0.0));
    }

    #[test]
    fn buckets_match_configuration() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        let bounds: Vec<f64> = ctx.latency_buckets().iter().map(|(b, _)| *b).collect();
        assert_eq!(bounds, LATENCY_BUCKETS.to_vec());
    }

    #[test]
    fn guard_records_exactly_once() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");

        let guard = ctx.record_completion(Instant::now());
        let elapsed = guard.finish();
        assert!(elapsed >= 0.0);

        assert_eq!(ctx.request_count(), 1);
        assert_eq!(ctx.latency_sample_count(), 1);
    }

    #[test]
    fn guard_records_on_drop() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        {
            let _guard = ctx.record_completion(Instant::now());
        }
        assert_eq!(ctx.request_count(), 1);
        assert_eq!(ctx.latency_sample_count(), 1);
    }

    #[test]
    fn fast_requests_land_in_first_positive_bucket() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        for _ in 0..3 {
            let started = Instant::now() - Duration::from_millis(5);
            ctx.record_completion(started).finish();
        }

        let buckets = ctx.latency_buckets();
        assert_eq!(buckets[0], (0.0, 0));
        assert_eq!(buckets[1], (25.0, 3));
        assert_eq!(buckets.last().map(|(_, c)| *c), Some(3));
    }

    #[test]
    fn clones_share_instruments() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        let other = ctx.clone();
        other.record_completion(Instant::now()).finish();
        assert_eq!(ctx.request_count(), 1);
    }

    #[test]
    fn unknown_path_is_not_found() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        let req = Request::builder()
            .uri("/other")
            .body(Body::empty())
            .expect("valid request");

        let resp = handle_metrics_request(req, &ctx.registry);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn metrics_path_sets_exposition_content_type() {
        // ---
        let ctx = MetricsContext::new().expect("MetricsContext should init");
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .expect("valid request");

        let resp = handle_metrics_request(req, &ctx.registry);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
