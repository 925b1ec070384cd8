//! Instrumented handler for `GET /`.
//!
//! Every served request pauses for the configured [`Delay`], answers with a
//! fixed JSON status, and is recorded into the latency histogram and the
//! request counter. Request logging, error reporting and span tracing are
//! optional collaborators attached at construction.

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, event, Level, Span};

use status_facade_common::{ErrorReporter, MetricsContext, Tracer};

use crate::delay::Delay;

/// Span operation name for status requests.
pub const STATUS_OPERATION: &str = "/getStatus";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

/// When to hand request summaries to the error reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportPolicy {
    /// One event per served request, successful or not.
    #[default]
    EveryRequest,

    /// Only requests answered with a server error.
    FailuresOnly,
}

impl ReportPolicy {
    // ---
    fn should_report(self, status: StatusCode) -> bool {
        // ---
        match self {
            ReportPolicy::EveryRequest => true,
            ReportPolicy::FailuresOnly => status.is_server_error(),
        }
    }
}

/// Static fields attached to every request log line.
#[derive(Debug, Clone)]
pub struct RequestLog {
    // ---
    pub app: String,
    pub environment: String,

    /// Level for served requests; server errors always log at `ERROR`.
    pub level: Level,
}

impl RequestLog {
    // ---
    pub fn new(app: impl Into<String>, environment: impl Into<String>) -> Self {
        // ---
        Self {
            app: app.into(),
            environment: environment.into(),
            level: Level::INFO,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        // ---
        self.level = level;
        self
    }

    fn emit(&self, summary: &RequestSummary<'_>, status: StatusCode) {
        // ---
        let level = if status.is_server_error() {
            Level::ERROR
        } else {
            self.level
        };

        // Event levels must be constants at the callsite.
        macro_rules! request_event {
            ($lvl:expr) => {
                event!(
                    $lvl,
                    app = %self.app,
                    environment = %self.environment,
                    method = %summary.method,
                    uri = summary.uri,
                    elapsed_secs = summary.elapsed_secs,
                    status = status.as_u16(),
                    "{}",
                    summary
                )
            };
        }

        match level {
            Level::ERROR => request_event!(Level::ERROR),
            Level::WARN => request_event!(Level::WARN),
            Level::INFO => request_event!(Level::INFO),
            Level::DEBUG => request_event!(Level::DEBUG),
            _ => request_event!(Level::TRACE),
        }
    }
}

/// Per-request facts, discarded once the response is built.
#[derive(Debug)]
struct RequestContext {
    method: Method,
    uri: String,
    started: Instant,
}

impl RequestContext {
    // ---
    fn capture(req: &Request<Body>) -> Self {
        // ---
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());

        Self {
            method: req.method().clone(),
            uri,
            started: Instant::now(),
        }
    }
}

/// Text handed to the log and error sinks.
struct RequestSummary<'a> {
    method: &'a Method,
    uri: &'a str,
    elapsed_secs: f64,
}

impl fmt::Display for RequestSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "method={} uri={} elapsed={:.5}s",
            self.method, self.uri, self.elapsed_secs
        )
    }
}

/// The instrumented `GET /` handler.
pub struct StatusHandler {
    // ---
    metrics: MetricsContext,
    delay: Arc<dyn Delay>,
    request_log: Option<RequestLog>,
    reporter: Option<(Arc<dyn ErrorReporter>, ReportPolicy)>,
    tracer: Option<Tracer>,
}

impl StatusHandler {
    // ---
    /// Minimal handler: delay, respond, record. No log, report or span.
    pub fn new(metrics: MetricsContext, delay: Arc<dyn Delay>) -> Self {
        // ---
        Self {
            metrics,
            delay,
            request_log: None,
            reporter: None,
            tracer: None,
        }
    }

    pub fn with_request_log(mut self, log: RequestLog) -> Self {
        // ---
        self.request_log = Some(log);
        self
    }

    pub fn with_reporter(
        mut self,
        reporter: Arc<dyn ErrorReporter>,
        policy: ReportPolicy,
    ) -> Self {
        // ---
        self.reporter = Some((reporter, policy));
        self
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        // ---
        self.tracer = Some(tracer);
        self
    }

    pub fn metrics(&self) -> &MetricsContext {
        // ---
        &self.metrics
    }

    /// Routes a request; only `GET /` is served.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        // ---
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/") => self.serve_status(RequestContext::capture(&req)).await,
            _ => {
                let mut resp = Response::new(Body::from("not found"));
                *resp.status_mut() = StatusCode::NOT_FOUND;
                resp
            }
        }
    }

    async fn serve_status(&self, ctx: RequestContext) -> Response<Body> {
        // ---
        let span = self
            .tracer
            .as_ref()
            .map(|t| t.start_span(STATUS_OPERATION, &Span::current()));

        let pause = self.delay.next_delay();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        // Created after the pause: a request dropped mid-sleep records nothing.
        let completion = self.metrics.record_completion(ctx.started);

        let response = status_response();
        let elapsed_secs = completion.finish();

        if let Some(span) = span {
            span.finish();
        }

        let summary = RequestSummary {
            method: &ctx.method,
            uri: &ctx.uri,
            elapsed_secs,
        };
        if let Some(log) = &self.request_log {
            log.emit(&summary, response.status());
        }
        if let Some((reporter, policy)) = &self.reporter {
            if policy.should_report(response.status()) {
                reporter.capture_message(&summary.to_string());
            }
        }

        response
    }
}

fn status_response() -> Response<Body> {
    // ---
    let (status, body) = match serde_json::to_vec(&StatusBody { status: "ok" }) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to serialize status body: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, b"{}".to_vec())
        }
    };

    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    resp
}
