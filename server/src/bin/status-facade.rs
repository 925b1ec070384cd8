//! Status facade - CLI binary.
//!
//! Serves the instrumented `GET /` endpoint and a Prometheus scrape endpoint
//! on two independent listeners sharing one metrics registry.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

use status_facade::{spawn_status_server, RandomDelay, ReportPolicy, RequestLog, StatusHandler};
use status_facade_common::{
    init_tracing, ColorWhen, ErrorReporter, EventReporter, LogFormat, MetricsContext,
    MetricsServerConfig, Tracer, TracerConfig,
};

/// Bound on waiting for queued error events at shutdown.
const REPORTER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(v: LogFormatArg) -> Self {
        match v {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ReportPolicyArg {
    EveryRequest,
    FailuresOnly,
}

impl From<ReportPolicyArg> for ReportPolicy {
    fn from(v: ReportPolicyArg) -> Self {
        match v {
            ReportPolicyArg::EveryRequest => ReportPolicy::EveryRequest,
            ReportPolicyArg::FailuresOnly => ReportPolicy::FailuresOnly,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
}

impl From<LogLevelArg> for Level {
    fn from(v: LogLevelArg) -> Self {
        match v {
            LogLevelArg::Error => Level::ERROR,
            LogLevelArg::Warn => Level::WARN,
            LogLevelArg::Info => Level::INFO,
        }
    }
}

/// Which collaborators the handler is wired with.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Profile {
    /// Metrics only; pauses up to 9 s.
    Minimal,

    /// Metrics, request log, error reports and spans; never pauses.
    Full,
}

impl Profile {
    // ---
    fn default_max_delay_secs(self) -> u64 {
        // ---
        match self {
            Profile::Minimal => 10,
            Profile::Full => 1,
        }
    }
}

/// Status Facade - instrumented status endpoint with Prometheus metrics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Application bind address (serves `GET /`).
    #[arg(long, default_value = "0.0.0.0:83")]
    bind: SocketAddr,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "0.0.0.0:84")]
    metrics_bind: SocketAddr,

    /// Instrumentation profile
    #[arg(long, value_enum, default_value = "minimal")]
    profile: Profile,

    /// Exclusive upper bound of the simulated delay, in whole seconds.
    ///
    /// Defaults to 10 for the minimal profile and 1 for the full profile.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_delay_secs: Option<u64>,

    /// Error-tracking DSN; error reports are disabled without one.
    #[arg(long, env = "ERROR_TRACKING_DSN")]
    dsn: Option<String>,

    /// Which requests are sent to error tracking
    #[arg(long, value_enum, default_value = "every-request")]
    report_policy: ReportPolicyArg,

    /// `app` field on request log lines
    #[arg(long, default_value = "Logger")]
    app_name: String,

    /// `environment` field on request log lines
    #[arg(long, default_value = "production")]
    environment: String,

    /// Level of request log lines for served requests
    #[arg(long, value_enum, default_value = "info")]
    request_log_level: LogLevelArg,

    /// Service name attached to spans
    #[arg(long, default_value = "status-facade")]
    trace_service: String,

    /// OTLP/gRPC collector address spans are exported to
    #[arg(long, default_value = "127.0.0.1:4317")]
    trace_agent: SocketAddr,

    /// Constant sampler rate in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    trace_sample_rate: f64,

    /// Log line format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormatArg,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    // The span exporter layer has to be part of the subscriber from the start.
    let tracer = match args.profile {
        Profile::Full => Some(
            Tracer::new(TracerConfig {
                service_name: args.trace_service.clone(),
                sample_rate: args.trace_sample_rate,
                agent_addr: args.trace_agent,
            })
            .context("failed to initialize tracer")?,
        ),
        Profile::Minimal => None,
    };
    init_tracing(args.color.into(), args.log_format.into(), tracer.as_ref())?;

    let outcome = run(args, tracer.clone()).await;

    if let Some(tracer) = &tracer {
        tracer.flush().await;
    }
    if let Err(e) = outcome {
        error!("Fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args, tracer: Option<Tracer>) -> Result<()> {
    // ---
    let max_delay_secs = args
        .max_delay_secs
        .unwrap_or_else(|| args.profile.default_max_delay_secs());

    info!("Starting status facade v{VERSION}");
    info!("Profile: {:?}", args.profile);
    info!("Application bind: {}", args.bind);
    info!("Metrics bind: {}", args.metrics_bind);
    info!("Delay upper bound: {}s", max_delay_secs);

    let metrics = MetricsContext::new()?;
    let delay = RandomDelay::new(max_delay_secs).context("invalid delay bound")?;
    let mut handler = StatusHandler::new(metrics.clone(), Arc::new(delay));

    let mut reporter: Option<Arc<EventReporter>> = None;
    if args.profile == Profile::Full {
        handler = handler.with_request_log(
            RequestLog::new(&args.app_name, &args.environment)
                .with_level(args.request_log_level.into()),
        );

        match &args.dsn {
            Some(dsn) => {
                let dsn = dsn.parse().context("invalid error-tracking DSN")?;
                let started = Arc::new(EventReporter::start(dsn));
                let sink: Arc<dyn ErrorReporter> = started.clone();
                handler = handler.with_reporter(sink, args.report_policy.into());
                reporter = Some(started);
            }
            None => warn!("No DSN configured; error tracking disabled"),
        }
    }
    if let Some(tracer) = tracer {
        let config = tracer.config();
        info!(
            "Exporting spans for service {} to {} (sample rate {})",
            config.service_name, config.agent_addr, config.sample_rate
        );
        handler = handler.with_tracer(tracer);
    }

    let mut metrics_server = metrics
        .spawn_metrics_server(MetricsServerConfig::new(args.metrics_bind))
        .context("failed to start metrics listener")?;
    let mut status_server = spawn_status_server(Arc::new(handler), args.bind)
        .context("failed to start application listener")?;

    info!("Ready to serve requests...");

    let status_name = status_server.name();
    let metrics_name = metrics_server.name();
    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            None
        }
        res = status_server.stopped() => Some((status_name, res)),
        res = metrics_server.stopped() => Some((metrics_name, res)),
    };

    let outcome = match early_exit {
        None => {
            let status_stopped = status_server.shutdown().await;
            let metrics_stopped = metrics_server.shutdown().await;
            status_stopped.and(metrics_stopped)
        }
        Some((name, Ok(()))) => Err(anyhow!("{name} listener exited unexpectedly")),
        Some((name, Err(e))) => Err(e.context(format!("{name} listener failed"))),
    };

    if let Some(reporter) = reporter {
        if !reporter.flush(REPORTER_FLUSH_TIMEOUT).await {
            warn!(
                "Error tracking flush timed out after {:?}",
                REPORTER_FLUSH_TIMEOUT
            );
        }
    }

    info!("Served {} requests", metrics.request_count());
    outcome
}
