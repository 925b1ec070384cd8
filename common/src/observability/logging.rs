//! Log subscriber initialization.
//!
//! Centralizes subscriber config so every binary logs the same way.

use crate::observability::Tracer;
use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line text.
    #[default]
    Text,

    /// One JSON object per line.
    Json,
}

/// Initialize the global tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`, defaulting to `info`.
/// - ANSI color controlled by `ColorWhen` (text output only).
/// - With a `tracer`, spans are also bridged into OpenTelemetry for export.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen, format: LogFormat, tracer: Option<&Tracer>) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer()
            .with_ansi(color.should_color_stderr())
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };
    let otel_layer = tracer.map(|t| t.layer());

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        // ---
        // Whichever call wins, only one subscriber can be installed per process.
        let _ = init_tracing(ColorWhen::Never, LogFormat::Text, None);
        assert!(init_tracing(ColorWhen::Never, LogFormat::Json, None).is_err());
    }
}
