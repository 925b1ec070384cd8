//! Error-tracking collaborator.
//!
//! Events are queued without blocking the caller on a bounded queue (events
//! arriving while it is full are dropped and counted) and drained by a background
//! task that forwards them to the `error_tracking` log target, tagged with the
//! project identified by the DSN. `flush` gives shutdown a bounded wait.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

/// Destination project for error events.
///
/// Format: `<scheme>://<public_key>@<host>[:port]/<project_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    // ---
    pub scheme: String,
    pub public_key: String,
    pub host: String,
    pub port: Option<u16>,
    pub project_id: u64,
}

impl FromStr for Dsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let (scheme, rest) = s.split_once("://").context("DSN is missing a scheme")?;
        if scheme != "http" && scheme != "https" {
            bail!("unsupported DSN scheme: {scheme}");
        }

        let (public_key, rest) = rest.split_once('@').context("DSN is missing a public key")?;
        if public_key.is_empty() {
            bail!("DSN public key is empty");
        }

        let (authority, project) = rest.rsplit_once('/').context("DSN is missing a project id")?;
        let project_id = project
            .parse::<u64>()
            .with_context(|| format!("invalid DSN project id: {project:?}"))?;

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid DSN port: {port:?}"))?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() {
            bail!("DSN host is empty");
        }

        Ok(Self {
            scheme: scheme.to_string(),
            public_key: public_key.to_string(),
            host: host.to_string(),
            port,
            project_id,
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Public key stays out of logs.
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "/{}", self.project_id)
    }
}

/// Sink for free-form error messages.
pub trait ErrorReporter: Send + Sync {
    /// Queues `message` for delivery. Never blocks the caller.
    fn capture_message(&self, message: &str);
}

/// Events the delivery queue holds before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct Event {
    id: u64,
    message: String,
}

/// Counters shared by the reporter and its delivery task.
#[derive(Default)]
struct QueueState {
    pending: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    drained: Notify,
}

impl QueueState {
    // ---
    /// Marks one pending event as settled (delivered or dropped).
    fn settle(&self) {
        // ---
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Buffered error reporter backed by a bounded queue and a tokio task.
pub struct EventReporter {
    // ---
    dsn: Dsn,
    tx: mpsc::Sender<Event>,
    next_id: AtomicU64,
    state: Arc<QueueState>,
}

/// Delivery side of an [`EventReporter`] queue.
pub struct EventWorker {
    // ---
    rx: mpsc::Receiver<Event>,
    host: String,
    project_id: u64,
    state: Arc<QueueState>,
}

impl EventReporter {
    // ---
    /// Starts the delivery task for `dsn` with the default queue capacity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(dsn: Dsn) -> Self {
        // ---
        Self::start_with_capacity(dsn, DEFAULT_QUEUE_CAPACITY)
    }

    /// Starts the delivery task for `dsn`; at most `capacity` events wait in
    /// the queue.
    pub fn start_with_capacity(dsn: Dsn, capacity: usize) -> Self {
        // ---
        let (reporter, worker) = Self::channel(dsn, capacity);
        tokio::spawn(worker.run());
        reporter
    }

    /// Builds a reporter and the worker that drains it, without spawning.
    pub fn channel(dsn: Dsn, capacity: usize) -> (Self, EventWorker) {
        // ---
        let (tx, rx) = mpsc::channel::<Event>(capacity.max(1));
        let state = Arc::new(QueueState::default());

        let worker = EventWorker {
            rx,
            host: dsn.host.clone(),
            project_id: dsn.project_id,
            state: Arc::clone(&state),
        };

        info!(
            "Error tracking enabled for {} (queue capacity {})",
            dsn,
            capacity.max(1)
        );

        let reporter = Self {
            dsn,
            tx,
            next_id: AtomicU64::new(1),
            state,
        };
        (reporter, worker)
    }

    pub fn dsn(&self) -> &Dsn {
        // ---
        &self.dsn
    }

    /// Events handed to the delivery task so far.
    pub fn delivered(&self) -> u64 {
        // ---
        self.state.delivered.load(Ordering::SeqCst)
    }

    /// Events discarded because the queue was full or the task was gone.
    pub fn dropped(&self) -> u64 {
        // ---
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// Waits until every queued event is delivered, up to `timeout`.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        // ---
        let drained = async {
            loop {
                let notified = self.state.drained.notified();
                if self.state.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl ErrorReporter for EventReporter {
    fn capture_message(&self, message: &str) {
        // ---
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.pending.fetch_add(1, Ordering::SeqCst);

        let event = Event {
            id,
            message: message.to_string(),
        };
        let reason = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => "queue is full",
            Err(mpsc::error::TrySendError::Closed(_)) => "delivery task is gone",
        };

        self.state.dropped.fetch_add(1, Ordering::SeqCst);
        self.state.settle();
        warn!("Error tracking {}; dropped event {}", reason, id);
    }
}

impl EventWorker {
    // ---
    /// Delivers events until every reporter handle is dropped.
    pub async fn run(mut self) {
        // ---
        while let Some(event) = self.rx.recv().await {
            error!(
                target: "error_tracking",
                host = %self.host,
                project = self.project_id,
                event_id = event.id,
                "{}",
                event.message
            );
            self.state.delivered.fetch_add(1, Ordering::SeqCst);
            self.state.settle();
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Instant;

    const DSN: &str = "https://0123abcd@o1.ingest.example.io/6039999";

    #[test]
    fn test_parse_dsn() {
        // ---
        let dsn: Dsn = DSN.parse().expect("valid DSN");
        assert_eq!(dsn.scheme, "https");
        assert_eq!(dsn.public_key, "0123abcd");
        assert_eq!(dsn.host, "o1.ingest.example.io");
        assert_eq!(dsn.port, None);
        assert_eq!(dsn.project_id, 6039999);
    }

    #[test]
    fn test_parse_dsn_with_port() {
        // ---
        let dsn: Dsn = "http://key@localhost:9000/42".parse().expect("valid DSN");
        assert_eq!(dsn.host, "localhost");
        assert_eq!(dsn.port, Some(9000));
        assert_eq!(dsn.project_id, 42);
    }

    #[test]
    fn test_reject_invalid_dsn() {
        // ---
        for bad in [
            "",
            "o1.ingest.example.io/1",
            "ftp://key@host/1",
            "https://host/1",
            "https://@host/1",
            "https://key@host",
            "https://key@host/abc",
            "https://key@:80/1",
            "https://key@host:port/1",
        ] {
            assert!(bad.parse::<Dsn>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_display_hides_public_key() {
        // ---
        let dsn: Dsn = DSN.parse().expect("valid DSN");
        let shown = dsn.to_string();
        assert!(!shown.contains("0123abcd"));
        assert_eq!(shown, "https://o1.ingest.example.io/6039999");
    }

    #[tokio::test]
    async fn test_flush_delivers_queued_events() {
        // ---
        let reporter = EventReporter::start(DSN.parse().expect("valid DSN"));
        for i in 0..3 {
            reporter.capture_message(&format!("event {i}"));
        }

        assert!(reporter.flush(Duration::from_secs(2)).await);
        assert_eq!(reporter.delivered(), 3);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_queued() {
        // ---
        let reporter = EventReporter::start(DSN.parse().expect("valid DSN"));
        assert!(reporter.flush(Duration::from_millis(10)).await);
        assert_eq!(reporter.delivered(), 0);
    }

    #[tokio::test]
    async fn test_flush_times_out_while_events_pending() {
        // ---
        let (reporter, worker) = EventReporter::channel(DSN.parse().expect("valid DSN"), 8);
        reporter.capture_message("stuck");

        let wait = Duration::from_millis(50);
        let started = Instant::now();
        assert!(!reporter.flush(wait).await);
        assert!(started.elapsed() >= wait);
        assert_eq!(reporter.delivered(), 0);

        tokio::spawn(worker.run());
        assert!(reporter.flush(Duration::from_secs(2)).await);
        assert_eq!(reporter.delivered(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_events() {
        // ---
        let (reporter, worker) = EventReporter::channel(DSN.parse().expect("valid DSN"), 2);
        for i in 0..5 {
            reporter.capture_message(&format!("event {i}"));
        }
        assert_eq!(reporter.dropped(), 3);

        tokio::spawn(worker.run());
        assert!(reporter.flush(Duration::from_secs(2)).await);
        assert_eq!(reporter.delivered(), 2);
        assert_eq!(reporter.dropped(), 3);
    }

    #[tokio::test]
    async fn test_events_after_worker_exit_are_dropped() {
        // ---
        let (reporter, worker) = EventReporter::channel(DSN.parse().expect("valid DSN"), 2);
        drop(worker);

        reporter.capture_message("late");
        assert_eq!(reporter.dropped(), 1);
        assert!(reporter.flush(Duration::from_millis(10)).await);
    }
}
