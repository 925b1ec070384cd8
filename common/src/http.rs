//! Minimal hyper listener shared by the application and metrics endpoints.
//!
//! Each listener is an independent tokio task. Callers get a [`ServerHandle`]
//! back and decide when to stop it; nothing is coordinated between listeners.

use anyhow::{anyhow, Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

/// Handle to a running listener task.
pub struct ServerHandle {
    // ---
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    // ---
    /// Address the listener is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        // ---
        self.local_addr
    }

    pub fn name(&self) -> &'static str {
        // ---
        self.name
    }

    /// Resolves when the listener task exits on its own.
    ///
    /// Must not be awaited again after it resolved, and the handle should not
    /// be shut down afterwards.
    pub async fn stopped(&mut self) -> Result<()> {
        // ---
        (&mut self.task)
            .await
            .with_context(|| format!("{} listener task panicked", self.name))?
    }

    /// Signals graceful shutdown and waits for in-flight connections to end.
    pub async fn shutdown(mut self) -> Result<()> {
        // ---
        if let Some(tx) = self.shutdown.take() {
            // Receiver is gone only if the task already exited.
            let _ = tx.send(());
        }
        info!("Stopping {} listener on {}", self.name, self.local_addr);
        self.task
            .await
            .with_context(|| format!("{} listener task panicked", self.name))?
    }
}

/// Binds `bind` and serves every request with `handler` on a spawned task.
///
/// Every request runs inside a `request` span tagged with the listener name,
/// method and URI. Binding happens before this returns, so bind failures are
/// reported synchronously.
///
/// # Errors
///
/// Returns error if the address cannot be bound.
pub fn spawn_http_server<F, Fut>(
    name: &'static str,
    bind: SocketAddr,
    handler: F,
) -> Result<ServerHandle>
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    // ---
    let make_svc = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let span = info_span!(
                    "request",
                    listener = name,
                    method = %req.method(),
                    uri = %req.uri()
                );
                let response = handler(req);
                async move { Ok::<_, Infallible>(response.await) }.instrument(span)
            }))
        }
    });

    let builder = Server::try_bind(&bind)
        .with_context(|| format!("failed to bind {} listener to {}", name, bind))?;
    let server = builder.serve(make_svc);
    let local_addr = server.local_addr();

    let (tx, rx) = oneshot::channel::<()>();
    let graceful = server.with_graceful_shutdown(async {
        let _ = rx.await;
    });

    info!("{} listener bound to {}", name, local_addr);

    let task = tokio::spawn(async move {
        // ---
        graceful.await.map_err(|e| anyhow!(e))?;
        Ok(())
    });

    Ok(ServerHandle {
        name,
        local_addr,
        shutdown: Some(tx),
        task,
    })
}
