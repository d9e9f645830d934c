//! HTTP listener
//!
//! Binds the socket, runs the accept loop on its own task, and drains
//! in-flight requests on shutdown within a hard deadline.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::ServerState;
use crate::error::ServerError;

/// In-flight bookkeeping shared with every request
#[derive(Clone)]
struct DrainState {
    in_flight: Arc<AtomicUsize>,
    /// Flipped when the drain deadline passes
    abandon: Arc<watch::Sender<bool>>,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Count the request and cut it short once the drain deadline passes
async fn track_in_flight(State(drain): State<DrainState>, request: Request, next: Next) -> Response {
    let _guard = InFlightGuard::new(&drain.in_flight);
    let mut abandon_rx = drain.abandon.subscribe();

    tokio::select! {
        response = next.run(request) => response,
        _ = async { let _ = abandon_rx.wait_for(|abandoned| *abandoned).await; } => {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// HTTP server handle
pub struct HttpServer {
    bind_addr: SocketAddr,
    router: Option<Router>,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    drain: DrainState,
    shutdown_tx: watch::Sender<bool>,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
}

impl HttpServer {
    pub fn new(bind_addr: SocketAddr, router: Router) -> Self {
        let (abandon_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind_addr,
            router: Some(router),
            state: ServerState::Created,
            local_addr: None,
            drain: DrainState {
                in_flight: Arc::new(AtomicUsize::new(0)),
                abandon: Arc::new(abandon_tx),
            },
            shutdown_tx,
            serve_task: None,
        }
    }

    /// Bind and start accepting on a background task
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.state != ServerState::Created {
            return Err(ServerError::InvalidState(self.state));
        }
        let router = self
            .router
            .take()
            .ok_or(ServerError::InvalidState(self.state))?;

        let bind_err = |source| ServerError::Bind {
            addr: self.bind_addr,
            source,
        };
        let std_listener = crate::util::create_tcp_listener(self.bind_addr).map_err(bind_err)?;
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let app = router.layer(middleware::from_fn_with_state(
            self.drain.clone(),
            track_in_flight,
        ));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        self.serve_task = Some(task);
        self.local_addr = Some(local_addr);
        self.state = ServerState::Listening;
        info!(addr = %local_addr, "HTTP listener started");
        Ok(local_addr)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Requests currently being handled
    pub fn in_flight(&self) -> usize {
        self.drain.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait up to `drain_timeout` for in-flight requests
    ///
    /// On timeout the remaining requests are cut short and the accept task
    /// is aborted; the server still ends up `Stopped`.
    pub async fn shutdown(&mut self, drain_timeout: Duration) -> Result<(), ServerError> {
        if self.state != ServerState::Listening {
            return Err(ServerError::InvalidState(self.state));
        }
        let Some(mut task) = self.serve_task.take() else {
            return Err(ServerError::InvalidState(self.state));
        };

        self.state = ServerState::ShuttingDown;
        info!(
            in_flight = self.in_flight(),
            timeout = ?drain_timeout,
            "Draining HTTP listener"
        );
        let _ = self.shutdown_tx.send(true);

        let result = match tokio::time::timeout(drain_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {
                info!("HTTP listener drained");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(ServerError::Serve(e)),
            Ok(Err(join_err)) => Err(ServerError::Serve(std::io::Error::other(join_err))),
            Err(_) => {
                let abandoned = self.in_flight();
                warn!(abandoned, "Drain timeout reached, abandoning in-flight requests");
                let _ = self.drain.abandon.send(true);
                task.abort();
                Err(ServerError::DrainTimeout {
                    timeout: drain_timeout,
                    abandoned,
                })
            }
        };

        self.state = ServerState::Stopped;
        result
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
    }
}
