//! C10: the HTTP listener itself — the accept loop, connection handling,
//! and graceful shutdown. Grounded on a hyper-1/hyper-util accept loop
//! (the teacher's own `main.rs` predates hyper 1 and can't be adapted
//! directly); everything upstream of a connection (routing, dispatch,
//! metrics) lives in `router`/`middleware`/`metrics`.

pub mod metrics;
pub mod middleware;
pub mod router;
mod timeout_io;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::Registry;
use hyper_util::rt::TokioIo;
use metrics::Metrics;
use middleware::RateLimiterMiddleware;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use timeout_io::TimeoutIo;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Everything a connection handler needs, shared across the listener's
/// whole lifetime.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: Arc<RateLimiterMiddleware>,
}

/// Accepts connections until `shutdown` fires, then gives in-flight
/// connections up to `config.shutdown_grace` to finish on their own
/// before returning (spec §5: "stop accepting; allow in-flight requests
/// to complete; tear down watchers; flush logs").
pub async fn serve(listener: TcpListener, state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let inflight = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        log::error!("accept error: {e}");
                        continue;
                    }
                };
                let timeouts = state.config.listener_timeouts.clone();
                let io = TokioIo::new(TimeoutIo::new(stream, timeouts.read, timeouts.write, timeouts.idle));
                let state = state.clone();
                let inflight = inflight.clone();
                let mut conn_shutdown = shutdown.clone();
                inflight.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req| {
                        let state = state.clone();
                        async move { router::handle(req, state, remote_addr).await }
                    });
                    let mut builder = hyper::server::conn::http1::Builder::new();
                    builder.header_read_timeout(timeouts.read_header);
                    let conn = builder.serve_connection(io, service);
                    tokio::pin!(conn);

                    tokio::select! {
                        result = &mut conn => {
                            if let Err(e) = result {
                                log::debug!("connection from {remote_addr} ended with an error: {e}");
                            }
                        }
                        _ = conn_shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            if let Err(e) = conn.await {
                                log::debug!("connection from {remote_addr} ended with an error during shutdown: {e}");
                            }
                        }
                    }
                    inflight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }

    log::info!("no longer accepting connections; waiting up to {:?} for in-flight requests to finish", state.config.shutdown_grace);
    let deadline = tokio::time::Instant::now() + state.config.shutdown_grace;
    while inflight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    if inflight.load(Ordering::SeqCst) > 0 {
        log::warn!("shutdown grace period elapsed with {} request(s) still in flight", inflight.load(Ordering::SeqCst));
    }
}
