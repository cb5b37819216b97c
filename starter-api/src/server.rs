use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tower::Service;

use crate::config::ServiceConfig;

/// Pause after an accept error that isn't tied to a single connection (EMFILE and the
/// like), so the loop doesn't spin while the condition lasts.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listen tcp {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Bind the configured address and serve `app` until `shutdown` resolves.
pub async fn serve<F>(config: ServiceConfig, app: Router, shutdown: F) -> Result<(), ListenerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { addr, source })?;

    serve_listener(listener, app, config, shutdown).await
}

/// Accept loop over an already bound listener.
///
/// Once `shutdown` resolves the listener socket is closed and in-flight connections
/// are asked to finish; this returns when the last one has. Connections live in a
/// `JoinSet` owned by this future, so dropping or aborting it closes them all.
pub async fn serve_listener<F>(
    listener: TcpListener,
    app: Router,
    config: ServiceConfig,
    shutdown: F,
) -> Result<(), ListenerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("listening on {}", addr);
    }

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.read_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(config.idle_timeout)
        .keep_alive_timeout(config.idle_timeout);

    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, remote_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("failed to accept connection: {}", e);
                        if let Some(delay) = accept_backoff(&e) {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                };

                if let Err(e) = socket.set_nodelay(true) {
                    tracing::warn!("failed to set TCP_NODELAY: {}", e);
                }

                let app = app.clone();
                let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let mut app = app.clone();
                    let mut req = req.map(axum::body::Body::new);
                    req.extensions_mut().insert(ConnectInfo(remote_addr));
                    async move { app.call(req).await }
                });

                let conn = builder.serve_connection_with_upgrades(TokioIo::new(socket), service);
                let conn = graceful.watch(conn.into_owned());

                connections.spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!("connection closed: {}", e);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drop(listener);
    graceful.shutdown().await;
    while connections.join_next().await.is_some() {}

    tracing::info!("HTTP server graceful shutdown completed");
    Ok(())
}

/// Errors about one peer going away need no pause; anything else hits every accept.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}
