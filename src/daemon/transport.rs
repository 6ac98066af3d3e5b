//! Listeners: a unix domain socket by default, loopback HTTP as the fallback.
//!
//! Both carry the same envelopes. On the socket, envelopes are framed by
//! [`FrameDecoder`] and answered in arrival order; over HTTP each `POST /rpc`
//! body is one envelope.

use anyhow::{anyhow, bail, Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::connection::ConnectionGuard;
use super::Services;
use crate::config::{ServerConfig, TransportPreference};
use crate::error::RpcError;
use crate::protocol::{encode, FrameDecoder, FrameError, Response};

/// Consecutive accept failures tolerated before the listener is declared dead.
const MAX_ACCEPT_ERRORS: u32 = 64;
const READ_BUFFER_BYTES: usize = 8 * 1024;

/// Where a daemon can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Socket(PathBuf),
    Http(SocketAddr),
}

impl std::fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(path) => write!(f, "unix:{}", path.display()),
            Self::Http(addr) => write!(f, "http://{addr}"),
        }
    }
}

impl std::str::FromStr for BoundAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Socket(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("http://") {
            let addr = addr.trim_end_matches('/');
            return addr
                .parse()
                .map(Self::Http)
                .with_context(|| format!("invalid http address: {addr}"));
        }
        bail!("unrecognized daemon address: {s}")
    }
}

pub enum Listener {
    #[cfg(unix)]
    Socket(tokio::net::UnixListener),
    Http(TcpListener),
}

/// Bind the configured transport. `Auto` tries the socket first.
pub async fn bind(config: &ServerConfig, dir: &Path) -> Result<(Listener, BoundAddress)> {
    match config.transport {
        TransportPreference::Socket => bind_socket(&dir.join(&config.socket_name)),
        TransportPreference::Http => bind_http(config.http_port).await,
        TransportPreference::Auto => match bind_socket(&dir.join(&config.socket_name)) {
            Ok(bound) => Ok(bound),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "unix socket unavailable, falling back to http");
                bind_http(config.http_port)
                    .await
                    .context("neither unix socket nor http transport could be bound")
            }
        },
    }
}

#[cfg(unix)]
fn bind_socket(path: &Path) -> Result<(Listener, BoundAddress)> {
    use std::os::unix::fs::PermissionsExt;

    // Callers have already established that no live daemon owns this path.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove leftover socket {}", path.display()))?;
    }
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("failed to restrict socket permissions")?;

    tracing::info!(path = %path.display(), "listening on unix socket");
    Ok((Listener::Socket(listener), BoundAddress::Socket(path.to_path_buf())))
}

#[cfg(not(unix))]
fn bind_socket(_path: &Path) -> Result<(Listener, BoundAddress)> {
    bail!("unix sockets are not supported on this platform")
}

async fn bind_http(port: u16) -> Result<(Listener, BoundAddress)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{port}"))?;
    let addr = listener.local_addr().context("failed to read bound address")?;
    tracing::info!(addr = %addr, "listening on http");
    Ok((Listener::Http(listener), BoundAddress::Http(addr)))
}

/// Resolves once `shutdown` flips to `true` (or its sender is gone).
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve `listener` until `shutdown` fires. An `Err` means the listener died.
pub async fn serve(
    listener: Listener,
    services: Arc<Services>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match listener {
        #[cfg(unix)]
        Listener::Socket(listener) => serve_socket(listener, services, shutdown).await,
        Listener::Http(listener) => serve_http(listener, services, shutdown).await,
    }
}

#[cfg(unix)]
async fn serve_socket(
    listener: tokio::net::UnixListener,
    services: Arc<Services>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let conn_shutdown = shutdown.clone();
    let mut consecutive_errors = 0u32;
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    consecutive_errors = 0;
                    admit(stream, "unix", &services, &conn_shutdown);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, consecutive_errors, "accept failed");
                    if consecutive_errors >= MAX_ACCEPT_ERRORS {
                        return Err(anyhow!("unix listener failed {consecutive_errors} times in a row: {e}"));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    tracing::info!("unix listener closed");
    Ok(())
}

/// Hand a new stream its own task, or turn it away at the ceiling.
fn admit<S>(stream: S, peer: &str, services: &Arc<Services>, shutdown: &watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(guard) = services.connections.try_admit(peer) else {
        let limit = services.connections.max();
        tracing::warn!(limit, "connection limit reached, rejecting");
        tokio::spawn(reject(stream, limit));
        return;
    };

    let id = guard.id();
    let task = tokio::spawn(serve_connection(
        stream,
        guard,
        Arc::clone(services),
        shutdown.clone(),
    ));
    services.connections.attach(id, task.abort_handle());
}

async fn reject<S>(mut stream: S, limit: usize)
where
    S: AsyncWrite + Unpin,
{
    let response = Response::failure(Value::Null, &RpcError::CapacityExceeded { limit });
    if let Ok(bytes) = encode(&response) {
        let _ = stream.write_all(&bytes).await;
    }
    let _ = stream.shutdown().await;
}

/// Serve one connection: decode frames, dispatch them in order, write replies.
pub async fn serve_connection<S>(
    stream: S,
    guard: ConnectionGuard,
    services: Arc<Services>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = guard.id();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new(services.max_frame_bytes());
    let mut buf = vec![0u8; READ_BUFFER_BYTES];

    'conn: loop {
        loop {
            let response = match decoder.next_frame() {
                Ok(Some(value)) => services.handle(value).await,
                Ok(None) => break,
                Err(err @ FrameError::TooLarge { .. }) => {
                    tracing::warn!(id, error = %err, "oversized frame, closing connection");
                    let _ = write_response(&mut writer, &Response::failure(Value::Null, &err.into())).await;
                    break 'conn;
                }
                Err(err) => {
                    tracing::debug!(id, error = %err, "malformed frame");
                    Response::failure(Value::Null, &err.into())
                }
            };
            if let Err(e) = write_response(&mut writer, &response).await {
                tracing::debug!(id, error = %e, "client went away mid-response");
                break 'conn;
            }
        }

        let read = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                tracing::debug!(id, error = %e, "read failed");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    drop(guard);
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(response)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub fn router(services: Arc<Services>) -> Router {
    let body_limit = services.max_frame_bytes();
    Router::new()
        .route("/rpc", post(rpc))
        .route("/", post(rpc))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(services)
}

async fn serve_http(
    listener: TcpListener,
    services: Arc<Services>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(listener, router(services))
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await
        .context("http listener failed")?;
    tracing::info!("http listener closed");
    Ok(())
}

async fn rpc(State(services): State<Arc<Services>>, body: Bytes) -> HttpResponse {
    let Some(_guard) = services.connections.try_admit("http") else {
        let limit = services.connections.max();
        let response = Response::failure(Value::Null, &RpcError::CapacityExceeded { limit });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response();
    };

    let response = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => services.handle(value).await,
        Err(e) => Response::failure(Value::Null, &RpcError::Parse(e.to_string())),
    };
    Json(response).into_response()
}

async fn health(State(services): State<Arc<Services>>) -> HttpResponse {
    match services.status() {
        Ok(report) => Json(report).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Response::failure(Value::Null, &err)),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_round_trip_through_strings() {
        let socket = BoundAddress::Socket(PathBuf::from("/tmp/memoryd.sock"));
        assert_eq!(socket.to_string(), "unix:/tmp/memoryd.sock");
        assert_eq!("unix:/tmp/memoryd.sock".parse::<BoundAddress>().unwrap(), socket);

        let http: BoundAddress = "http://127.0.0.1:3737".parse().unwrap();
        assert_eq!(http, BoundAddress::Http("127.0.0.1:3737".parse().unwrap()));
        assert_eq!(http.to_string(), "http://127.0.0.1:3737");

        assert!("ftp://nowhere".parse::<BoundAddress>().is_err());
    }
}
