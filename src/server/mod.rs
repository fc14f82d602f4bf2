//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.
//!
//! [`Server::serve`] puts a [`CacheManager`] behind the listener: every request
//! goes through [`CacheManager::handle`], except `POST` to [`CONTROL_PATH`],
//! which carries a JSON control message.
//!
//! [`Server::serve_until`] stops gracefully: once its signal resolves, the
//! listener is closed, idle connections are dropped, and requests already in
//! flight are answered with `Connection: close` before it returns.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::control::{ChannelError, ControlCommand, ControlHandle, ControlRequest};
use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::manager::CacheManager;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Path of the control endpoint.
pub const CONTROL_PATH: &str = "/__rescache/control";

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The rescache HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use rescache::{CacheConfig, CacheManager};
/// use rescache::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = Arc::new(CacheManager::with_http(CacheConfig::default())?);
///     manager.start().await?;
///     let control = manager.spawn_control_loop();
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.serve(manager, control).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `manager`, with control messages forwarded to `control`, until
    /// the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(
        self,
        manager: Arc<CacheManager>,
        control: ControlHandle,
    ) -> Result<(), ServerError> {
        self.serve_until(manager, control, std::future::pending())
            .await
    }

    /// Serves `manager` until `signal` resolves, then drains open connections.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve_until<S>(
        self,
        manager: Arc<CacheManager>,
        control: ControlHandle,
        signal: S,
    ) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        self.run_until(
            move |request| {
                let manager = Arc::clone(&manager);
                let control = control.clone();
                async move { respond(&manager, &control, request).await }
            },
            signal,
        )
        .await
    }

    /// Accepts connections and dispatches requests to `handler` until
    /// `signal` resolves.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// After the signal, no new connection is accepted. Connections waiting
    /// for their next request are closed; a request already being handled is
    /// answered with `Connection: close`. Returns once every connection task
    /// has finished.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<H, F, S>(self, handler: H, signal: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let handler = Arc::new(handler);
        let connections = TaskTracker::new();
        let stop = CancellationToken::new();
        info!(address = %self.local_addr, "rescache listening");

        tokio::pin!(signal);
        loop {
            let accepted = tokio::select! {
                () = &mut signal => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let stop = stop.clone();

            connections.spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, stop).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        drop(self.listener);
        info!(open = connections.len(), "stopped accepting, draining connections");
        stop.cancel();
        connections.close();
        connections.wait().await;
        Ok(())
    }
}

/// Answers one request on behalf of `manager`.
///
/// Strategy failures become gateway errors: `504` when the network and every
/// fallback were exhausted, `502` for anything else.
pub async fn respond(manager: &CacheManager, control: &ControlHandle, request: Request) -> Response {
    if request.path() == CONTROL_PATH {
        return control_endpoint(control, &request).await;
    }

    match manager.handle(request).await {
        Ok(response) => response,
        Err(e) if e.is_network() => {
            warn!(error = %e, "no response available");
            Response::new(StatusCode::GATEWAY_TIMEOUT).body(e.to_string())
        }
        Err(e) => {
            error!(error = %e, "request failed");
            Response::new(StatusCode::BAD_GATEWAY).body(e.to_string())
        }
    }
}

async fn control_endpoint(control: &ControlHandle, request: &Request) -> Response {
    if *request.method() != Method::Post {
        return Response::new(StatusCode::METHOD_NOT_ALLOWED).header("Allow", "POST");
    }

    let message: ControlRequest = match serde_json::from_slice(request.body()) {
        Ok(message) => message,
        Err(e) => {
            return Response::new(StatusCode::BAD_REQUEST)
                .body(format!("invalid control message: {e}"));
        }
    };

    match control.send(ControlCommand::from(message)).await {
        Ok(Some(reply)) => match serde_json::to_vec(&reply) {
            Ok(json) => Response::new(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body_bytes(json),
            Err(e) => Response::new(StatusCode::INTERNAL_SERVER_ERROR).body(e.to_string()),
        },
        Ok(None) => Response::new(StatusCode::ACCEPTED),
        Err(e @ ChannelError::NoController) => {
            Response::new(StatusCode::SERVICE_UNAVAILABLE).body(e.to_string())
        }
        Err(e) => Response::new(StatusCode::INTERNAL_SERVER_ERROR).body(e.to_string()),
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or `stop` is cancelled.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    stop: CancellationToken,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // A half-read request is finished even while stopping.
        let bytes_read = tokio::select! {
            read = stream.read_buf(&mut buf) => read?,
            () = stop.cancelled(), if buf.is_empty() => {
                debug!(peer = %peer_addr, "server stopping, closing idle connection");
                break;
            }
        };

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        // Pipelined bytes after this request belong to the next one.
        let consumed = buf.split_to(total_needed).freeze();
        let request = request.body_bytes(consumed.slice(body_offset..));
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            url = %request.url(),
            "dispatching request"
        );

        let response = handler(request).await;
        let keep_alive = keep_alive && !stop.is_cancelled();
        let response = response.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}
