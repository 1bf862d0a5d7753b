//! WebSocket server: accept loop and per-connection task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections.
//! 3. Upgrading each connection to a WebSocket session, routing it to an
//!    endpoint by request path and capturing the offered sub-protocols.
//! 4. Handing the offered values to the [`HandshakeAuthenticator`] and then
//!    the [`ConnectionHandler`], before any frame reaches application logic.
//! 5. Running two concurrent halves per connection:
//!    - **Writer**: drains the connection's outbound queue onto the socket.
//!    - **Reader**: feeds inbound frames to the handler.
//! 6. Gracefully shutting down when the `running` flag is cleared.
//!
//! # Why the upgrade always completes
//!
//! A close code can only be delivered over an open WebSocket.  The upgrade
//! response therefore echoes the first offered sub-protocol (clients abort
//! the upgrade if they offered values and none comes back) and the
//! authentication decision is made right after.  A rejected connection gets
//! its close frame, is given `close_timeout_ms` to reply, and is dropped
//! without ever being registered.
//!
//! Unknown request paths are the exception: they are refused with HTTP 404
//! during the upgrade itself.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::application::{
    offered_subprotocols, AuthPolicy, ConnectionHandler, ConnectionRegistry,
    HandshakeAuthenticator, LatencyHandler,
};
use crate::domain::{EndpointConfig, OutboundMessage, ServerConfig};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct ServerDeps {
    pub authenticator: Arc<HandshakeAuthenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub latency: Arc<dyn LatencyHandler>,
}

/// What the upgrade callback learned from the HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UpgradeRequest {
    endpoint: Arc<EndpointConfig>,
    offered: Vec<String>,
    forwarded_for: Option<IpAddr>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// A bound, not yet running, WebSocket server.
///
/// Binding and running are separate steps so callers (tests in particular)
/// can bind to port 0 and read the assigned port before connecting.
pub struct WsServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    endpoints: Arc<Vec<Arc<EndpointConfig>>>,
    deps: ServerDeps,
}

impl WsServer {
    /// Binds the listener on `config.bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound (e.g., the port is
    /// already in use or the process lacks permission to bind).
    pub async fn bind(config: ServerConfig, deps: ServerDeps) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {}", config.bind_addr))?;

        let endpoints = config.endpoints.iter().cloned().map(Arc::new).collect();

        Ok(Self {
            listener,
            config: Arc::new(config),
            endpoints: Arc::new(endpoints),
            deps,
        })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.deps.registry)
    }

    /// Runs the accept loop until `running` is set to `false`.
    ///
    /// Each accepted connection is handed off to a dedicated Tokio task so
    /// that one slow client never blocks others.
    pub async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        let local = self.local_addr()?;
        info!("WebSocket gateway listening on {local}");
        for endpoint in self.endpoints.iter() {
            info!(
                "  endpoint {} (auth={:?}, mode={:?})",
                endpoint.path, endpoint.auth, endpoint.mode
            );
        }

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Short timeout so the loop notices the shutdown flag even when
            // nobody is connecting.
            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    debug!("new connection from {peer_addr}");
                    let config = Arc::clone(&self.config);
                    let endpoints = Arc::clone(&self.endpoints);
                    let deps = self.deps.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer_addr, config, endpoints, deps).await;
                    });
                }
                Ok(Err(e)) => {
                    error!("accept error: {e}");
                }
                Err(_) => {}
            }
        }

        Ok(())
    }
}

/// Binds and runs the gateway until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(
    config: ServerConfig,
    deps: ServerDeps,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    WsServer::bind(config, deps).await?.run(running).await
}

// ── Per-connection handler ────────────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    endpoints: Arc<Vec<Arc<EndpointConfig>>>,
    deps: ServerDeps,
) {
    match run_connection(stream, peer_addr, config, endpoints, deps).await {
        Ok(()) => debug!("connection {peer_addr} finished"),
        Err(e) => info!("connection {peer_addr} ended: {e:#}"),
    }
}

/// Runs one connection from HTTP upgrade to close.
///
/// # Errors
///
/// Returns an error only if the WebSocket upgrade fails, which includes
/// requests for unknown paths.
async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    endpoints: Arc<Vec<Arc<EndpointConfig>>>,
    deps: ServerDeps,
) -> anyhow::Result<()> {
    // ── Step 1: upgrade, capturing path and sub-protocols ─────────────────────
    let mut captured: Option<UpgradeRequest> = None;
    let callback = |request: &Request, response: Response| {
        inspect_upgrade(request, response, &endpoints, &mut captured)
    };
    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let Some(upgrade) = captured else {
        anyhow::bail!("upgrade callback did not run for {peer_addr}");
    };

    let remote_ip = client_ip(peer_addr, upgrade.forwarded_for, config.trust_forwarded_for);

    // ── Step 2: outbound queue and writer ─────────────────────────────────────
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
    let (ws_tx, mut ws_rx) = ws_stream.split();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, peer_addr));

    // ── Step 3: authentication decision ───────────────────────────────────────
    let mut handler = ConnectionHandler::new(
        Arc::clone(&upgrade.endpoint),
        Arc::clone(&deps.registry),
        Arc::clone(&deps.latency),
        remote_ip,
        outbound_tx,
    );
    let outcome = deps
        .authenticator
        .authenticate(
            AuthPolicy::from(upgrade.endpoint.auth),
            &upgrade.offered,
            remote_ip,
            SystemTime::now(),
        )
        .await;

    if !handler.open(outcome).await {
        // Give the client a chance to answer our close frame.
        let drained = timeout(config.close_timeout(), async {
            while let Some(Ok(frame)) = ws_rx.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("connection {peer_addr}: no close reply within {:?}", config.close_timeout());
        }
        handler.on_close().await;
        finish_writer(writer, config.close_timeout()).await;
        return Ok(());
    }

    // ── Step 4: read loop ─────────────────────────────────────────────────────
    loop {
        let frame = match ws_rx.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                debug!("connection {peer_addr}: closed");
                break;
            }
            Some(Err(e)) => {
                warn!("connection {peer_addr}: WebSocket error: {e}");
                break;
            }
            None => {
                debug!("connection {peer_addr}: stream ended");
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => handler.on_text(&text).await,
            WsMessage::Binary(data) => handler.on_binary(&data).await,
            WsMessage::Pong(payload) => {
                handler.on_pong(&payload).await;
            }
            WsMessage::Ping(data) => {
                // tungstenite queues the Pong reply itself.
                debug!("connection {peer_addr}: ping ({} bytes)", data.len());
            }
            WsMessage::Close(frame) => {
                debug!("connection {peer_addr}: close frame received: {frame:?}");
                break;
            }
            WsMessage::Frame(_) => {}
        }
    }

    handler.on_close().await;
    finish_writer(writer, config.close_timeout()).await;
    Ok(())
}

// ── Upgrade inspection ────────────────────────────────────────────────────────

/// Upgrade callback: routes by path and echoes the first offered
/// sub-protocol.  Unknown paths get a 404 and no upgrade.
fn inspect_upgrade(
    request: &Request,
    mut response: Response,
    endpoints: &[Arc<EndpointConfig>],
    captured: &mut Option<UpgradeRequest>,
) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    let Some(endpoint) = endpoints.iter().find(|e| e.path == path) else {
        info!("upgrade refused: no endpoint at {path}");
        let mut refusal = ErrorResponse::new(Some(format!("no WebSocket endpoint at {path}")));
        *refusal.status_mut() = StatusCode::NOT_FOUND;
        return Err(refusal);
    };

    let offered = offered_subprotocols(
        request
            .headers()
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    );

    if let Some(first) = offered.first() {
        match HeaderValue::from_str(first) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
            Err(_) => debug!("offered sub-protocol is not a valid header value"),
        }
    }

    let forwarded_for = request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(first_forwarded_hop);

    *captured = Some(UpgradeRequest {
        endpoint: Arc::clone(endpoint),
        offered,
        forwarded_for,
    });
    Ok(response)
}

/// Parses the left-most address of an `X-Forwarded-For` header.
fn first_forwarded_hop(value: &str) -> Option<IpAddr> {
    value.split(',').next()?.trim().parse().ok()
}

/// The address a token must be bound to.
fn client_ip(peer_addr: SocketAddr, forwarded_for: Option<IpAddr>, trust_forwarded_for: bool) -> IpAddr {
    match forwarded_for {
        Some(ip) if trust_forwarded_for => ip,
        _ => peer_addr.ip(),
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Drains `outbound` onto the socket until the queue closes, a close frame
/// has been sent, or the peer goes away.
async fn write_outbound(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    peer_addr: SocketAddr,
) {
    while let Some(message) = outbound.recv().await {
        let is_close = matches!(message, OutboundMessage::Close { .. });
        if let Err(e) = sink.send(to_ws_message(message)).await {
            debug!("connection {peer_addr}: write failed: {e}");
            break;
        }
        if is_close {
            break;
        }
    }
}

/// Waits briefly for the writer to flush, then abandons it.
async fn finish_writer(writer: tokio::task::JoinHandle<()>, grace: Duration) {
    let abort = writer.abort_handle();
    if timeout(grace, writer).await.is_err() {
        abort.abort();
    }
}

fn to_ws_message(message: OutboundMessage) -> WsMessage {
    match message {
        OutboundMessage::Text(text) => WsMessage::Text(text),
        OutboundMessage::Binary(data) => WsMessage::Binary(data),
        OutboundMessage::Ping(payload) => WsMessage::Ping(payload),
        OutboundMessage::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason),
        })),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
