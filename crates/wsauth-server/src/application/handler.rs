//! Per-connection orchestration.
//!
//! A [`ConnectionHandler`] is created for every connection that completed the
//! HTTP upgrade.  The infrastructure layer feeds it three kinds of events:
//!
//! ```text
//! open(outcome)      once, with the handshake decision
//! on_text / on_binary / on_pong   zero or more times
//! on_close()         once, consumes the handler
//! ```
//!
//! Nothing reaches the application logic before `open` has been called with
//! an accepted outcome: a rejected connection gets its close frame queued,
//! is never registered, and every later event is ignored.
//!
//! The handler never writes to a socket.  It queues [`OutboundMessage`]s on
//! its own connection's channel, or on other members' channels through the
//! [`ConnectionRegistry`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::application::handshake::HandshakeOutcome;
use crate::application::liveness::{LatencyHandler, LivenessProbe};
use crate::application::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Filter};
use crate::domain::{Command, EndpointConfig, MessageMode, OutboundMessage};

/// Where a connection stands relative to its handshake decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pending,
    Joined,
    Rejected,
}

/// Drives one connection from handshake decision to close.
pub struct ConnectionHandler {
    id: ConnectionId,
    remote_ip: IpAddr,
    endpoint: Arc<EndpointConfig>,
    registry: Arc<ConnectionRegistry>,
    outbound: mpsc::Sender<OutboundMessage>,
    probe: LivenessProbe,
    handle: Option<Arc<ConnectionHandle>>,
    probe_timer: Option<JoinHandle<()>>,
    admission: Admission,
}

impl ConnectionHandler {
    pub fn new(
        endpoint: Arc<EndpointConfig>,
        registry: Arc<ConnectionRegistry>,
        latency: Arc<dyn LatencyHandler>,
        remote_ip: IpAddr,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let id = Uuid::new_v4();
        let probe = LivenessProbe::new(id, outbound.clone(), latency);
        Self {
            id,
            remote_ip,
            endpoint,
            registry,
            outbound,
            probe,
            handle: None,
            probe_timer: None,
            admission: Admission::Pending,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// `true` once the connection has been registered.
    pub fn is_joined(&self) -> bool {
        self.admission == Admission::Joined
    }

    /// Applies the handshake decision.
    ///
    /// On acceptance: registers the connection, optionally announces it to
    /// the other members, sends the first probe and starts the probe timer.
    /// On rejection: queues the close frame and does nothing else.
    ///
    /// Returns `true` when the connection was accepted.  The first decision
    /// is final: a later `open` has no effect and returns the same answer.
    pub async fn open(&mut self, outcome: HandshakeOutcome) -> bool {
        match self.admission {
            Admission::Joined => return true,
            Admission::Rejected => return false,
            Admission::Pending => {}
        }

        let principal = match outcome {
            HandshakeOutcome::Accepted { principal, .. } => principal,
            HandshakeOutcome::Rejected(rejection) => {
                self.admission = Admission::Rejected;
                info!(
                    "{} ({}) on {}: rejected: {rejection}",
                    self.id, self.remote_ip, self.endpoint.path
                );
                if self.outbound.try_send(rejection.into_close()).is_err() {
                    debug!("{}: close frame dropped, connection already gone", self.id);
                }
                return false;
            }
        };

        let handle = Arc::new(ConnectionHandle::with_id(
            self.id,
            principal,
            self.remote_ip,
            self.outbound.clone(),
        ));
        self.registry.add(Arc::clone(&handle)).await;
        self.admission = Admission::Joined;
        info!("{handle} joined {}", self.endpoint.path);

        if self.endpoint.announce {
            let label = handle.principal().label();
            self.registry
                .broadcast(Filter::All, OutboundMessage::announcement(label), Some(self.id))
                .await;
        }

        self.probe.ping(SystemTime::now());
        if let Some(period) = self.endpoint.ping_interval() {
            self.probe_timer = Some(self.probe.spawn_periodic(period));
        }

        self.handle = Some(handle);
        true
    }

    /// Handles an inbound text frame.
    pub async fn on_text(&self, text: &str) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        match Command::parse(text) {
            Some(Command::PingPong) => {
                self.probe.ping(SystemTime::now());
            }
            Some(Command::Clients) => {
                let counts = self.registry.describe().await;
                self.reply(handle, OutboundMessage::text(counts.to_string()))
                    .await;
            }
            None => match self.endpoint.mode {
                MessageMode::Echo => self.reply(handle, OutboundMessage::text(text)).await,
                MessageMode::Broadcast => {
                    let message = OutboundMessage::tagged(handle.principal().label(), text);
                    let report = self
                        .registry
                        .broadcast(Filter::All, message, Some(self.id))
                        .await;
                    debug!(
                        "{handle}: broadcast delivered to {}, failed for {}",
                        report.delivered, report.failed
                    );
                }
            },
        }
    }

    /// Handles an inbound binary frame; only its length is relayed.
    pub async fn on_binary(&self, data: &[u8]) {
        let Some(handle) = self.handle.as_ref() else {
            return;
        };

        let summary = OutboundMessage::binary_summary(handle.principal().label(), data.len());
        match self.endpoint.mode {
            MessageMode::Echo => self.reply(handle, summary).await,
            MessageMode::Broadcast => {
                self.registry
                    .broadcast(Filter::All, summary, Some(self.id))
                    .await;
            }
        }
    }

    /// Handles a Pong frame from the client.
    pub async fn on_pong(&self, payload: &[u8]) -> Option<f64> {
        if !self.is_joined() {
            return None;
        }
        self.probe.on_pong(payload, SystemTime::now()).await
    }

    /// Deregisters the connection and stops its probe timer.
    ///
    /// A connection that never joined is removed leniently; a joined one
    /// that has gone missing from the registry is logged at error level and
    /// the close carries on.
    pub async fn on_close(mut self) {
        if let Some(timer) = self.probe_timer.take() {
            timer.abort();
        }

        let joined = self.is_joined();
        if let Err(e) = self.registry.remove(self.id, !joined).await {
            error!("{} ({}): {e}", self.id, self.remote_ip);
        }

        if joined {
            info!(
                "{} ({}) left {}; {}",
                self.id,
                self.remote_ip,
                self.endpoint.path,
                self.registry.describe().await
            );
        }
    }

    /// Queues a reply on the sender's own connection, waiting for room when
    /// its queue is full.
    async fn reply(&self, handle: &ConnectionHandle, message: OutboundMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("{handle}: reply dropped, connection closing");
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Some(timer) = self.probe_timer.take() {
            timer.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
