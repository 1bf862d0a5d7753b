//! Shared registry of open connections.
//!
//! The registry is the only mutable state shared between connection tasks.
//! It holds one [`ConnectionHandle`] per accepted connection; a handle owns
//! the sending side of that connection's bounded outbound queue, so anything
//! that can see the registry can message any member without touching its
//! socket.
//!
//! # Counters
//!
//! `describe()` must never disagree with `snapshot()`.  The authenticated and
//! anonymous counters therefore live inside the same lock as the member list
//! and are updated in the same critical section as every add or remove.
//!
//! # Broadcast
//!
//! A broadcast copies the member list (cheap `Arc` clones), releases the lock
//! and then calls `try_send` on each recipient.  A full or closed queue is a
//! per-recipient failure: it is counted and logged, and the fan-out carries
//! on with the next member.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;
use wsauth_core::Principal;

use crate::domain::OutboundMessage;

/// Unique id assigned to every accepted connection.
pub type ConnectionId = Uuid;

// ── Errors ────────────────────────────────────────────────────────────────────

/// A remove targeted a connection that is not in the registry.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
}

/// Why a message could not be queued for one recipient.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The recipient's outbound queue is at capacity.
    #[error("outbound queue is full")]
    QueueFull,
    /// The recipient's writer task has gone away.
    #[error("peer connection is closed")]
    PeerClosed,
}

// ── Connection handle ─────────────────────────────────────────────────────────

/// Registry entry for one accepted connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    principal: Principal,
    remote_ip: IpAddr,
    opened_at: SystemTime,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh random id.
    pub fn new(
        principal: Principal,
        remote_ip: IpAddr,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), principal, remote_ip, outbound)
    }

    pub fn with_id(
        id: ConnectionId,
        principal: Principal,
        remote_ip: IpAddr,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            id,
            principal,
            remote_ip,
            opened_at: SystemTime::now(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    /// `true` once the writer task has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queues `message` without waiting.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::QueueFull`] when the queue is at capacity and
    /// [`DeliveryError::PeerClosed`] when the connection's writer has stopped.
    pub fn deliver(&self, message: OutboundMessage) -> Result<(), DeliveryError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::PeerClosed,
        })
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}@{}]", self.id, self.principal.label(), self.remote_ip)
    }
}

// ── Filters and summaries ─────────────────────────────────────────────────────

/// Which members a snapshot or broadcast covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    All,
    Authenticated,
    Anonymous,
}

impl Filter {
    pub fn matches(self, principal: &Principal) -> bool {
        match self {
            Filter::All => true,
            Filter::Authenticated => principal.is_authenticated(),
            Filter::Anonymous => !principal.is_authenticated(),
        }
    }
}

/// Member counts at one instant.
///
/// Renders as `"<n> auth, <n> anon, <n> total"`, which is also the reply to
/// the `"clients"` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounts {
    pub auth: usize,
    pub anon: usize,
}

impl ClientCounts {
    pub fn total(&self) -> usize {
        self.auth + self.anon
    }

    fn bump(&mut self, principal: &Principal) {
        if principal.is_authenticated() {
            self.auth += 1;
        } else {
            self.anon += 1;
        }
    }

    fn drop_one(&mut self, principal: &Principal) {
        if principal.is_authenticated() {
            self.auth = self.auth.saturating_sub(1);
        } else {
            self.anon = self.anon.saturating_sub(1);
        }
    }
}

impl fmt::Display for ClientCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} auth, {} anon, {} total", self.auth, self.anon, self.total())
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RegistryState {
    members: Vec<Arc<ConnectionHandle>>,
    counts: ClientCounts,
}

/// The set of currently open connections.
///
/// Share it as `Arc<ConnectionRegistry>`; every method takes `&self`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle` to the live set.
    ///
    /// Returns `false` (and changes nothing) when a handle with the same id
    /// is already registered.
    pub async fn add(&self, handle: Arc<ConnectionHandle>) -> bool {
        let mut state = self.state.write().await;
        if state.members.iter().any(|m| m.id == handle.id) {
            warn!("connection {} registered twice; ignoring", handle.id);
            return false;
        }
        state.counts.bump(&handle.principal);
        state.members.push(handle);
        true
    }

    /// Removes the connection with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] when `id` is absent and
    /// `lenient` is `false`.  With `lenient` set, absence is not an error.
    pub async fn remove(&self, id: ConnectionId, lenient: bool) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        match state.members.iter().position(|m| m.id == id) {
            Some(index) => {
                let handle = state.members.swap_remove(index);
                state.counts.drop_one(&handle.principal);
                Ok(())
            }
            None if lenient => Ok(()),
            None => Err(RegistryError::NotRegistered(id)),
        }
    }

    /// Point-in-time copy of the members matching `filter`.
    pub async fn snapshot(&self, filter: Filter) -> Vec<Arc<ConnectionHandle>> {
        let state = self.state.read().await;
        state
            .members
            .iter()
            .filter(|m| filter.matches(&m.principal))
            .cloned()
            .collect()
    }

    pub async fn describe(&self) -> ClientCounts {
        self.state.read().await.counts
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.state.read().await.members.iter().any(|m| m.id == id)
    }

    /// Queues `message` for every member matching `filter` except `exclude`.
    pub async fn broadcast(
        &self,
        filter: Filter,
        message: OutboundMessage,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let recipients = self.snapshot(filter).await;
        let mut report = BroadcastReport::default();

        for member in recipients.iter().filter(|m| Some(m.id) != exclude) {
            match member.deliver(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::QueueFull) => {
                    warn!("broadcast to {member}: outbound queue full; message dropped");
                    report.failed += 1;
                }
                Err(DeliveryError::PeerClosed) => {
                    debug!("broadcast to {member}: connection already closing");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wsauth_core::Identity;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn anon_handle(capacity: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(ConnectionHandle::new(Principal::Anonymous, localhost(), tx)),
            rx,
        )
    }

    fn auth_handle(name: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let principal = Principal::Authenticated(Identity::new(1, name, "secret"));
        (Arc::new(ConnectionHandle::new(principal, localhost(), tx)), rx)
    }

    #[tokio::test]
    async fn test_empty_registry_describes_zero() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.describe().await.to_string(), "0 auth, 0 anon, 0 total");
    }

    #[tokio::test]
    async fn test_add_updates_counts_by_principal() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (anon, _rx1) = anon_handle(4);
        let (alice, _rx2) = auth_handle("alice");

        // Act
        registry.add(anon).await;
        registry.add(alice).await;

        // Assert
        let counts = registry.describe().await;
        assert_eq!(counts, ClientCounts { auth: 1, anon: 1 });
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.to_string(), "1 auth, 1 anon, 2 total");
    }

    #[tokio::test]
    async fn test_duplicate_add_is_ignored() {
        let registry = ConnectionRegistry::new();
        let (anon, _rx) = anon_handle(4);

        assert!(registry.add(Arc::clone(&anon)).await);
        assert!(!registry.add(anon).await);

        assert_eq!(registry.describe().await.total(), 1);
        assert_eq!(registry.snapshot(Filter::All).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_registered_connection() {
        let registry = ConnectionRegistry::new();
        let (anon, _rx) = anon_handle(4);
        let id = anon.id();
        registry.add(anon).await;

        tokio_test::assert_ok!(registry.remove(id, false).await);
        assert!(!registry.contains(id).await);
        assert_eq!(registry.describe().await, ClientCounts::default());
    }

    #[tokio::test]
    async fn test_strict_remove_of_absent_connection_errors() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        assert_eq!(
            registry.remove(id, false).await,
            Err(RegistryError::NotRegistered(id))
        );
    }

    #[tokio::test]
    async fn test_lenient_remove_of_absent_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let (anon, _rx) = anon_handle(4);
        registry.add(anon).await;

        tokio_test::assert_ok!(registry.remove(Uuid::new_v4(), true).await);
        assert_eq!(registry.describe().await.total(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_filters_by_principal() {
        let registry = ConnectionRegistry::new();
        let (anon, _rx1) = anon_handle(4);
        let (alice, _rx2) = auth_handle("alice");
        let (bob, _rx3) = auth_handle("bob");
        registry.add(anon).await;
        registry.add(alice).await;
        registry.add(bob).await;

        assert_eq!(registry.snapshot(Filter::All).await.len(), 3);
        assert_eq!(registry.snapshot(Filter::Authenticated).await.len(), 2);
        let anon_only = registry.snapshot(Filter::Anonymous).await;
        assert_eq!(anon_only.len(), 1);
        assert!(!anon_only[0].principal().is_authenticated());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (sender, mut sender_rx) = anon_handle(4);
        let (other, mut other_rx) = anon_handle(4);
        let sender_id = sender.id();
        registry.add(sender).await;
        registry.add(other).await;

        // Act
        let report = registry
            .broadcast(Filter::All, OutboundMessage::text("hi"), Some(sender_id))
            .await;

        // Assert
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert_eq!(other_rx.try_recv().unwrap(), OutboundMessage::text("hi"));
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_full_and_closed_queues() {
        // Arrange: one full queue, one closed queue, one healthy queue
        let registry = ConnectionRegistry::new();
        let (full, _full_rx) = anon_handle(1);
        full.deliver(OutboundMessage::text("backlog")).unwrap();
        let (closed, closed_rx) = anon_handle(4);
        drop(closed_rx);
        let (healthy, mut healthy_rx) = anon_handle(4);
        registry.add(full).await;
        registry.add(closed).await;
        registry.add(healthy).await;

        // Act
        let report = registry
            .broadcast(Filter::All, OutboundMessage::text("news"), None)
            .await;

        // Assert
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 2 });
        assert_eq!(healthy_rx.try_recv().unwrap(), OutboundMessage::text("news"));
    }

    #[tokio::test]
    async fn test_broadcast_respects_filter() {
        let registry = ConnectionRegistry::new();
        let (anon, mut anon_rx) = anon_handle(4);
        let (alice, mut alice_rx) = auth_handle("alice");
        registry.add(anon).await;
        registry.add(alice).await;

        let report = registry
            .broadcast(Filter::Authenticated, OutboundMessage::text("members only"), None)
            .await;

        assert_eq!(report.delivered, 1);
        assert!(anon_rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_ok());
    }

    #[test]
    fn test_deliver_reports_queue_full() {
        let (handle, _rx) = anon_handle(1);
        handle.deliver(OutboundMessage::text("one")).unwrap();
        assert_eq!(
            handle.deliver(OutboundMessage::text("two")),
            Err(DeliveryError::QueueFull)
        );
    }

    #[test]
    fn test_deliver_reports_peer_closed() {
        let (handle, rx) = anon_handle(1);
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.deliver(OutboundMessage::text("late")),
            Err(DeliveryError::PeerClosed)
        );
    }

    #[test]
    fn test_handle_display_uses_label_and_ip() {
        let (handle, _rx) = auth_handle("alice");
        let rendered = handle.to_string();
        assert!(rendered.ends_with("[alice@127.0.0.1]"));
    }
}
