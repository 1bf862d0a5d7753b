//! Per-connection round-trip measurement with WebSocket Ping/Pong.
//!
//! The probe sends a Ping whose payload is the send time (microseconds since
//! the Unix epoch, ASCII digits).  RFC 6455 requires the peer to echo the
//! payload in its Pong, so the latency falls out as `now - payload`.  Only
//! payloads the probe has sent and not yet seen answered are accepted; any
//! other Pong is ignored.
//!
//! A probe fires:
//!
//! - once, right after the connection is registered;
//! - whenever the client sends the `"pingpong"` command;
//! - on a timer, when the endpoint configures `ping_interval_secs`.
//!
//! A probe on a connection whose writer has already stopped is skipped
//! silently.  The timer task is aborted by the handler when the connection
//! closes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::application::registry::ConnectionId;
use crate::domain::OutboundMessage;

/// Receives every latency measurement.
#[async_trait]
pub trait LatencyHandler: Send + Sync {
    async fn on_latency(&self, connection: ConnectionId, millis: f64);
}

/// Default handler: logs `ping pong: <ms>ms` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLatencyHandler;

#[async_trait]
impl LatencyHandler for LoggingLatencyHandler {
    async fn on_latency(&self, connection: ConnectionId, millis: f64) {
        info!("{connection}: ping pong: {millis:.2}ms");
    }
}

fn micros_since_epoch(now: SystemTime) -> u128 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// Unanswered pings remembered per connection; the oldest is forgotten first.
const MAX_OUTSTANDING_PINGS: usize = 16;

/// Ticker for the periodic probe.  The first tick fires after `period`; a
/// stalled runtime delays the next ping instead of catching up in a burst.
fn probe_interval(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Liveness probe bound to one connection's outbound queue.
#[derive(Clone)]
pub struct LivenessProbe {
    connection: ConnectionId,
    outbound: mpsc::Sender<OutboundMessage>,
    handler: Arc<dyn LatencyHandler>,
    outstanding: Arc<Mutex<VecDeque<u128>>>,
}

impl LivenessProbe {
    pub fn new(
        connection: ConnectionId,
        outbound: mpsc::Sender<OutboundMessage>,
        handler: Arc<dyn LatencyHandler>,
    ) -> Self {
        Self {
            connection,
            outbound,
            handler,
            outstanding: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, VecDeque<u128>> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a Ping stamped with `now`.
    ///
    /// Returns `false` when the ping was skipped because the connection is
    /// closing or its queue is full.
    pub fn ping(&self, now: SystemTime) -> bool {
        if self.outbound.is_closed() {
            return false;
        }
        let stamp = micros_since_epoch(now);
        let payload = stamp.to_string().into_bytes();
        match self.outbound.try_send(OutboundMessage::Ping(payload)) {
            Ok(()) => {
                let mut outstanding = self.outstanding();
                if outstanding.len() == MAX_OUTSTANDING_PINGS {
                    outstanding.pop_front();
                }
                outstanding.push_back(stamp);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("{}: outbound queue full; probe skipped", self.connection);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Handles a Pong and reports the round trip in milliseconds.
    ///
    /// Returns `None` for a payload this probe did not produce or has already
    /// matched (browsers may send unsolicited Pongs).
    pub async fn on_pong(&self, payload: &[u8], now: SystemTime) -> Option<f64> {
        let Some(sent) = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse::<u128>().ok())
            .filter(|stamp| self.take_outstanding(*stamp))
        else {
            debug!("{}: ignoring pong with foreign payload", self.connection);
            return None;
        };
        let elapsed_micros = micros_since_epoch(now).saturating_sub(sent);
        let millis = elapsed_micros as f64 / 1_000.0;
        self.handler.on_latency(self.connection, millis).await;
        Some(millis)
    }

    fn take_outstanding(&self, stamp: u128) -> bool {
        let mut outstanding = self.outstanding();
        match outstanding.iter().position(|sent| *sent == stamp) {
            Some(index) => {
                outstanding.remove(index);
                true
            }
            None => false,
        }
    }

    /// Starts the periodic probe.  The first tick fires after `period`.
    ///
    /// The task ends on its own once the connection's writer stops; the
    /// caller should still abort it on close.
    pub fn spawn_periodic(&self, period: Duration) -> JoinHandle<()> {
        let probe = self.clone();
        tokio::spawn(async move {
            let mut ticker = probe_interval(period);
            loop {
                ticker.tick().await;
                if probe.outbound.is_closed() {
                    break;
                }
                probe.ping(SystemTime::now());
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
