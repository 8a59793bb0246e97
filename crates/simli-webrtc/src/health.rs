//! Timeout supervision and liveness measurement
//!
//! Every supervised phase of connection establishment races the awaited
//! operation against its time budget; the losing side of the race is
//! dropped and the phase surfaces as [`Error::Timeout`]. Budgets follow
//! the service's timing contract.

use crate::signaling::{protocol, SignalingChannel};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Overall budget for one connection attempt
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Budget for ICE candidate gathering
pub const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for the candidate-count convergence heuristic
pub const ICE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Budget for the remote SDP answer to arrive after the offer is sent
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the signaling WebSocket to connect
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for one vendor HTTP request (ICE discovery, token exchange)
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between liveness pings once the session is active
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Race a fallible operation against its time budget
///
/// `phase` names the supervised phase in the timeout error.
pub async fn deadline<T>(
    phase: &str,
    budget: Duration,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(budget, op).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(phase.to_string())),
    }
}

/// Milliseconds since the Unix epoch, used to stamp outbound pings
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Correlates outbound pings with inbound pongs to measure round trips
#[derive(Default)]
pub struct PingTracker {
    sent: Mutex<HashMap<String, Instant>>,
    last_latency: Mutex<Option<Duration>>,
}

impl PingTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the send instant of an outbound ping frame
    pub fn record(&self, message: &str) {
        self.sent.lock().insert(message.to_string(), Instant::now());
    }

    /// Resolve a `pong <echo>` payload into a round-trip latency
    ///
    /// Returns None if no matching ping is pending.
    pub fn observe_pong(&self, payload: &str) -> Option<Duration> {
        let key = protocol::pong_to_ping_key(payload);
        let sent_at = self.sent.lock().remove(&key)?;
        let latency = sent_at.elapsed();
        *self.last_latency.lock() = Some(latency);
        debug!(latency_ms = latency.as_millis() as u64, "signaling round trip");
        Some(latency)
    }

    /// Latency of the most recent resolved round trip, in milliseconds
    pub fn last_latency_ms(&self) -> Option<u64> {
        self.last_latency.lock().map(|d| d.as_millis() as u64)
    }

    /// Drop all pending pings and the recorded latency
    pub fn clear(&self) {
        self.sent.lock().clear();
        *self.last_latency.lock() = None;
    }
}

/// Send a timestamped ping every [`PING_INTERVAL`] while the channel is open
///
/// Spawned once the session is active; ends on its own when the channel
/// closes or a send fails.
pub async fn ping_task(channel: Arc<SignalingChannel>, pings: Arc<PingTracker>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if !channel.is_open() {
            debug!("signaling channel closed, stopping ping task");
            break;
        }

        let message = protocol::ping_message(epoch_millis());
        pings.record(&message);
        if let Err(e) = channel.send_ping(&message) {
            warn!(error = %e, "failed to send ping");
            break;
        }
    }
}
