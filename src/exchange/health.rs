//! Ping/pong liveness tracking for websocket sessions.
//!
//! The owning session sends a protocol-specific probe every `ping_interval`
//! and arms a `pong_timeout` deadline. A pong answering the outstanding probe
//! classifies the link by round-trip time; a missed deadline forces `Bad` and
//! the session tears the connection down.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Binary link quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Good,
    Bad,
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionHealth::Good => write!(f, "Good"),
            ConnectionHealth::Bad => write!(f, "Bad"),
        }
    }
}

/// Probe timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Round trips strictly below this are `Good`
    pub satisfaction: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(10_000),
            pong_timeout: Duration::from_millis(1_000),
            satisfaction: Duration::from_millis(150),
        }
    }
}

#[derive(Debug)]
struct ProbeState {
    next_id: u64,
    /// Outstanding probe: (id, sent_at)
    outstanding: Option<(u64, Instant)>,
    last_rtt: Option<Duration>,
    health: ConnectionHealth,
}

/// Per-session probe tracker. Written only by the owning session.
#[derive(Debug)]
pub struct ConnectionHealthMonitor {
    config: HealthConfig,
    state: Mutex<ProbeState>,
}

impl ConnectionHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ProbeState {
                next_id: 1,
                outstanding: None,
                last_rtt: None,
                health: ConnectionHealth::Bad,
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register a probe sent at `sent_at`. Returns the id to put on the wire.
    ///
    /// Any earlier outstanding probe is superseded.
    pub fn record_ping(&self, sent_at: Instant) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.outstanding = Some((id, sent_at));
        id
    }

    /// Register a pong. `ping_id` is `None` for protocols whose pong frames
    /// carry no correlation id; those answer whatever probe is outstanding.
    ///
    /// Returns the new health, or `None` when the pong was stale and ignored.
    pub fn record_pong(&self, ping_id: Option<u64>, received_at: Instant) -> Option<ConnectionHealth> {
        let mut state = self.state.lock();
        let (id, sent_at) = match state.outstanding {
            Some(probe) => probe,
            None => {
                debug!(?ping_id, "Ignoring pong without outstanding ping");
                return None;
            }
        };
        if ping_id.is_some_and(|pid| pid != id) {
            debug!(?ping_id, outstanding = id, "Ignoring stale pong");
            return None;
        }

        let rtt = received_at.saturating_duration_since(sent_at);
        state.outstanding = None;
        state.last_rtt = Some(rtt);
        state.health = if rtt < self.config.satisfaction {
            ConnectionHealth::Good
        } else {
            ConnectionHealth::Bad
        };
        debug!(rtt_ms = rtt.as_millis() as u64, health = %state.health, "Pong received");
        Some(state.health)
    }

    /// Deadline of the outstanding probe, if any.
    pub fn pong_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .outstanding
            .map(|(_, sent_at)| sent_at + self.config.pong_timeout)
    }

    /// Id of the outstanding probe, if any.
    pub fn outstanding(&self) -> Option<u64> {
        self.state.lock().outstanding.map(|(id, _)| id)
    }

    /// The pong deadline for `ping_id` passed. Forces `Bad` and returns true
    /// when that probe was still outstanding; the caller must then tear the
    /// connection down.
    pub fn on_timeout(&self, ping_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.outstanding {
            Some((id, _)) if id == ping_id => {
                state.outstanding = None;
                state.health = ConnectionHealth::Bad;
                warn!(ping_id, "Pong timeout, connection too slow");
                true
            }
            _ => false,
        }
    }

    /// Drop any outstanding probe so that late pongs from a previous
    /// connection are discarded. Health is forced `Bad` until the next probe.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.outstanding = None;
        state.health = ConnectionHealth::Bad;
    }

    pub fn health(&self) -> ConnectionHealth {
        self.state.lock().health
    }

    /// Latest completed round trip in milliseconds.
    pub fn latency_ms(&self) -> Option<u64> {
        self.state.lock().last_rtt.map(|rtt| rtt.as_millis() as u64)
    }
}

/// Read-only view of a session's health for components outside the session.
#[derive(Debug, Clone)]
pub struct HealthReader {
    monitor: Arc<ConnectionHealthMonitor>,
}

impl HealthReader {
    pub fn new(monitor: Arc<ConnectionHealthMonitor>) -> Self {
        Self { monitor }
    }

    pub fn health(&self) -> ConnectionHealth {
        self.monitor.health()
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.monitor.latency_ms()
    }
}
