//! Per-connection session state for one miner.

use std::net::SocketAddr;
use std::time::Instant;

/// Stratum connection state machine (see system overview's state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connect,
    Subscribed,
    Ready,
    Closed,
}

/// One `(wall_clock_ms, monotonic_tick)` pair recorded when a share is
/// accepted. The monotonic tick is what guards the ring against wall-clock
/// jumps (NTP steps, manual clock changes).
#[derive(Debug, Clone, Copy)]
struct ShareTimestamp {
    wall_clock_ms: u64,
    tick: Instant,
}

/// A bounded ring of the client's most recent share timestamps, used by the
/// VarDiff engine. Owned exclusively by the client's own task — nothing
/// else appends to or reads it concurrently.
#[derive(Debug, Default)]
pub struct ShareTimestampRing {
    entries: Vec<ShareTimestamp>,
}

const RING_CAPACITY: usize = 100;

impl ShareTimestampRing {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(RING_CAPACITY),
        }
    }

    /// Record a new share timestamp. Returns `false` (and drops the sample)
    /// if `tick` is not strictly greater than the previously recorded tick —
    /// the clock-change guard from the data model invariants.
    pub fn push(&mut self, wall_clock_ms: u64, tick: Instant) -> bool {
        if let Some(last) = self.entries.last() {
            if tick <= last.tick {
                return false;
            }
        }
        if self.entries.len() == RING_CAPACITY {
            self.entries.remove(0);
        }
        self.entries.push(ShareTimestamp { wall_clock_ms, tick });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wall-clock milliseconds of the most recent `min(n, len)` entries,
    /// oldest first.
    pub fn recent_ms(&self, n: usize) -> Vec<u64> {
        let take = n.min(self.entries.len());
        self.entries[self.entries.len() - take..]
            .iter()
            .map(|e| e.wall_clock_ms)
            .collect()
    }
}

/// One connected miner.
pub struct Client {
    /// `extraNonce1`, also used as the subscription ID. 4 bytes, unique
    /// across all currently connected clients.
    pub extra_nonce1: String,
    pub remote_addr: SocketAddr,
    pub state: ClientState,
    pub worker_name: Option<String>,
    pub password: Option<String>,
    /// Initial difficulty from `port.diff`, if configured.
    pub port_diff: Option<f64>,
    pub diff: f64,
    pub share_timestamps: ShareTimestampRing,
    pub last_difficulty_update_ms: u64,
    pub connected_at: Instant,
    pub last_activity: Instant,
    /// Consecutive malformed-JSON-line violations; the connection closes
    /// once this reaches the configured tolerance (spec recommends 3).
    pub consecutive_protocol_violations: u8,
}

impl Client {
    pub fn new(extra_nonce1: String, remote_addr: SocketAddr, initial_diff: f64, port_diff: Option<f64>) -> Self {
        let now = Instant::now();
        Self {
            extra_nonce1,
            remote_addr,
            state: ClientState::Connect,
            worker_name: None,
            password: None,
            port_diff,
            diff: initial_diff,
            share_timestamps: ShareTimestampRing::new(),
            last_difficulty_update_ms: 0,
            connected_at: now,
            last_activity: now,
            consecutive_protocol_violations: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Ready
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
