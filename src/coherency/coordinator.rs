//! Coherency state machine.
//!
//! While the switch applies an update to a cached key, the backend must not
//! let later writes overtake it. The coordinator moves to `Blocked` when an
//! update is dispatched to the switch and back to `Open` when the matching
//! UpdateCompleteAck arrives. Non-read requests received in between wait in
//! a FIFO queue and are replayed in arrival order.
//!
//! ```text
//!          block(key, seq)
//!   Open ──────────────────▶ Blocked
//!     ▲                         │
//!     └─────────────────────────┘
//!   acknowledge(key, seq) / expire
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::protocol::CacheKey;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoherencyState {
    /// Requests are served as they arrive.
    Open,
    /// A switch update is in flight; non-reads are deferred.
    Blocked,
}

impl std::fmt::Display for CoherencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoherencyState::Open => write!(f, "open"),
            CoherencyState::Blocked => write!(f, "blocked"),
        }
    }
}

/// A request the coordinator can order.
pub trait CoherencyRequest {
    /// Reads always reflect the latest local value and never wait.
    fn is_read(&self) -> bool;
}

/// Outcome of presenting a request to the coordinator.
#[derive(Debug)]
pub enum Admission<R> {
    /// Serve the request now.
    Serve(R),
    /// The request was queued behind the in-flight update.
    Deferred,
}

/// The in-flight switch update.
#[derive(Debug, Clone, Copy)]
struct PendingUpdate {
    key: CacheKey,
    /// Sequence number of the update, echoed by its ack.
    seq: u32,
    since: Instant,
}

/// Open/Blocked state machine with its deferred-request queue.
#[derive(Debug)]
pub struct CoherencyCoordinator<R> {
    pending: Option<PendingUpdate>,
    deferred: VecDeque<R>,
}

impl<R> Default for CoherencyCoordinator<R> {
    fn default() -> Self {
        Self {
            pending: None,
            deferred: VecDeque::new(),
        }
    }
}

impl<R: CoherencyRequest> CoherencyCoordinator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CoherencyState {
        if self.pending.is_some() {
            CoherencyState::Blocked
        } else {
            CoherencyState::Open
        }
    }

    /// Key whose update is awaiting acknowledgment.
    pub fn pending_key(&self) -> Option<CacheKey> {
        self.pending.map(|p| p.key)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Decide whether a request is served now or deferred.
    ///
    /// Reads are always served. Other requests queue while an update is in
    /// flight, and also while older deferred requests are still waiting, so
    /// a request never overtakes one that arrived before it.
    pub fn admit(&mut self, request: R) -> Admission<R> {
        if request.is_read() {
            return Admission::Serve(request);
        }
        if self.pending.is_some() || !self.deferred.is_empty() {
            self.deferred.push_back(request);
            debug!(deferred = self.deferred.len(), "Request deferred behind switch update");
            return Admission::Deferred;
        }
        Admission::Serve(request)
    }

    /// An update for `key` was dispatched to the switch: Open -> Blocked.
    pub fn block(&mut self, key: CacheKey, seq: u32) {
        if let Some(pending) = self.pending {
            warn!(
                pending = %pending.key,
                %key,
                "Blocking while another update is in flight"
            );
        }
        self.pending = Some(PendingUpdate {
            key,
            seq,
            since: Instant::now(),
        });
        debug!(%key, seq, "Coherency blocked");
    }

    /// Handle an UpdateCompleteAck. Returns whether the coordinator reopened.
    ///
    /// Acks received while Open, or that do not carry the pending update's
    /// key and sequence number, are ignored. A late ack for a handshake that
    /// already timed out therefore cannot release a newer one.
    pub fn acknowledge(&mut self, key: &CacheKey, seq: u32) -> bool {
        match self.pending {
            None => {
                debug!(%key, seq, "Ack while open ignored");
                false
            }
            Some(pending) if pending.key != *key || pending.seq != seq => {
                warn!(
                    pending = %pending.key,
                    pending_seq = pending.seq,
                    %key,
                    seq,
                    "Ack for a different update ignored"
                );
                false
            }
            Some(pending) => {
                self.pending = None;
                info!(
                    %key,
                    waited_ms = pending.since.elapsed().as_millis() as u64,
                    deferred = self.deferred.len(),
                    "Completed update coherency handshake"
                );
                true
            }
        }
    }

    /// Force the coordinator open if the pending ack is older than `timeout`.
    ///
    /// Returns the key whose handshake was abandoned.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<CacheKey> {
        let pending = self.pending?;
        if now.saturating_duration_since(pending.since) < timeout {
            return None;
        }
        self.pending = None;
        warn!(
            key = %pending.key,
            timeout_ms = timeout.as_millis() as u64,
            deferred = self.deferred.len(),
            "Update acknowledgment timed out, switch cache may be inconsistent"
        );
        Some(pending.key)
    }

    /// Next deferred request to replay, in arrival order. `None` while
    /// Blocked, so a replayed update that blocks again stops the replay.
    pub fn next_deferred(&mut self) -> Option<R> {
        if self.pending.is_some() {
            return None;
        }
        self.deferred.pop_front()
    }
}
