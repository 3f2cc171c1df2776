//! Backend request handling.
//!
//! The store and the coherency coordinator sit behind a single lock so that
//! blocking, unblocking and the replay of deferred requests are observed
//! atomically by every serving loop. Handlers compute their replies under
//! the lock; the network loops send them after it is released.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::coherency::coordinator::{
    Admission, CoherencyCoordinator, CoherencyRequest, CoherencyState,
};
use crate::coherency::store::{KvStore, LoadError};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::protocol::{CacheKey, Opcode, WireMessage};

/// Where the reply to a request goes.
#[derive(Debug)]
pub enum ReplyTo {
    /// Connectionless channel: reply to the sender's address.
    Datagram(SocketAddr),
    /// Connection-oriented channel: the connection task waits on this.
    Stream(oneshot::Sender<WireMessage>),
}

/// A client or switch message together with its reply path.
#[derive(Debug)]
pub struct Request {
    pub msg: WireMessage,
    pub reply: ReplyTo,
}

impl Request {
    pub fn datagram(msg: WireMessage, from: SocketAddr) -> Self {
        Self {
            msg,
            reply: ReplyTo::Datagram(from),
        }
    }

    pub fn stream(msg: WireMessage, reply: oneshot::Sender<WireMessage>) -> Self {
        Self {
            msg,
            reply: ReplyTo::Stream(reply),
        }
    }
}

impl CoherencyRequest for Request {
    fn is_read(&self) -> bool {
        self.msg.op.is_read()
    }
}

/// A datagram to send once the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub msg: WireMessage,
}

/// Everything guarded by the backend lock.
struct BackendState {
    store: KvStore,
    coherency: CoherencyCoordinator<Request>,
}

/// Point-in-time view for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub keys: usize,
    pub coherency: CoherencyState,
    pub pending_key: Option<String>,
    pub deferred: usize,
}

/// Backend server state and request semantics.
pub struct Backend {
    state: Mutex<BackendState>,

    /// Destination of UpdateComplete messages; `None` replies to the sender.
    update_target: Option<SocketAddr>,

    /// Give up on a pending acknowledgment after this long.
    ack_timeout: Option<Duration>,

    /// Largest value accepted from bulk-load files.
    value_width: usize,

    metrics: Metrics,
}

impl Backend {
    pub fn new(config: &Config, metrics: Metrics) -> Self {
        let ack_timeout = match config.coherency.ack_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            state: Mutex::new(BackendState {
                store: KvStore::new(),
                coherency: CoherencyCoordinator::new(),
            }),
            update_target: config.server.update_target,
            ack_timeout,
            value_width: config.protocol.value_width,
            metrics,
        }
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handle one incoming message. Returns the datagrams to send.
    pub async fn handle(&self, request: Request) -> Vec<Outbound> {
        let mut state = self.state.lock().await;
        let mut out = Vec::new();

        if request.msg.op == Opcode::UpdateCompleteAck {
            let msg = &request.msg;
            if state.coherency.acknowledge(&msg.key, msg.seq) {
                self.metrics.handshakes.inc();
                self.replay(&mut state, &mut out);
            }
        } else {
            match state.coherency.admit(request) {
                Admission::Serve(request) => self.serve(&mut state, request, &mut out),
                Admission::Deferred => {}
            }
        }

        self.metrics.deferred.set(state.coherency.deferred_len() as i64);
        out
    }

    /// Force the coordinator open if the pending ack has timed out, then
    /// replay what was waiting.
    pub async fn expire_stale(&self) -> Vec<Outbound> {
        let Some(timeout) = self.ack_timeout else {
            return Vec::new();
        };
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        if state.coherency.expire(Instant::now(), timeout).is_some() {
            self.metrics.coherency_timeouts.inc();
            self.replay(&mut state, &mut out);
            self.metrics.deferred.set(state.coherency.deferred_len() as i64);
        }
        out
    }

    /// Replay deferred requests in arrival order until the queue is empty or
    /// a replayed update blocks the coordinator again.
    fn replay(&self, state: &mut BackendState, out: &mut Vec<Outbound>) {
        let mut replayed = 0;
        while let Some(request) = state.coherency.next_deferred() {
            debug!(op = %request.msg.op, key = %request.msg.key, "Replaying deferred request");
            self.serve(state, request, out);
            replayed += 1;
        }
        if replayed > 0 {
            info!(
                replayed,
                remaining = state.coherency.deferred_len(),
                "Replayed deferred requests"
            );
        }
    }

    fn serve(&self, state: &mut BackendState, request: Request, out: &mut Vec<Outbound>) {
        let Request { msg, reply } = request;
        let key = msg.key;
        let stream = matches!(reply, ReplyTo::Stream(_));

        let response = match msg.op {
            Opcode::Read | Opcode::HotRead => {
                debug!(op = %msg.op, %key, "Read");
                Some(match state.store.get(&key) {
                    Some(value) => msg.reply(msg.op, value.clone()),
                    None => msg.reply(Opcode::KeyNotFound, Bytes::new()),
                })
            }

            // Over TCP the reply passes back through the switch, which
            // revalidates its copy of the key.
            Opcode::Write | Opcode::CoherentUpdate if stream => {
                info!(op = %msg.op, %key, "Write");
                state.store.put(key, msg.value.clone());
                Some(msg.reply(Opcode::UpdateComplete, msg.value.clone()))
            }

            Opcode::Write => {
                info!(%key, "Write");
                state.store.put(key, msg.value.clone());
                Some(msg.reply(Opcode::RequestSuccess, msg.value.clone()))
            }

            Opcode::CoherentUpdate => {
                if !state.store.contains(&key) {
                    warn!(%key, "Update for a key the store does not hold");
                    Some(msg.reply(Opcode::KeyNotFound, Bytes::new()))
                } else {
                    let ReplyTo::Datagram(from) = reply else {
                        return;
                    };
                    info!(%key, "Update of cached key");
                    state.store.put(key, msg.value.clone());
                    out.push(Outbound {
                        to: from,
                        msg: msg.reply(Opcode::RequestSuccess, Bytes::new()),
                    });

                    // Hold writes until the switch confirms its copy is fresh.
                    state.coherency.block(key, msg.seq);
                    out.push(Outbound {
                        to: self.update_target.unwrap_or(from),
                        msg: msg.reply(Opcode::UpdateComplete, msg.value.clone()),
                    });
                    return;
                }
            }

            Opcode::Delete => {
                info!(%key, "Delete");
                Some(match state.store.remove(&key) {
                    Some(_) => msg.reply(Opcode::DeleteComplete, Bytes::new()),
                    None => msg.reply(Opcode::KeyNotFound, Bytes::new()),
                })
            }

            other => {
                warn!(op = %other, %key, "Unsupported operation dropped");
                self.metrics
                    .dropped
                    .with_label_values(&["unsupported_op"])
                    .inc();
                None
            }
        };

        if let Some(response) = response {
            send(reply, response, out);
        }
    }

    /// Bulk-load `key=value` pairs into the store.
    pub async fn load_file(&self, path: &Path) -> Result<Vec<(CacheKey, Bytes)>, LoadError> {
        let mut state = self.state.lock().await;
        state.store.populate_from_file(path, self.value_width).await
    }

    /// Insert one pair directly (startup seeding and tests).
    pub async fn seed(&self, key: CacheKey, value: Bytes) {
        self.state.lock().await.store.put(key, value);
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.state.lock().await.store.get(key).cloned()
    }

    pub async fn snapshot(&self) -> BackendSnapshot {
        let state = self.state.lock().await;
        BackendSnapshot {
            keys: state.store.len(),
            coherency: state.coherency.state(),
            pending_key: state.coherency.pending_key().map(|k| k.to_string()),
            deferred: state.coherency.deferred_len(),
        }
    }
}

fn send(reply: ReplyTo, msg: WireMessage, out: &mut Vec<Outbound>) {
    match reply {
        ReplyTo::Datagram(to) => out.push(Outbound { to, msg }),
        ReplyTo::Stream(tx) => {
            // The client may have gone away; a late reply is discarded.
            let _ = tx.send(msg);
        }
    }
}
