//! Datagram channel of the backend server.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::protocol::WireCodec;
use crate::server::backend::{Backend, Outbound, Request};

/// Receive datagrams forever, one request per datagram.
///
/// Malformed datagrams are counted and dropped; the loop only ends on a
/// socket error.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    backend: Arc<Backend>,
    codec: WireCodec,
    max_datagram: usize,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let msg = match codec.decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%from, len, "Dropping malformed datagram: {e}");
                backend.metrics().dropped.with_label_values(&["malformed"]).inc();
                continue;
            }
        };
        backend
            .metrics()
            .requests
            .with_label_values(&[msg.op.name(), "udp"])
            .inc();

        let out = backend.handle(Request::datagram(msg, from)).await;
        send_all(&socket, &codec, &out).await;
    }
}

/// Send each outbound datagram. Failures are logged and skipped.
pub async fn send_all(socket: &UdpSocket, codec: &WireCodec, out: &[Outbound]) {
    for Outbound { to, msg } in out {
        let bytes = match codec.encode_message(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(op = %msg.op, key = %msg.key, "Cannot encode reply: {e}");
                continue;
            }
        };
        match socket.send_to(&bytes, to).await {
            Ok(_) => debug!(op = %msg.op, seq = msg.seq, %to, "Sent"),
            Err(e) => warn!(op = %msg.op, %to, "Send failed: {e}"),
        }
    }
}

/// Periodically release a coordinator that has waited too long for its ack.
pub async fn run_watchdog(socket: Arc<UdpSocket>, backend: Arc<Backend>, codec: WireCodec) {
    let Some(timeout) = backend.ack_timeout() else {
        // No timeout configured; park forever.
        return std::future::pending().await;
    };
    let mut ticker = tokio::time::interval((timeout / 4).max(std::time::Duration::from_millis(1)));
    loop {
        ticker.tick().await;
        let out = backend.expire_stale().await;
        if !out.is_empty() {
            send_all(&socket, &codec, &out).await;
        }
    }
}
