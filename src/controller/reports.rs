//! Report loop on the controller port.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::controller::dispatcher::{DispatchOutcome, ReportDispatcher};
use crate::protocol::WireCodec;

/// Consume switch reports forever. Acks for applied updates are sent to
/// `backend_addr` from the same socket.
pub async fn serve_reports(
    socket: UdpSocket,
    dispatcher: Arc<ReportDispatcher>,
    codec: WireCodec,
    backend_addr: SocketAddr,
    max_datagram: usize,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let msg = match codec.decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%from, len, "Dropping malformed report: {e}");
                continue;
            }
        };
        debug!(%from, op = %msg.op, key = %msg.key, "Report");

        match dispatcher.handle_report(&msg).await {
            Ok(DispatchOutcome::Acknowledge(ack)) => {
                let sent = match codec.encode_message(&ack) {
                    Ok(bytes) => socket.send_to(&bytes, backend_addr).await.map(|_| ()),
                    Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                };
                if let Err(e) = sent {
                    warn!(key = %ack.key, %backend_addr, "Ack not delivered: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => error!(op = %msg.op, key = %msg.key, "Report failed: {e}"),
        }
    }
}
