//! Connection-oriented channel of the backend server.
//!
//! Each connection carries exactly one request and one reply. A request
//! deferred behind a switch update keeps its connection open until it is
//! replayed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::stream::{read_message, StreamError};
use crate::protocol::WireCodec;
use crate::server::backend::{Backend, Request};
use crate::server::udp::send_all;

/// How long a client has to deliver its request.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
enum ConnectionError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for the request")]
    ReadTimeout,

    #[error("Request was dropped without a reply")]
    NoReply,
}

/// Accept connections forever, one task per connection.
pub async fn serve_tcp(
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    backend: Arc<Backend>,
    codec: WireCodec,
    max_len: usize,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let socket = socket.clone();
        let backend = backend.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &socket, &backend, codec, max_len).await
            {
                warn!(%peer, "Connection failed: {e}");
                backend
                    .metrics()
                    .dropped
                    .with_label_values(&["connection"])
                    .inc();
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    socket: &UdpSocket,
    backend: &Backend,
    codec: WireCodec,
    max_len: usize,
) -> Result<(), ConnectionError> {
    let msg = tokio::time::timeout(READ_TIMEOUT, read_message(&mut stream, &codec, max_len))
        .await
        .map_err(|_| ConnectionError::ReadTimeout)??;
    debug!(%peer, op = %msg.op, key = %msg.key, "Stream request");
    backend
        .metrics()
        .requests
        .with_label_values(&[msg.op.name(), "tcp"])
        .inc();

    let (tx, rx) = oneshot::channel();
    let out = backend.handle(Request::stream(msg, tx)).await;
    // Requests replayed by this one may owe datagram replies.
    send_all(socket, &codec, &out).await;

    let reply = rx.await.map_err(|_| ConnectionError::NoReply)?;
    let bytes = codec
        .encode_message(&reply)
        .map_err(|e| ConnectionError::Stream(e.into()))?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}
