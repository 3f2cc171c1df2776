//! Client side of the wire protocol.
//!
//! Reads and coherent updates go over UDP; writes and deletes open one TCP
//! connection per request. Every request gets a fresh sequence number and
//! the reply with the matching number is returned.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::protocol::stream::{read_message, StreamError};
use crate::protocol::{CacheKey, CodecError, Opcode, WireCodec, WireMessage};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected reply {0}")]
    UnexpectedReply(Opcode),
}

pub struct NetCacheClient {
    server: SocketAddr,
    codec: WireCodec,
    timeout: Duration,
    seq: AtomicU32,
}

impl NetCacheClient {
    pub fn new(server: SocketAddr, value_width: usize) -> Self {
        Self {
            server,
            codec: WireCodec::new(value_width),
            timeout: Duration::from_secs(2),
            seq: AtomicU32::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn message(&self, op: Opcode, key: &[u8], value: &[u8]) -> Result<WireMessage, ClientError> {
        let key = CacheKey::from_bytes(key)?;
        if value.len() > self.codec.value_width() {
            return Err(CodecError::ValueTooLong {
                len: value.len(),
                max: self.codec.value_width(),
            }
            .into());
        }
        Ok(WireMessage::new(
            op,
            self.next_seq(),
            key,
            Bytes::copy_from_slice(value),
        ))
    }

    /// Read a key. `None` if the key does not exist.
    pub async fn read(&self, key: &[u8]) -> Result<Option<Bytes>, ClientError> {
        let reply = self.datagram(self.message(Opcode::Read, key, &[])?).await?;
        match reply.op {
            Opcode::Read => Ok(Some(reply.value)),
            Opcode::KeyNotFound => Ok(None),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Update a key the backend already holds, propagating the new value to
    /// the switch cache. Returns `false` if the key does not exist.
    pub async fn update(&self, key: &[u8], value: &[u8]) -> Result<bool, ClientError> {
        let reply = self
            .datagram(self.message(Opcode::CoherentUpdate, key, value)?)
            .await?;
        match reply.op {
            Opcode::RequestSuccess => Ok(true),
            Opcode::KeyNotFound => Ok(false),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Write a key.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ClientError> {
        let reply = self.stream(self.message(Opcode::Write, key, value)?).await?;
        match reply.op {
            Opcode::UpdateComplete | Opcode::RequestSuccess => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Delete a key. Returns `false` if it did not exist.
    pub async fn delete(&self, key: &[u8]) -> Result<bool, ClientError> {
        let reply = self.stream(self.message(Opcode::Delete, key, &[])?).await?;
        match reply.op {
            Opcode::DeleteComplete => Ok(true),
            Opcode::KeyNotFound => Ok(false),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    async fn datagram(&self, request: WireMessage) -> Result<WireMessage, ClientError> {
        let bind: SocketAddr = if self.server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket
            .send_to(&self.codec.encode_message(&request)?, self.server)
            .await?;

        let mut buf = vec![0u8; self.codec.full_len()];
        let wait = async {
            loop {
                let (len, _) = socket.recv_from(&mut buf).await?;
                match self.codec.decode(&buf[..len]) {
                    Ok(reply) if reply.seq == request.seq => {
                        return Ok::<_, ClientError>(reply);
                    }
                    Ok(reply) => debug!(seq = reply.seq, "Ignoring stale reply"),
                    Err(e) => debug!("Ignoring malformed reply: {e}"),
                }
            }
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn stream(&self, request: WireMessage) -> Result<WireMessage, ClientError> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.server).await?;
            stream
                .write_all(&self.codec.encode_message(&request)?)
                .await?;
            Ok::<_, ClientError>(
                read_message(&mut stream, &self.codec, self.codec.full_len()).await?,
            )
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }
}
