//! Reading one message off a byte stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::codec::{CodecError, WireCodec, WireMessage};

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Connection closed before a full message arrived ({0} bytes read)")]
    Closed(usize),
}

/// Read until one complete message can be decoded.
///
/// A stream carries a single message per connection, so bytes past the
/// message are ignored.
pub async fn read_message<R>(
    reader: &mut R,
    codec: &WireCodec,
    max_len: usize,
) -> Result<WireMessage, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(max_len);
    loop {
        let n = reader.read_buf(&mut buf).await?;
        match codec.decode(&buf) {
            Ok(msg) => return Ok(msg),
            Err(CodecError::Truncated { .. }) if n > 0 && buf.len() < max_len => continue,
            Err(CodecError::Truncated { .. }) => return Err(StreamError::Closed(buf.len())),
            Err(e) => return Err(e.into()),
        }
    }
}
