//! Backend server: a datagram socket and a stream listener on one port.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use crate::config::Config;
use crate::protocol::WireCodec;
use crate::server::backend::Backend;
use crate::server::tcp::serve_tcp;
use crate::server::udp::{run_watchdog, serve_udp};

pub struct BackendServer {
    socket: Arc<UdpSocket>,
    listener: TcpListener,
    backend: Arc<Backend>,
    codec: WireCodec,
    max_len: usize,
}

impl BackendServer {
    /// Bind both channels. With port 0 the stream listener reuses the port
    /// the datagram socket was given.
    pub async fn bind(
        addr: SocketAddr,
        backend: Arc<Backend>,
        config: &Config,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let listener = TcpListener::bind(socket.local_addr()?).await?;
        info!(addr = %socket.local_addr()?, "Backend listening (udp+tcp)");

        Ok(Self {
            socket: Arc::new(socket),
            listener,
            backend,
            codec: WireCodec::new(config.protocol.value_width),
            max_len: config.server.max_datagram,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until either channel fails.
    pub async fn run(self) -> std::io::Result<()> {
        let Self {
            socket,
            listener,
            backend,
            codec,
            max_len,
        } = self;

        let udp = serve_udp(socket.clone(), backend.clone(), codec, max_len);
        let tcp = serve_tcp(listener, socket.clone(), backend.clone(), codec, max_len);
        let watchdog = run_watchdog(socket, backend, codec);

        tokio::select! {
            res = udp => res,
            res = tcp => res,
            _ = watchdog => Ok(()),
        }
    }
}
