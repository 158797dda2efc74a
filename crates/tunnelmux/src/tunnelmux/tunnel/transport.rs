use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Source of physical connections. Implemented by real sockets as well as by
/// the port dispatcher's per-protocol virtual listeners.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Ws,
}

impl TransportKind {
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(TransportKind::Tcp),
            "udp" | "kcp" => Ok(TransportKind::Udp),
            "ws" | "websocket" => Ok(TransportKind::Ws),
            _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|udp|ws)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Ws => "ws",
        }
    }
}

pub mod tcp;
pub mod udp;
pub mod ws;

pub fn transport_for(kind: TransportKind, ws_path: &str) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Tcp => Arc::new(tcp::TcpTransport::new()),
        TransportKind::Udp => Arc::new(udp::UdpTransport::new()),
        TransportKind::Ws => Arc::new(ws::WsTransport::new(ws_path)),
    }
}
