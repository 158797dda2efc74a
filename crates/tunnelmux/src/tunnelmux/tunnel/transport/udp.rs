use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};

use crate::tunnelmux::{
    net,
    tunnel::transport::{BoxedStream, Transport, TransportListener},
};

/// KCP settings shared by the bridge transport and the P2P channel.
///
/// Stream mode is required: the mux reads frames as a byte stream and KCP
/// message boundaries would otherwise leak through.
pub fn kcp_config() -> KcpConfig {
    let mut cfg = KcpConfig::default();
    cfg.nodelay = KcpNoDelayConfig::fastest();
    cfg.stream = true;
    cfg
}

/// UDP transport implemented as KCP (reliable UDP). Multiplexing is layered
/// on top by the bridge, same as for tcp.
pub struct UdpTransport {
    kcp: KcpConfig,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self { kcp: kcp_config() }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::resolve_socket_addr(&net::normalize_bind_addr(addr)).await?;
        let ln = KcpListener::bind(self.kcp.clone(), bind_addr).await?;
        let local = ln.local_addr().ok();
        let (closed, _) = watch::channel(false);
        Ok(Box::new(UdpTransportListener {
            ln: Mutex::new(ln),
            local,
            closed,
        }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let remote = net::resolve_socket_addr(addr).await?;
        let c = KcpStream::connect(&self.kcp, remote).await?;
        Ok(Box::new(c))
    }
}

pub struct UdpTransportListener {
    ln: Mutex<KcpListener>,
    local: Option<SocketAddr>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl TransportListener for UdpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            anyhow::bail!("udp: listener closed");
        }
        let mut ln = self.ln.lock().await;
        tokio::select! {
            res = ln.accept() => {
                let (c, peer) = res?;
                Ok((Box::new(c), peer))
            }
            _ = closed.wait_for(|c| *c) => anyhow::bail!("udp: listener closed"),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    async fn close(&self) -> anyhow::Result<()> {
        let _ = self.closed.send(true);
        Ok(())
    }
}
