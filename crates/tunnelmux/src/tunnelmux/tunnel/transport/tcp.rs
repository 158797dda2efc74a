use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::tunnelmux::{
    net,
    tunnel::transport::{BoxedStream, Transport, TransportListener},
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind.as_ref()).await?;
        Ok(Box::new(TcpTransportListener::new(ln)))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
    closed: watch::Sender<bool>,
}

impl TcpTransportListener {
    pub fn new(ln: TcpListener) -> Self {
        let (closed, _) = watch::channel(false);
        Self { ln, closed }
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            anyhow::bail!("tcp: listener closed");
        }
        tokio::select! {
            res = self.ln.accept() => {
                let (c, peer) = res?;
                let _ = c.set_nodelay(true);
                Ok((Box::new(c), peer))
            }
            _ = closed.wait_for(|c| *c) => anyhow::bail!("tcp: listener closed"),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The socket itself is released when the listener is dropped.
        let _ = self.closed.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept_over_loopback() {
        let tr = TcpTransport::new();
        let ln = tr.listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut c = TcpTransport::new().dial(&addr.to_string()).await.unwrap();
            c.write_all(b"ping").await.unwrap();
        });

        let (mut s, _peer) = ln.accept().await.unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let ln = std::sync::Arc::new(TcpTransport::new().listen("127.0.0.1:0").await.unwrap());
        let waiter = {
            let ln = ln.clone();
            tokio::spawn(async move { ln.accept().await.is_err() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ln.close().await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
