use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, sync::watch};

use crate::tunnelmux::{
    net, proxy,
    tunnel::{
        codec::{self, LinkCodec, Side},
        datagram,
        link::{self, LinkKind},
        mux::{MuxConfig, MuxSession, MuxStream},
        p2p,
        protocol::{self, Hello, Status, WorkKind},
        transport::{BoxedStream, Transport, TransportKind, transport_for},
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: TransportKind,
    pub ws_path: String,
    pub vkey: String,
    pub dial_timeout: Duration,
    pub mux: MuxConfig,
}

/// Opens authenticated physical connections to the bridge.
#[derive(Clone)]
pub struct BridgeDialer {
    transport: Arc<dyn Transport>,
    server_addr: String,
    dial_timeout: Duration,
}

impl BridgeDialer {
    pub fn new(opts: &ClientOptions) -> Self {
        Self {
            transport: transport_for(opts.transport, &opts.ws_path),
            server_addr: opts.server_addr.trim().to_string(),
            dial_timeout: opts.dial_timeout,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Host part of the server address; fills in port-only addresses
    /// handed out by the server.
    pub fn server_host(&self) -> &str {
        net::split_host(&self.server_addr)
    }

    /// Dials the bridge and completes the hello for `kind`. `secret` is hashed
    /// before it is sent.
    pub async fn dial_work(&self, kind: WorkKind, secret: &str) -> anyhow::Result<BoxedStream> {
        let mut conn = tokio::time::timeout(self.dial_timeout, self.transport.dial(&self.server_addr))
            .await
            .with_context(|| format!("dial timeout {}", self.server_addr))??;

        let hello = Hello {
            kind,
            key: protocol::key_digest(secret),
        };
        protocol::write_hello(&mut conn, &hello).await?;

        let status = tokio::time::timeout(self.dial_timeout, protocol::read_status(&mut conn))
            .await
            .context("bridge reply timeout")??;
        if status != Status::Ok {
            anyhow::bail!("tunnel: bridge refused {} connection: {status:?}", kind.as_str());
        }
        Ok(conn)
    }
}

/// Serves links the server opens towards this client.
pub struct LinkServer {
    vkey: String,
    dial_timeout: Duration,
    server_host: String,
    mux: MuxConfig,
    /// Cleared for links arriving over a p2p session, which must not nest.
    accept_p2p: bool,
}

impl LinkServer {
    pub fn new(opts: &ClientOptions) -> Self {
        Self {
            vkey: opts.vkey.clone(),
            dial_timeout: opts.dial_timeout,
            server_host: net::split_host(&opts.server_addr).to_string(),
            mux: opts.mux.clone(),
            accept_p2p: true,
        }
    }

    pub fn without_p2p(&self) -> Arc<Self> {
        Arc::new(Self {
            vkey: self.vkey.clone(),
            dial_timeout: self.dial_timeout,
            server_host: self.server_host.clone(),
            mux: self.mux.clone(),
            accept_p2p: false,
        })
    }

    pub fn spawn(self: &Arc<Self>, st: MuxStream) {
        let this = self.clone();
        tokio::spawn(async move {
            let stream = st.id();
            if let Err(err) = this.serve(st).await {
                tracing::debug!(stream, err=%err, "tunnel: link ended");
            }
        });
    }

    pub async fn serve(self: Arc<Self>, mut st: MuxStream) -> anyhow::Result<()> {
        let desc = link::read_descriptor(&mut st).await?;
        match desc.kind {
            LinkKind::Tcp => {
                let up = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&desc.target))
                    .await
                    .with_context(|| format!("dial timeout {}", desc.target))??;
                let _ = up.set_nodelay(true);
                let mut up = up;

                if desc.proxy_protocol {
                    let src = desc.remote_addr.parse::<SocketAddr>().ok();
                    let dst = up.peer_addr().ok();
                    proxy::write_proxy_proto_v2(&mut up, src, dst).await?;
                }

                let codec = LinkCodec::new(desc.compress, desc.crypt, &self.vkey);
                let (up_bytes, down_bytes) = codec::pipe(up, st, &codec, Side::Responder).await?;
                tracing::debug!(addr=%desc.target, up_bytes, down_bytes, "tunnel: tcp link closed");
            }
            LinkKind::Udp => {
                let target = net::resolve_socket_addr(&desc.target).await?;
                let sock = tokio::net::UdpSocket::bind(net::unspecified_like(target)).await?;
                sock.connect(target).await?;
                datagram::relay_udp(st, sock).await?;
            }
            LinkKind::P2p => {
                if !self.accept_p2p {
                    anyhow::bail!("tunnel: p2p link on a p2p session");
                }
                let links = self.without_p2p();
                p2p::serve_provider(desc, &self.server_host, self.mux.clone(), links).await?;
            }
        }
        Ok(())
    }
}

pub struct Client {
    opts: ClientOptions,
    dialer: BridgeDialer,
    links: Arc<LinkServer>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        let dialer = BridgeDialer::new(&opts);
        let links = Arc::new(LinkServer::new(&opts));
        Ok(Self { opts, dialer, links })
    }

    pub fn dialer(&self) -> BridgeDialer {
        self.dialer.clone()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        transport=%self.dialer.transport_name(),
                        server=%self.opts.server_addr,
                        err=%err,
                        backoff=%humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let conn = self.dialer.dial_work(WorkKind::Main, &self.opts.vkey).await?;
        let sess = MuxSession::client(conn, self.opts.mux.clone());

        tracing::info!(
            transport=%self.dialer.transport_name(),
            server=%self.opts.server_addr,
            session=%sess.id(),
            "tunnel: connected"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        sess.close();
                        return Ok(());
                    }
                }
                st = sess.accept() => {
                    let st = st?;
                    self.links.spawn(st);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelmux::tunnel::link::LinkDescriptor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn opts() -> ClientOptions {
        ClientOptions {
            server_addr: "127.0.0.1:1".into(),
            transport: TransportKind::Tcp,
            ws_path: "/".into(),
            vkey: "vk".into(),
            dial_timeout: Duration::from_secs(2),
            mux: MuxConfig::default(),
        }
    }

    #[tokio::test]
    async fn tcp_link_is_dialed_and_piped() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut c, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            c.read_exact(&mut buf).await.unwrap();
            c.write_all(&buf).await.unwrap();
        });

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server_side = MuxSession::server(a, MuxConfig::default());
        let client_side = MuxSession::client(b, MuxConfig::default());
        let links = Arc::new(LinkServer::new(&opts()));

        let mut st = link::open_link(&server_side, &LinkDescriptor::tcp(target_addr.to_string()))
            .await
            .unwrap();
        links.spawn(client_side.accept().await.unwrap());

        st.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }

    #[tokio::test]
    async fn proxy_protocol_header_precedes_payload() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (mut c, _) = target.accept().await.unwrap();
            let mut buf = vec![0u8; 28 + 2];
            c.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (a, b) = tokio::io::duplex(64 * 1024);
        let server_side = MuxSession::server(a, MuxConfig::default());
        let client_side = MuxSession::client(b, MuxConfig::default());
        let links = Arc::new(LinkServer::new(&opts()));

        let mut desc = LinkDescriptor::tcp(target_addr.to_string());
        desc.proxy_protocol = true;
        desc.remote_addr = "198.51.100.7:40000".into();
        let mut st = link::open_link(&server_side, &desc).await.unwrap();
        links.spawn(client_side.accept().await.unwrap());
        st.write_all(b"hi").await.unwrap();

        let buf = seen.await.unwrap();
        assert_eq!(&buf[..12], b"\r\n\r\n\0\r\nQUIT\n");
        assert_eq!(buf[13], 0x11);
        assert_eq!(&buf[16..20], &[198, 51, 100, 7]);
        assert_eq!(&buf[28..], b"hi");
    }
}
