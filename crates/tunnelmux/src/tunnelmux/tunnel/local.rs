//! Client-side local listeners for secret and p2p tunnels.
//!
//! A visitor connects to a local port; its bytes are carried to the provider
//! either directly over the p2p session or, when none is healthy, relayed
//! through the bridge with work kind `Secret`.

use std::{sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::tunnelmux::tunnel::{
    bridge::Bridge,
    client::BridgeDialer,
    codec::{self, LinkCodec, Side},
    link::LinkDescriptor,
    mux::MuxConfig,
    p2p::{BridgeSignaling, P2pBridge, P2pContext, P2pVisitor},
    protocol::WorkKind,
};

/// How long a visitor connection waits for a direct session before relaying.
const P2P_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    Secret,
    P2p,
}

#[derive(Debug, Clone)]
pub struct LocalSpec {
    pub kind: LocalKind,
    pub bind: String,
    pub password: String,
    /// Provider-side target used for direct links.
    pub target: String,
}

/// Binds the local port described by `spec` and serves it until shutdown.
/// For p2p locals the traversal monitor runs alongside.
pub async fn run_local(
    spec: LocalSpec,
    dialer: BridgeDialer,
    mux: MuxConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ln = TcpListener::bind(crate::tunnelmux::net::normalize_bind_addr(&spec.bind).as_ref()).await?;
    tracing::info!(addr=%spec.bind, kind=?spec.kind, "tunnel: local listener started");

    match spec.kind {
        LocalKind::Secret => serve_secret(ln, dialer, spec.password, shutdown).await,
        LocalKind::P2p => {
            let ctx = P2pContext::new();
            let signaling = Arc::new(BridgeSignaling::new(dialer.clone(), &spec.password));
            let visitor = P2pVisitor::new(ctx.clone(), signaling, mux);
            tokio::spawn(visitor.run(shutdown.clone()));
            serve_p2p(ln, dialer, spec.password, spec.target, ctx, shutdown).await
        }
    }
}

pub async fn serve_secret(
    ln: TcpListener,
    dialer: BridgeDialer,
    password: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let _ = conn.set_nodelay(true);
                let dialer = dialer.clone();
                let password = password.clone();
                tokio::spawn(async move {
                    if let Err(err) = relay_secret(conn, &dialer, &password).await {
                        tracing::warn!(client=%peer, err=%err, "tunnel: secret relay failed");
                    }
                });
            }
        }
    }
}

pub async fn serve_p2p(
    ln: TcpListener,
    dialer: BridgeDialer,
    password: String,
    target: String,
    ctx: Arc<P2pContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bridge = Arc::new(P2pBridge::new(ctx.clone(), P2P_WAIT));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let _ = conn.set_nodelay(true);
                let dialer = dialer.clone();
                let password = password.clone();
                let target = target.clone();
                let bridge = bridge.clone();
                let direct = ctx.healthy_session().is_some();
                tokio::spawn(async move {
                    let res = if direct {
                        relay_direct(conn, &bridge, &dialer, &password, &target).await
                    } else {
                        relay_secret(conn, &dialer, &password).await
                    };
                    if let Err(err) = res {
                        tracing::warn!(client=%peer, err=%err, "tunnel: p2p visitor connection failed");
                    }
                });
            }
        }
    }
}

async fn relay_direct(
    conn: TcpStream,
    bridge: &P2pBridge,
    dialer: &BridgeDialer,
    password: &str,
    target: &str,
) -> anyhow::Result<()> {
    match bridge.request_link("", LinkDescriptor::tcp(target)).await {
        Ok(link) => {
            let (up, down) = codec::pipe(conn, link, &LinkCodec::plain(), Side::Initiator).await?;
            tracing::debug!(up, down, "tunnel: direct link closed");
            Ok(())
        }
        Err(err) => {
            tracing::info!(err=%err, "tunnel: direct link unavailable; relaying");
            relay_secret(conn, dialer, password).await
        }
    }
}

async fn relay_secret(conn: TcpStream, dialer: &BridgeDialer, password: &str) -> anyhow::Result<()> {
    let link = dialer.dial_work(WorkKind::Secret, password).await?;
    let (up, down) = codec::pipe(conn, link, &LinkCodec::plain(), Side::Initiator).await?;
    tracing::debug!(up, down, "tunnel: relayed link closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UdpSocket,
    };

    use crate::tunnelmux::{
        quota::ClientQuotas,
        tunnel::{
            client::{Client, ClientOptions, LinkServer},
            manager::Manager,
            p2p::{self, P2pError, P2pState, RendezvousGrant, Signaling},
            rendezvous::{self, RendezvousServer},
            server::{ClientAuth, SecretTunnel, Server, ServerOptions},
            transport::{TransportKind, tcp::TcpTransportListener},
        },
    };

    struct FixedGrant {
        addr: SocketAddr,
        ticket: String,
    }

    #[async_trait]
    impl Signaling for FixedGrant {
        async fn request_rendezvous(&self) -> Result<RendezvousGrant, P2pError> {
            Ok(RendezvousGrant {
                addr: self.addr,
                ticket: self.ticket.clone(),
            })
        }
    }

    async fn echo_target() -> SocketAddr {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut c, _)) = echo.accept().await else { return };
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        echo_addr
    }

    fn client_opts(server_addr: String, vkey: &str) -> ClientOptions {
        ClientOptions {
            server_addr,
            transport: TransportKind::Tcp,
            ws_path: "/".into(),
            vkey: vkey.into(),
            dial_timeout: Duration::from_secs(2),
            mux: MuxConfig::default(),
        }
    }

    #[tokio::test]
    async fn visitor_relays_while_direct_path_is_unavailable() {
        let echo_addr = echo_target().await;

        let opts = ServerOptions {
            clients: vec![ClientAuth {
                id: "provider".into(),
                vkey: "vk".into(),
                compress: true,
                crypt: true,
            }],
            secrets: vec![SecretTunnel {
                id: "p1".into(),
                client: "provider".into(),
                password: "pw".into(),
                target: echo_addr.to_string(),
                p2p: true,
            }],
            mux: MuxConfig::default(),
            handshake_timeout: Duration::from_secs(2),
            p2p_addr: ":0".into(),
        };
        let manager = Arc::new(Manager::new());
        let server = Server::new(opts, manager.clone(), Arc::new(ClientQuotas::default()), None);
        let bridge_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = bridge_ln.local_addr().unwrap();
        let (_stop, stop_rx) = watch::channel(false);
        tokio::spawn(server.serve(Box::new(TcpTransportListener::new(bridge_ln)), stop_rx.clone()));

        let provider = Client::new(client_opts(bridge_addr.to_string(), "vk")).unwrap();
        tokio::spawn({
            let rx = stop_rx.clone();
            async move { provider.run(rx).await }
        });
        let mut changes = manager.subscribe();
        while !manager.is_online("provider").await {
            changes.changed().await.unwrap();
        }

        // A rendezvous answer of the wrong family sends the visitor back to idle.
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake_addr = fake.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((_, from)) = fake.recv_from(&mut buf).await {
                let _ = fake.send_to(b"TMPA[2001:db8::1]:4000", from).await;
            }
        });
        let ctx = P2pContext::new();
        let grant = FixedGrant {
            addr: fake_addr,
            ticket: "t".into(),
        };
        let visitor = P2pVisitor::new(ctx.clone(), Arc::new(grant), MuxConfig::default())
            .with_candidates(vec!["127.0.0.1:0".into()]);
        assert!(visitor.step().await);
        assert_eq!(ctx.state(), P2pState::Idle);

        let visitor_dialer = Client::new(client_opts(bridge_addr.to_string(), "unused"))
            .unwrap()
            .dialer();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(serve_p2p(
            local,
            visitor_dialer,
            "pw".into(),
            echo_addr.to_string(),
            ctx.clone(),
            stop_rx.clone(),
        ));

        let mut conn = TcpStream::connect(local_addr).await.unwrap();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        conn.write_all(&payload).await.unwrap();
        let mut got = vec![0u8; payload.len()];
        conn.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);
        assert!(ctx.healthy_session().is_none());
    }

    #[tokio::test]
    async fn visitor_bytes_take_the_punched_path() {
        let echo_addr = echo_target().await;

        let rv = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
        let rv_addr = rv.local_addr().unwrap();
        let (_stop, stop_rx) = watch::channel(false);
        tokio::spawn(rv.clone().run(stop_rx.clone()));
        let ticket = rendezvous::new_ticket();
        rv.issue(&ticket);

        // Provider half, as driven by a `p2p` link from the server.
        let links = LinkServer::new(&client_opts("127.0.0.1:1".into(), "vk")).without_p2p();
        tokio::spawn(p2p::serve_provider(
            LinkDescriptor::p2p(rv_addr.to_string(), ticket.clone()),
            "127.0.0.1",
            MuxConfig::default(),
            links,
        ));

        let ctx = P2pContext::new();
        let visitor = P2pVisitor::new(ctx.clone(), Arc::new(FixedGrant { addr: rv_addr, ticket }), MuxConfig::default())
            .with_candidates(vec!["127.0.0.1:0".into()]);
        let stepped = tokio::time::timeout(Duration::from_secs(15), visitor.step())
            .await
            .expect("traversal finished");
        assert!(stepped);
        assert_eq!(ctx.state(), P2pState::Established);
        assert!(ctx.healthy_session().is_some());

        // Nothing listens on the bridge address, so a relay fallback would fail.
        let dead_bridge = Client::new(client_opts("127.0.0.1:1".into(), "unused")).unwrap().dialer();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(serve_p2p(
            local,
            dead_bridge,
            "pw".into(),
            echo_addr.to_string(),
            ctx.clone(),
            stop_rx,
        ));

        let mut conn = TcpStream::connect(local_addr).await.unwrap();
        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
        conn.write_all(&payload).await.unwrap();
        let mut got = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(10), conn.read_exact(&mut got))
            .await
            .expect("echo over the direct session")
            .unwrap();
        assert_eq!(got, payload);
        assert!(ctx.healthy_session().is_some());
    }
}
