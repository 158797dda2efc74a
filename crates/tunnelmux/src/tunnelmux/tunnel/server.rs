use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::watch;

use crate::tunnelmux::{
    quota::{QuotaOracle, QuotaPermit},
    tunnel::{
        bridge::{Bridge, BridgeError},
        codec::{self, LinkCodec, Side},
        link::LinkDescriptor,
        manager::Manager,
        mux::{MuxConfig, MuxSession, Role},
        protocol::{self, Status, WorkKind},
        rendezvous::{self, RendezvousServer},
        transport::{BoxedStream, TransportListener},
    },
};

/// A client allowed to open a control session.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    pub id: String,
    pub vkey: String,
    pub compress: bool,
    pub crypt: bool,
}

/// A tunnel reachable through the bridge by password (secret or p2p mode).
#[derive(Debug, Clone)]
pub struct SecretTunnel {
    pub id: String,
    pub client: String,
    pub password: String,
    pub target: String,
    pub p2p: bool,
}

#[derive(Clone)]
pub struct ServerOptions {
    pub clients: Vec<ClientAuth>,
    pub secrets: Vec<SecretTunnel>,
    pub mux: MuxConfig,
    pub handshake_timeout: Duration,
    /// Rendezvous address handed to p2p peers; a port-only value (`":7001"`)
    /// is completed by each peer with the host it dialed.
    pub p2p_addr: String,
}

/// Accepts bridge connections and dispatches them by work kind.
pub struct Server {
    clients: HashMap<String, ClientAuth>,
    secrets: HashMap<String, SecretTunnel>,
    mux: MuxConfig,
    handshake_timeout: Duration,
    p2p_addr: String,
    manager: Arc<Manager>,
    quota: Arc<dyn QuotaOracle>,
    rendezvous: Option<Arc<RendezvousServer>>,
}

impl Server {
    pub fn new(
        opts: ServerOptions,
        manager: Arc<Manager>,
        quota: Arc<dyn QuotaOracle>,
        rendezvous: Option<Arc<RendezvousServer>>,
    ) -> Arc<Self> {
        let clients = opts
            .clients
            .into_iter()
            .map(|c| (protocol::key_digest(&c.vkey), c))
            .collect();
        let secrets = opts
            .secrets
            .into_iter()
            .map(|t| (protocol::key_digest(&t.password), t))
            .collect();
        Arc::new(Self {
            clients,
            secrets,
            mux: opts.mux,
            handshake_timeout: opts.handshake_timeout,
            p2p_addr: opts.p2p_addr,
            manager,
            quota,
            rendezvous,
        })
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.manager.clone()
    }

    pub async fn serve(
        self: Arc<Self>,
        ln: Box<dyn TransportListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(addr=?ln.local_addr(), "tunnel: bridge listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::debug!(err=%err, "tunnel: bridge listener stopped");
                            break;
                        }
                    };
                    let this = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.handle(conn, peer, shutdown).await {
                            tracing::warn!(client=%peer, err=%err, "tunnel: bridge connection ended with error");
                        }
                    });
                }
            }
        }
        ln.close().await?;
        Ok(())
    }

    async fn handle(
        self: Arc<Self>,
        mut conn: BoxedStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let hello = tokio::time::timeout(self.handshake_timeout, protocol::read_hello(&mut conn))
            .await
            .context("bridge hello timeout")??;
        metrics::counter!("tunnelmux_bridge_connections_total", "kind" => hello.kind.as_str()).increment(1);

        match hello.kind {
            WorkKind::Main => self.serve_main(conn, peer, &hello.key, shutdown).await,
            WorkKind::Secret => self.serve_secret(conn, peer, &hello.key).await,
            WorkKind::P2p => self.serve_p2p(conn, peer, &hello.key).await,
        }
    }

    async fn serve_main(
        &self,
        mut conn: BoxedStream,
        peer: SocketAddr,
        key: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let Some(client) = self.clients.get(key) else {
            tracing::warn!(client=%peer, "tunnel: bad vkey");
            protocol::write_status(&mut conn, Status::BadKey).await?;
            return Ok(());
        };
        protocol::write_status(&mut conn, Status::Ok).await?;

        let sess = Arc::new(MuxSession::new(conn, Role::Server, self.mux.clone(), Some(peer)));
        let sid = sess.id().to_string();
        self.manager.register_client(&client.id, sess.clone()).await?;
        tracing::info!(cid=%client.id, sid=%sid, client=%peer, "tunnel: client connected");

        tokio::select! {
            _ = sess.closed() => {}
            _ = shutdown.wait_for(|v| *v) => sess.close(),
        }

        self.manager.unregister_client(&client.id, &sid).await;
        tracing::info!(cid=%client.id, sid=%sid, client=%peer, "tunnel: client disconnected");
        Ok(())
    }

    /// Relays one visitor connection to the tunnel's client through its
    /// control session.
    async fn serve_secret(&self, mut conn: BoxedStream, peer: SocketAddr, key: &str) -> anyhow::Result<()> {
        let Some(tunnel) = self.secrets.get(key) else {
            tracing::warn!(client=%peer, "tunnel: unknown secret");
            protocol::write_status(&mut conn, Status::UnknownTunnel).await?;
            return Ok(());
        };

        let permit = match QuotaPermit::acquire(self.quota.clone(), &tunnel.client) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(tunnel=%tunnel.id, err=%err, "tunnel: secret relay rejected");
                protocol::write_status(&mut conn, Status::ClientOffline).await?;
                return Ok(());
            }
        };

        let (compress, crypt, vkey) = self.client_codec(&tunnel.client);
        let mut desc = LinkDescriptor::tcp(tunnel.target.clone());
        desc.compress = compress;
        desc.crypt = crypt;
        desc.remote_addr = peer.to_string();

        let link = match self.manager.request_link(&tunnel.client, desc).await {
            Ok(l) => l,
            Err(err) => {
                tracing::warn!(tunnel=%tunnel.id, err=%err, "tunnel: secret relay has no client");
                protocol::write_status(&mut conn, Status::ClientOffline).await?;
                return Ok(());
            }
        };
        protocol::write_status(&mut conn, Status::Ok).await?;

        let codec = LinkCodec::new(compress, crypt, vkey);
        let (inbound, outbound) = codec::pipe(conn, link, &codec, Side::Initiator).await?;
        permit.record_flow(inbound, outbound);
        tracing::debug!(tunnel=%tunnel.id, client=%peer, inbound, outbound, "tunnel: secret relay closed");
        Ok(())
    }

    /// Issues a rendezvous ticket to a visitor and tells the provider to join.
    async fn serve_p2p(&self, mut conn: BoxedStream, peer: SocketAddr, key: &str) -> anyhow::Result<()> {
        let (Some(tunnel), Some(rv)) = (self.secrets.get(key).filter(|t| t.p2p), self.rendezvous.as_ref()) else {
            tracing::warn!(client=%peer, "tunnel: p2p request for unknown tunnel");
            protocol::write_status(&mut conn, Status::UnknownTunnel).await?;
            return Ok(());
        };

        let ticket = rendezvous::new_ticket();
        rv.issue(&ticket);

        let signal = LinkDescriptor::p2p(self.p2p_addr.clone(), ticket.clone());
        match self.manager.request_link(&tunnel.client, signal).await {
            // The provider only needs the descriptor.
            Ok(_st) => {}
            Err(BridgeError::ClientOffline(_)) => {
                protocol::write_status(&mut conn, Status::ClientOffline).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        protocol::write_p2p_grant(&mut conn, &self.p2p_addr, &ticket).await?;
        tracing::info!(tunnel=%tunnel.id, client=%peer, "tunnel: p2p rendezvous granted");
        Ok(())
    }

    fn client_codec(&self, client_id: &str) -> (bool, bool, &str) {
        self.clients
            .values()
            .find(|c| c.id == client_id)
            .map(|c| (c.compress, c.crypt, c.vkey.as_str()))
            .unwrap_or((false, false, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelmux::{
        quota::ClientQuotas,
        tunnel::{
            client::{BridgeDialer, Client, ClientOptions},
            transport::{TransportKind, tcp::TcpTransportListener},
        },
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_bridge(
        secrets: Vec<SecretTunnel>,
    ) -> (Arc<Server>, SocketAddr, watch::Sender<bool>) {
        let opts = ServerOptions {
            clients: vec![ClientAuth {
                id: "c1".into(),
                vkey: "vk".into(),
                compress: false,
                crypt: false,
            }],
            secrets,
            mux: MuxConfig::default(),
            handshake_timeout: Duration::from_secs(2),
            p2p_addr: ":0".into(),
        };
        let server = Server::new(opts, Arc::new(Manager::new()), Arc::new(ClientQuotas::default()), None);
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.clone().serve(Box::new(TcpTransportListener::new(ln)), rx));
        (server, addr, tx)
    }

    fn client_opts(addr: SocketAddr, vkey: &str) -> ClientOptions {
        ClientOptions {
            server_addr: addr.to_string(),
            transport: TransportKind::Tcp,
            ws_path: "/".into(),
            vkey: vkey.into(),
            dial_timeout: Duration::from_secs(2),
            mux: MuxConfig::default(),
        }
    }

    #[tokio::test]
    async fn bad_vkey_is_refused() {
        let (_server, addr, _stop) = start_bridge(vec![]).await;
        let dialer = BridgeDialer::new(&client_opts(addr, "wrong"));
        let err = dialer.dial_work(WorkKind::Main, "wrong").await.err().unwrap();
        assert!(err.to_string().contains("BadKey"), "{err}");
    }

    #[tokio::test]
    async fn logged_in_client_serves_links_and_secret_relay() {
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut c, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = c.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let (server, addr, _stop) = start_bridge(vec![SecretTunnel {
            id: "s1".into(),
            client: "c1".into(),
            password: "pw".into(),
            target: echo_addr.to_string(),
            p2p: false,
        }])
        .await;

        let client = Client::new(client_opts(addr, "vk")).unwrap();
        let dialer = client.dialer();
        let (_ctx, crx) = watch::channel(false);
        tokio::spawn(async move { client.run(crx).await });

        let mgr = server.manager();
        let mut changes = mgr.subscribe();
        while !mgr.is_online("c1").await {
            changes.changed().await.unwrap();
        }

        let mut conn = dialer.dial_work(WorkKind::Secret, "pw").await.unwrap();
        conn.write_all(b"through the bridge").await.unwrap();
        let mut buf = [0u8; 18];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the bridge");

        let err = dialer.dial_work(WorkKind::Secret, "nope").await.err().unwrap();
        assert!(err.to_string().contains("UnknownTunnel"), "{err}");
    }
}
