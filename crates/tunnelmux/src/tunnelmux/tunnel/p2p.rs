//! Peer-to-peer NAT traversal.
//!
//! The visitor side runs [`P2pVisitor`], which keeps trying to establish a
//! direct KCP connection to the provider and publishes the resulting mux
//! session in a shared [`P2pContext`]. [`P2pBridge`] opens links over that
//! session. The provider side joins a rendezvous when the server signals it
//! through a `p2p` link ([`serve_provider`]).

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::watch};
use tokio_kcp::{KcpListener, KcpStream};

use crate::tunnelmux::{
    net,
    tunnel::{
        bridge::{Bridge, BridgeError},
        client::{BridgeDialer, LinkServer},
        link::{self, LinkDescriptor},
        mux::{MuxConfig, MuxSession, Role},
        protocol::{self, WorkKind},
        rendezvous::{self, PeerRole, RendezvousError},
        transport::{BoxedStream, udp::kcp_config},
    },
};

pub const MONITOR_TICK: Duration = Duration::from_secs(1);
pub const PUNCH_ATTEMPTS: usize = 10;
const KCP_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const KCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("no usable local udp address")]
    NoUsableAddress,
    #[error("address family mismatch: local {local}, remote {remote}")]
    AddressFamilyMismatch { local: SocketAddr, remote: SocketAddr },
    #[error("rendezvous failed: {0}")]
    RendezvousFailed(String),
    #[error("hole punching failed: {0}")]
    PunchFailed(#[from] RendezvousError),
    #[error("kcp: {0}")]
    Kcp(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum P2pState {
    Idle,
    Probing,
    Rendezvous,
    Punching,
    Established,
    /// No usable local address; traversal stopped for the process lifetime.
    Disabled,
}

struct Slot {
    session: Option<Arc<MuxSession>>,
    healthy: bool,
}

/// Shared view of the current p2p session of one visitor.
pub struct P2pContext {
    slot: Mutex<Slot>,
    /// Bumped whenever a healthy session is published.
    ready: watch::Sender<u64>,
    state: watch::Sender<P2pState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl P2pContext {
    pub fn new() -> Arc<Self> {
        let (ready, _) = watch::channel(0);
        let (state, _) = watch::channel(P2pState::Idle);
        Arc::new(Self {
            slot: Mutex::new(Slot {
                session: None,
                healthy: false,
            }),
            ready,
            state,
        })
    }

    pub fn publish(&self, sess: Arc<MuxSession>) {
        let old = {
            let mut slot = lock(&self.slot);
            slot.healthy = true;
            slot.session.replace(sess)
        };
        if let Some(old) = old {
            old.close();
        }
        self.ready.send_modify(|n| *n = n.wrapping_add(1));
        self.set_state(P2pState::Established);
    }

    /// The published session, if it is marked healthy and still open.
    pub fn healthy_session(&self) -> Option<Arc<MuxSession>> {
        let slot = lock(&self.slot);
        match &slot.session {
            Some(s) if slot.healthy && !s.is_closed() => Some(s.clone()),
            _ => None,
        }
    }

    /// Stops new links from using the current session and lets the monitor
    /// build a replacement on its next tick.
    pub fn mark_unhealthy(&self) {
        lock(&self.slot).healthy = false;
    }

    pub async fn wait_healthy(&self, timeout: Duration) -> Option<Arc<MuxSession>> {
        let mut rx = self.ready.subscribe();
        let res = tokio::time::timeout(timeout, rx.wait_for(|_| self.healthy_session().is_some())).await;
        match res {
            Ok(Ok(_)) => self.healthy_session(),
            _ => None,
        }
    }

    pub fn state(&self) -> P2pState {
        *self.state.borrow()
    }

    fn set_state(&self, s: P2pState) {
        self.state.send_if_modified(|cur| {
            if *cur == s {
                false
            } else {
                *cur = s;
                true
            }
        });
    }
}

/// Client-side bridge over the direct session.
pub struct P2pBridge {
    ctx: Arc<P2pContext>,
    wait_timeout: Duration,
}

impl P2pBridge {
    pub fn new(ctx: Arc<P2pContext>, wait_timeout: Duration) -> Self {
        Self { ctx, wait_timeout }
    }
}

#[async_trait]
impl Bridge for P2pBridge {
    async fn request_link(&self, _client_id: &str, desc: LinkDescriptor) -> Result<BoxedStream, BridgeError> {
        let sess = self
            .ctx
            .wait_healthy(self.wait_timeout)
            .await
            .ok_or(BridgeError::NoSession)?;

        match link::open_link(&sess, &desc).await {
            Ok(st) => Ok(Box::new(st)),
            Err(err) => {
                tracing::warn!(session=%sess.id(), err=%err, "p2p: link failed; marking session unhealthy");
                self.ctx.mark_unhealthy();
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RendezvousGrant {
    pub addr: SocketAddr,
    pub ticket: String,
}

/// Asks the server for a rendezvous address and ticket.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn request_rendezvous(&self) -> Result<RendezvousGrant, P2pError>;
}

/// Signaling through a `P2p` bridge connection authenticated with the tunnel
/// password digest.
pub struct BridgeSignaling {
    dialer: BridgeDialer,
    password: String,
}

impl BridgeSignaling {
    pub fn new(dialer: BridgeDialer, password: &str) -> Self {
        Self {
            dialer,
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl Signaling for BridgeSignaling {
    async fn request_rendezvous(&self) -> Result<RendezvousGrant, P2pError> {
        let mut conn = self
            .dialer
            .dial_work(WorkKind::P2p, &self.password)
            .await
            .map_err(|e| P2pError::RendezvousFailed(e.to_string()))?;
        let (addr, ticket) = protocol::read_p2p_grant(&mut conn)
            .await
            .map_err(|e| P2pError::RendezvousFailed(e.to_string()))?;
        let addr = net::with_default_host(&addr, self.dialer.server_host());
        let addr = net::resolve_socket_addr(&addr)
            .await
            .map_err(|e| P2pError::RendezvousFailed(e.to_string()))?;
        Ok(RendezvousGrant {
            addr: net::canonical(addr),
            ticket,
        })
    }
}

/// Visitor-side traversal loop.
pub struct P2pVisitor {
    ctx: Arc<P2pContext>,
    signaling: Arc<dyn Signaling>,
    mux: MuxConfig,
    candidates: Vec<String>,
}

impl P2pVisitor {
    pub fn new(ctx: Arc<P2pContext>, signaling: Arc<dyn Signaling>, mux: MuxConfig) -> Self {
        Self {
            ctx,
            signaling,
            mux,
            candidates: vec!["0.0.0.0:0".into(), "[::]:0".into()],
        }
    }

    /// Overrides the local bind addresses tried for candidate sockets.
    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Retries on every tick while no healthy session exists. Only
    /// [`P2pError::NoUsableAddress`] stops the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(MONITOR_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if self.ctx.healthy_session().is_some() {
                        continue;
                    }
                    if !self.step().await {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one establishment cycle. Returns false once traversal is disabled.
    pub async fn step(&self) -> bool {
        match self.attempt().await {
            Ok(sess) => {
                tracing::info!(session=%sess.id(), peer=?sess.remote_addr(), "p2p: established");
                metrics::counter!("tunnelmux_p2p_established_total").increment(1);
                self.ctx.publish(Arc::new(sess));
                true
            }
            Err(P2pError::NoUsableAddress) => {
                tracing::error!("p2p: no usable local address; direct connections disabled");
                self.ctx.set_state(P2pState::Disabled);
                false
            }
            Err(err @ P2pError::AddressFamilyMismatch { .. }) => {
                tracing::debug!(err=%err, "p2p: skipping cycle");
                self.ctx.set_state(P2pState::Idle);
                true
            }
            Err(err) => {
                tracing::warn!(err=%err, "p2p: attempt failed; relaying until next try");
                self.ctx.set_state(P2pState::Idle);
                true
            }
        }
    }

    async fn attempt(&self) -> Result<MuxSession, P2pError> {
        self.ctx.set_state(P2pState::Probing);
        let mut socks = Vec::new();
        for c in &self.candidates {
            match UdpSocket::bind(c.as_str()).await {
                Ok(s) => socks.push(s),
                Err(err) => tracing::debug!(candidate=%c, err=%err, "p2p: candidate bind failed"),
            }
        }
        if socks.is_empty() {
            return Err(P2pError::NoUsableAddress);
        }

        self.ctx.set_state(P2pState::Rendezvous);
        let grant = self.signaling.request_rendezvous().await?;

        let Some(sock) = take_same_family(&mut socks, grant.addr) else {
            let local = socks
                .first()
                .and_then(|s| s.local_addr().ok())
                .ok_or(P2pError::NoUsableAddress)?;
            return Err(P2pError::AddressFamilyMismatch {
                local,
                remote: grant.addr,
            });
        };
        drop(socks);
        let local = sock.local_addr()?;

        let peer = rendezvous::exchange(&sock, grant.addr, PeerRole::Visitor, &grant.ticket).await?;
        if !net::same_family(local, peer) {
            return Err(P2pError::AddressFamilyMismatch { local, remote: peer });
        }

        self.ctx.set_state(P2pState::Punching);
        rendezvous::punch(&sock, peer, PUNCH_ATTEMPTS).await?;

        let kcp = tokio::time::timeout(
            KCP_CONNECT_TIMEOUT,
            KcpStream::connect_with_socket(&kcp_config(), sock, peer),
        )
        .await
        .map_err(|_| P2pError::Kcp("connect timeout".into()))?
        .map_err(|e| P2pError::Kcp(e.to_string()))?;

        Ok(MuxSession::new(kcp, Role::Client, self.mux.clone(), Some(peer)))
    }
}

fn take_same_family(socks: &mut Vec<UdpSocket>, remote: SocketAddr) -> Option<UdpSocket> {
    let idx = socks
        .iter()
        .position(|s| s.local_addr().is_ok_and(|a| net::same_family(a, remote)))?;
    Some(socks.swap_remove(idx))
}

/// Provider side: join the rendezvous named by `desc`, accept the visitor's
/// KCP connection and serve its streams as ordinary links until the session
/// ends.
pub async fn serve_provider(
    desc: LinkDescriptor,
    server_host: &str,
    mux: MuxConfig,
    links: Arc<LinkServer>,
) -> anyhow::Result<()> {
    let addr = net::with_default_host(&desc.target, server_host);
    let server = net::canonical(net::resolve_socket_addr(&addr).await?);

    let sock = UdpSocket::bind(net::unspecified_like(server)).await?;
    let peer = rendezvous::exchange(&sock, server, PeerRole::Provider, &desc.ticket).await?;
    rendezvous::punch(&sock, peer, PUNCH_ATTEMPTS).await?;

    let mut ln = KcpListener::from_socket(kcp_config(), sock).await?;
    let (kcp, from) = tokio::time::timeout(KCP_ACCEPT_TIMEOUT, ln.accept())
        .await
        .map_err(|_| anyhow::anyhow!("p2p: visitor did not connect"))??;

    let sess = MuxSession::new(kcp, Role::Server, mux, Some(from));
    tracing::info!(session=%sess.id(), peer=%from, "p2p: provider session established");

    while let Ok(st) = sess.accept().await {
        links.spawn(st);
    }
    // The listener owns the socket's receive loop; keep it until the session is gone.
    drop(ln);
    tracing::info!(session=%sess.id(), "p2p: provider session closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FixedSignaling(SocketAddr);

    #[async_trait]
    impl Signaling for FixedSignaling {
        async fn request_rendezvous(&self) -> Result<RendezvousGrant, P2pError> {
            Ok(RendezvousGrant {
                addr: self.0,
                ticket: "t".into(),
            })
        }
    }

    #[tokio::test]
    async fn family_mismatch_returns_to_idle_without_session() {
        // Rendezvous that reports an IPv6 peer to an IPv4 visitor.
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake_addr = fake.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let Ok((_, from)) = fake.recv_from(&mut buf).await else { return };
                let _ = fake.send_to(b"TMPA[2001:db8::1]:4000", from).await;
            }
        });

        let ctx = P2pContext::new();
        let visitor = P2pVisitor::new(ctx.clone(), Arc::new(FixedSignaling(fake_addr)), MuxConfig::default())
            .with_candidates(vec!["127.0.0.1:0".into()]);

        let err = visitor.attempt().await.err().unwrap();
        assert!(matches!(err, P2pError::AddressFamilyMismatch { .. }));

        assert!(visitor.step().await);
        assert_eq!(ctx.state(), P2pState::Idle);
        assert!(ctx.healthy_session().is_none());
    }

    #[tokio::test]
    async fn no_candidate_disables_traversal() {
        let ctx = P2pContext::new();
        let visitor = P2pVisitor::new(
            ctx.clone(),
            Arc::new(FixedSignaling("127.0.0.1:9".parse().unwrap())),
            MuxConfig::default(),
        )
        .with_candidates(vec!["not-an-address".into()]);

        assert!(!visitor.step().await);
        assert_eq!(ctx.state(), P2pState::Disabled);
    }

    #[tokio::test]
    async fn bridge_waits_for_publish_and_marks_unhealthy_on_failure() {
        let ctx = P2pContext::new();
        let bridge = P2pBridge::new(ctx.clone(), Duration::from_millis(100));
        assert!(matches!(
            bridge.request_link("", LinkDescriptor::tcp("x:1")).await,
            Err(BridgeError::NoSession)
        ));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let visitor_side = Arc::new(MuxSession::client(a, MuxConfig::default()));
        let provider_side = MuxSession::server(b, MuxConfig::default());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let bridge = P2pBridge::new(ctx, Duration::from_secs(2));
                let mut st = bridge.request_link("", LinkDescriptor::tcp("x:1")).await.unwrap();
                st.write_all(b"direct").await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.publish(visitor_side.clone());
        waiter.await.unwrap();

        let mut inbound = provider_side.accept().await.unwrap();
        assert_eq!(link::read_descriptor(&mut inbound).await.unwrap().target, "x:1");
        let mut buf = [0u8; 6];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");

        visitor_side.close();
        assert!(ctx.healthy_session().is_none());
        assert!(bridge.request_link("", LinkDescriptor::tcp("x:1")).await.is_err());
    }
}
