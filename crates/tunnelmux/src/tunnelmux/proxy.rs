use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use base64::Engine;
use dashmap::DashMap;
use rand::{RngExt, rng};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    sync::{mpsc, watch},
    task::AbortHandle,
};

use crate::tunnelmux::{
    dispatch::{PeekedStream, find_head_end},
    net,
    quota::{QuotaOracle, QuotaPermit},
    telemetry,
    tunnel::{
        bridge::Bridge,
        codec::{self, LinkCodec, Side},
        datagram,
        link::LinkDescriptor,
        protocol::ProtocolError,
        transport::{BoxedStream, TransportListener},
    },
};

pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const AUTH_ATTEMPTS: usize = 3;
const UDP_BUF: usize = 64 * 1024;
/// Datagrams queued per source address before new ones are dropped.
const UDP_FLOW_QUEUE: usize = 128;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy authentication required")]
    ProxyAuthRequired,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("tunnel has no target")]
    NoTarget,
}

/// How accepted connections are turned into links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    /// Relay raw bytes to one of the tunnel's targets.
    TcpRelay,
    /// Act as an HTTP forward proxy; the request names the target.
    HttpProxy,
}

/// One public tunnel and the link options applied to its connections.
#[derive(Debug, Clone, Default)]
pub struct TunnelSpec {
    pub id: String,
    pub client: String,
    pub targets: Vec<String>,
    pub proxy_protocol: bool,
    pub compress: bool,
    pub crypt: bool,
    /// Key material for `crypt`; the owning client's vkey.
    pub vkey: String,
    pub auth_user: String,
    pub auth_password: String,
    pub handshake_timeout: Duration,
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new(tunnel: &str) -> Self {
        metrics::counter!("tunnelmux_connections_total", "tunnel" => tunnel.to_string()).increment(1);
        metrics::gauge!("tunnelmux_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("tunnelmux_active_connections").decrement(1.0);
    }
}

/// Drops the registry entry even when the connection task is aborted.
struct ConnEntry<'a> {
    conns: &'a telemetry::ConnRegistry,
    id: &'a str,
}

impl Drop for ConnEntry<'_> {
    fn drop(&mut self) {
        self.conns.remove(self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Public listener of one tunnel. Each accepted connection is checked
/// against the client's quota and relayed over a link obtained from the
/// bridge.
pub struct TunnelServer {
    spec: TunnelSpec,
    processor: Processor,
    bridge: Arc<dyn Bridge>,
    quota: Arc<dyn QuotaOracle>,
    conns: telemetry::SharedConns,
    active: Mutex<HashMap<u64, AbortHandle>>,
    next_task: AtomicU64,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    closed: watch::Sender<bool>,
}

impl TunnelServer {
    pub fn new(
        spec: TunnelSpec,
        processor: Processor,
        bridge: Arc<dyn Bridge>,
        quota: Arc<dyn QuotaOracle>,
        conns: telemetry::SharedConns,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            spec,
            processor,
            bridge,
            quota,
            conns,
            active: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
            listener: Mutex::new(None),
            closed,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Runs the accept loop until `shutdown`, [`close`](Self::close) or a
    /// listener failure.
    pub async fn start(
        self: &Arc<Self>,
        listener: Box<dyn TransportListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln: Arc<dyn TransportListener> = Arc::from(listener);
        *lock(&self.listener) = Some(ln.clone());
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            ln.close().await?;
            return Ok(());
        }

        tracing::info!(
            tunnel=%self.spec.id,
            client=%self.spec.client,
            addr=?ln.local_addr(),
            processor=?self.processor,
            "proxy: tunnel listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = closed.wait_for(|c| *c) => return Ok(()),
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            if *self.closed.borrow() {
                                return Ok(());
                            }
                            return Err(err.context(format!("proxy: tunnel {} accept", self.spec.id)));
                        }
                    };
                    self.track(conn, peer);
                }
            }
        }

        self.close().await;
        Ok(())
    }

    fn track(self: &Arc<Self>, conn: BoxedStream, peer: SocketAddr) {
        let key = self.next_task.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        // Held across spawn so the task's own removal cannot run first.
        let mut active = lock(&self.active);
        // `close` flips the flag before draining under this lock.
        if *self.closed.borrow() {
            tracing::debug!(tunnel=%self.spec.id, client=%peer, "proxy: tunnel closing; dropping connection");
            return;
        }
        let task = tokio::spawn(async move {
            this.handle(conn, peer).await;
            lock(&this.active).remove(&key);
        });
        active.insert(key, task.abort_handle());
    }

    /// Stops accepting, closes the listener and aborts every tracked
    /// connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let ln = lock(&self.listener).take();
        if let Some(ln) = ln {
            if let Err(err) = ln.close().await {
                tracing::debug!(tunnel=%self.spec.id, err=%err, "proxy: listener close failed");
            }
        }
        let tasks: Vec<AbortHandle> = lock(&self.active).drain().map(|(_, h)| h).collect();
        for t in &tasks {
            t.abort();
        }
        tracing::info!(tunnel=%self.spec.id, aborted=tasks.len(), "proxy: tunnel closed");
    }

    async fn handle(&self, mut conn: BoxedStream, peer: SocketAddr) {
        let _active = ActiveConnGuard::new(&self.spec.id);

        let permit = match QuotaPermit::acquire(self.quota.clone(), &self.spec.client) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(tunnel=%self.spec.id, client=%peer, err=%err, "proxy: connection rejected");
                let _ = conn.shutdown().await;
                return;
            }
        };

        let cid = telemetry::new_conn_id();
        let _entry = ConnEntry {
            conns: &self.conns,
            id: &cid,
        };
        let res = match self.processor {
            Processor::TcpRelay => self.relay_tcp(conn, peer, &cid).await,
            Processor::HttpProxy => self.serve_http(conn, peer, &cid).await,
        };

        match res {
            Ok((ingress, egress)) => {
                permit.record_flow(ingress, egress);
                metrics::counter!("tunnelmux_bytes_ingress_total").increment(ingress);
                metrics::counter!("tunnelmux_bytes_egress_total").increment(egress);
            }
            Err(err) => {
                tracing::debug!(tunnel=%self.spec.id, cid=%cid, client=%peer, err=%err, "proxy: connection ended with error");
            }
        }
    }

    fn descriptor(&self, target: &str, peer: SocketAddr) -> LinkDescriptor {
        let mut desc = LinkDescriptor::tcp(target);
        desc.proxy_protocol = self.spec.proxy_protocol;
        desc.compress = self.spec.compress;
        desc.crypt = self.spec.crypt;
        desc.remote_addr = peer.to_string();
        desc
    }

    fn codec(&self) -> LinkCodec {
        LinkCodec::new(self.spec.compress, self.spec.crypt, &self.spec.vkey)
    }

    async fn open(&self, target: &str, peer: SocketAddr, cid: &str) -> anyhow::Result<BoxedStream> {
        let link = self
            .bridge
            .request_link(&self.spec.client, self.descriptor(target, peer))
            .await
            .with_context(|| format!("proxy: link to {target}"))?;
        self.conns.add(telemetry::ConnInfo {
            id: cid.to_string(),
            tunnel: self.spec.id.clone(),
            client: self.spec.client.clone(),
            peer: peer.to_string(),
            target: target.to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(tunnel=%self.spec.id, cid=%cid, client=%peer, addr=%target, "proxy: link opened");
        }
        Ok(link)
    }

    async fn relay_tcp(&self, conn: BoxedStream, peer: SocketAddr, cid: &str) -> anyhow::Result<(u64, u64)> {
        let target = pick_target(&self.spec.targets)?.to_string();
        let link = self.open(&target, peer, cid).await?;
        Ok(codec::pipe(conn, link, &self.codec(), Side::Initiator).await?)
    }

    async fn serve_http(&self, mut conn: BoxedStream, peer: SocketAddr, cid: &str) -> anyhow::Result<(u64, u64)> {
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let mut attempt = 0;
        let (req, head_len) = loop {
            attempt += 1;
            let head_len = tokio::time::timeout(self.spec.handshake_timeout, read_head(&mut conn, &mut buf))
                .await
                .context("proxy: request head timeout")??;
            let req = parse_request(&buf[..head_len])?;

            match self.check_auth(&req) {
                Ok(()) => break (req, head_len),
                Err(err) => {
                    conn.write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                          Proxy-Authenticate: Basic realm=\"tunnelmux\"\r\n\
                          Content-Length: 0\r\n\r\n",
                    )
                    .await?;
                    if attempt >= AUTH_ATTEMPTS {
                        return Err(err.into());
                    }
                    buf.drain(..head_len);
                    discard_body(&mut conn, &mut buf, req.content_length()).await?;
                }
            }
        };
        let rest = buf.split_off(head_len);

        if req.method.eq_ignore_ascii_case("CONNECT") {
            let target = req.uri.clone();
            let link = self.open(&target, peer, cid).await?;
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
            let plain = PeekedStream::new(rest, conn);
            return Ok(codec::pipe(plain, link, &self.codec(), Side::Initiator).await?);
        }

        let (target, path) = req.origin_target()?;
        let link = self.open(&target, peer, cid).await?;
        let mut head = req.rewrite(&path);
        head.extend_from_slice(&rest);
        let plain = PeekedStream::new(head, conn);
        Ok(codec::pipe(plain, link, &self.codec(), Side::Initiator).await?)
    }

    fn check_auth(&self, req: &Request) -> Result<(), ProxyError> {
        if self.spec.auth_user.is_empty() && self.spec.auth_password.is_empty() {
            return Ok(());
        }
        let creds = req
            .header("proxy-authorization")
            .and_then(|v| v.strip_prefix("Basic ").or_else(|| v.strip_prefix("basic ")))
            .and_then(|b| base64::engine::general_purpose::STANDARD.decode(b.trim()).ok())
            .and_then(|raw| String::from_utf8(raw).ok());
        match creds.as_deref().and_then(|c| c.split_once(':')) {
            Some((user, pass)) if user == self.spec.auth_user && pass == self.spec.auth_password => Ok(()),
            _ => Err(ProxyError::ProxyAuthRequired),
        }
    }
}

fn pick_target(targets: &[String]) -> Result<&str, ProxyError> {
    match targets.len() {
        0 => Err(ProxyError::NoTarget),
        1 => Ok(&targets[0]),
        n => Ok(&targets[rng().random_range(0..n)]),
    }
}

struct UdpFlow {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    last_seen_unix_ms: AtomicU64,
    task: AbortHandle,
}

impl UdpFlow {
    fn touch(&self) {
        self.last_seen_unix_ms
            .store(telemetry::now_unix_ms(), Ordering::Relaxed);
    }

    fn last_seen(&self) -> u64 {
        self.last_seen_unix_ms.load(Ordering::Relaxed)
    }
}

/// Public UDP port of one tunnel. Every source address gets its own `udp`
/// link, opened on its first datagram and released after `idle_timeout`
/// without traffic from that source.
pub struct UdpTunnel {
    spec: TunnelSpec,
    bridge: Arc<dyn Bridge>,
    quota: Arc<dyn QuotaOracle>,
    conns: telemetry::SharedConns,
    idle_timeout: Duration,
    flows: DashMap<SocketAddr, Arc<UdpFlow>>,
    next_flow: AtomicU64,
}

impl UdpTunnel {
    pub fn new(
        spec: TunnelSpec,
        bridge: Arc<dyn Bridge>,
        quota: Arc<dyn QuotaOracle>,
        conns: telemetry::SharedConns,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            bridge,
            quota,
            conns,
            idle_timeout,
            flows: DashMap::new(),
            next_flow: AtomicU64::new(1),
        })
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub async fn serve(self: Arc<Self>, sock: UdpSocket, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let sock = Arc::new(sock);
        tracing::info!(
            tunnel=%self.spec.id,
            client=%self.spec.client,
            addr=?sock.local_addr().ok(),
            "proxy: udp tunnel listening"
        );

        let mut buf = vec![0u8; UDP_BUF];
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => self.sweep_idle(),
                res = sock.recv_from(&mut buf) => {
                    let (n, peer) = res.with_context(|| format!("proxy: udp tunnel {} recv", self.spec.id))?;
                    self.dispatch(&sock, peer, &buf[..n]);
                }
            }
        }

        let flows: Vec<Arc<UdpFlow>> = self.flows.iter().map(|f| f.value().clone()).collect();
        self.flows.clear();
        for f in &flows {
            f.task.abort();
        }
        tracing::info!(tunnel=%self.spec.id, aborted=flows.len(), "proxy: udp tunnel closed");
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, sock: &Arc<UdpSocket>, peer: SocketAddr, payload: &[u8]) {
        let existing = self.flows.get(&peer).map(|f| f.value().clone());
        if let Some(flow) = existing {
            flow.touch();
            match flow.tx.try_send(payload.to_vec()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!("tunnelmux_udp_dropped_total", "tunnel" => self.spec.id.clone()).increment(1);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.flows.remove_if(&peer, |_, f| f.id == flow.id);
                }
            }
        }

        let Some(flow) = self.open_flow(sock, peer) else {
            return;
        };
        let _ = flow.tx.try_send(payload.to_vec());
        self.flows.insert(peer, flow);
    }

    fn open_flow(self: &Arc<Self>, sock: &Arc<UdpSocket>, peer: SocketAddr) -> Option<Arc<UdpFlow>> {
        let permit = match QuotaPermit::acquire(self.quota.clone(), &self.spec.client) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(tunnel=%self.spec.id, client=%peer, err=%err, "proxy: udp flow rejected");
                return None;
            }
        };
        let target = match pick_target(&self.spec.targets) {
            Ok(t) => t.to_string(),
            Err(err) => {
                tracing::warn!(tunnel=%self.spec.id, err=%err, "proxy: udp flow rejected");
                return None;
            }
        };

        let id = self.next_flow.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(UDP_FLOW_QUEUE);
        let this = self.clone();
        let sock = sock.clone();
        let task = tokio::spawn(async move {
            let _active = ActiveConnGuard::new(&this.spec.id);
            let cid = telemetry::new_conn_id();
            let _entry = ConnEntry {
                conns: &this.conns,
                id: &cid,
            };
            match this.run_flow(&sock, peer, &target, &cid, rx).await {
                Ok((ingress, egress)) => {
                    permit.record_flow(ingress, egress);
                    metrics::counter!("tunnelmux_bytes_ingress_total").increment(ingress);
                    metrics::counter!("tunnelmux_bytes_egress_total").increment(egress);
                }
                Err(err) => {
                    tracing::debug!(tunnel=%this.spec.id, cid=%cid, client=%peer, err=%err, "proxy: udp flow ended with error");
                }
            }
            this.flows.remove_if(&peer, |_, f| f.id == id);
        });

        Some(Arc::new(UdpFlow {
            id,
            tx,
            last_seen_unix_ms: AtomicU64::new(telemetry::now_unix_ms()),
            task: task.abort_handle(),
        }))
    }

    /// Relays one source address until its queue closes or the link ends.
    /// Returns `(ingress, egress)` payload bytes.
    async fn run_flow(
        &self,
        sock: &UdpSocket,
        peer: SocketAddr,
        target: &str,
        cid: &str,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) -> anyhow::Result<(u64, u64)> {
        let mut desc = LinkDescriptor::udp(target);
        desc.remote_addr = peer.to_string();
        let link = self
            .bridge
            .request_link(&self.spec.client, desc)
            .await
            .with_context(|| format!("proxy: udp link to {target}"))?;
        self.conns.add(telemetry::ConnInfo {
            id: cid.to_string(),
            tunnel: self.spec.id.clone(),
            client: self.spec.client.clone(),
            peer: peer.to_string(),
            target: target.to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });

        let (mut rd, mut wr) = tokio::io::split(link);
        let mut ingress = 0u64;
        let mut egress = 0u64;

        let upstream = async {
            while let Some(payload) = rx.recv().await {
                datagram::write_datagram(&mut wr, &payload).await?;
                ingress += payload.len() as u64;
            }
            Ok::<(), anyhow::Error>(())
        };
        let downstream = async {
            let mut buf = vec![0u8; UDP_BUF];
            loop {
                let n = match datagram::read_datagram(&mut rd, &mut buf).await {
                    Ok(n) => n,
                    Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(anyhow::Error::from(e)),
                };
                sock.send_to(&buf[..n], peer).await?;
                egress += n as u64;
            }
        };

        let res = tokio::select! {
            res = upstream => res,
            res = downstream => res,
        };
        res?;
        Ok((ingress, egress))
    }

    fn sweep_idle(&self) {
        let now = telemetry::now_unix_ms();
        let idle_ms = self.idle_timeout.as_millis() as u64;
        self.flows.retain(|peer, f| {
            let keep = now.saturating_sub(f.last_seen()) <= idle_ms;
            if !keep {
                tracing::debug!(tunnel=%self.spec.id, client=%peer, "proxy: udp flow idle");
            }
            keep
        });
    }
}

/// Reads until `buf` holds a complete request head; returns its length.
/// Bytes after the head stay in `buf`.
async fn read_head<R: AsyncRead + Unpin + ?Sized>(r: &mut R, buf: &mut Vec<u8>) -> anyhow::Result<usize> {
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(end);
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::HeadTooLarge.into());
        }
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            anyhow::bail!("proxy: connection closed before request head");
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

async fn discard_body<R: AsyncRead + Unpin + ?Sized>(r: &mut R, buf: &mut Vec<u8>, len: usize) -> anyhow::Result<()> {
    let buffered = len.min(buf.len());
    buf.drain(..buffered);
    let mut left = (len - buffered) as u64;
    if left > 0 {
        let copied = tokio::io::copy(&mut (&mut *r).take(left), &mut tokio::io::sink()).await?;
        left -= copied;
    }
    if left > 0 {
        anyhow::bail!("proxy: connection closed inside request body");
    }
    Ok(())
}

#[derive(Debug)]
struct Request {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
}

const HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authenticate", "proxy-authorization"];

fn parse_request(head: &[u8]) -> Result<Request, ProxyError> {
    let text = std::str::from_utf8(head).map_err(|_| ProxyError::BadRequest("non-utf8 head".into()))?;
    let mut lines = text.split("\r\n");
    let line = lines.next().unwrap_or("");
    let mut parts = line.split(' ');
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProxyError::BadRequest(format!("request line {line:?}")));
    };

    let mut headers = Vec::new();
    for l in lines.filter(|l| !l.is_empty()) {
        let Some((k, v)) = l.split_once(':') else {
            return Err(ProxyError::BadRequest(format!("header {l:?}")));
        };
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    Ok(Request {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
    })
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Target `host:port` and origin-form path of a non-CONNECT request.
    fn origin_target(&self) -> Result<(String, String), ProxyError> {
        let (authority, path) = match self.uri.strip_prefix("http://") {
            Some(rest) => match rest.find('/') {
                Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
                None => (rest.to_string(), "/".to_string()),
            },
            None => {
                let host = self
                    .header("host")
                    .ok_or_else(|| ProxyError::BadRequest("missing Host".into()))?;
                (host.to_string(), self.uri.clone())
            }
        };
        if authority.is_empty() {
            return Err(ProxyError::BadRequest("empty authority".into()));
        }
        let target = if has_port(&authority) {
            authority
        } else {
            format!("{authority}:80")
        };
        Ok((target, path))
    }

    fn rewrite(&self, path: &str) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, path, self.version);
        for (k, v) in &self.headers {
            if HOP_HEADERS.iter().any(|h| k.eq_ignore_ascii_case(h)) {
                continue;
            }
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn has_port(authority: &str) -> bool {
    let after = match authority.rfind(']') {
        Some(pos) => &authority[pos + 1..],
        None => authority,
    };
    after.contains(':')
}

/// Writes a PROXY protocol v2 header describing a `src -> dst` TCP
/// connection. Mixed or missing addresses are sent as `UNSPEC`.
pub(crate) async fn write_proxy_proto_v2<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
) -> anyhow::Result<()> {
    // Signature: "\r\n\r\n\0\r\nQUIT\n"
    const SIG: [u8; 12] = [13, 10, 13, 10, 0, 13, 10, 81, 85, 73, 84, 10];

    let mut out = Vec::with_capacity(16 + 36);
    out.extend_from_slice(&SIG);

    // ver=2 (0x2) | cmd=PROXY (0x1)
    out.push(0x21);

    match (src.map(net::canonical), dst.map(net::canonical)) {
        (Some(src), Some(dst)) => match (src.ip(), dst.ip()) {
            (IpAddr::V4(sip), IpAddr::V4(dip)) => {
                // fam=INET(0x1) | proto=STREAM(0x1)
                out.push(0x11);
                out.extend_from_slice(&12u16.to_be_bytes());
                out.extend_from_slice(&sip.octets());
                out.extend_from_slice(&dip.octets());
                out.extend_from_slice(&src.port().to_be_bytes());
                out.extend_from_slice(&dst.port().to_be_bytes());
            }
            (IpAddr::V6(sip), IpAddr::V6(dip)) => {
                // fam=INET6(0x2) | proto=STREAM(0x1)
                out.push(0x21);
                out.extend_from_slice(&36u16.to_be_bytes());
                out.extend_from_slice(&sip.octets());
                out.extend_from_slice(&dip.octets());
                out.extend_from_slice(&src.port().to_be_bytes());
                out.extend_from_slice(&dst.port().to_be_bytes());
            }
            _ => {
                out.push(0x00);
                out.extend_from_slice(&0u16.to_be_bytes());
            }
        },
        _ => {
            out.push(0x00);
            out.extend_from_slice(&0u16.to_be_bytes());
        }
    }

    w.write_all(&out).await.context("proxy: write pp2")?;
    w.flush().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelmux::{
        quota::{ClientLimits, ClientQuotas},
        tunnel::{bridge::BridgeError, transport::tcp::TcpTransportListener},
    };
    use async_trait::async_trait;
    use tokio::net::{TcpListener, TcpStream};

    /// Dials the descriptor's target directly instead of going through a client.
    struct DirectBridge;

    #[async_trait]
    impl Bridge for DirectBridge {
        async fn request_link(&self, _client_id: &str, desc: LinkDescriptor) -> Result<BoxedStream, BridgeError> {
            let c = TcpStream::connect(&desc.target)
                .await
                .map_err(|e| BridgeError::Handshake(e.into()))?;
            Ok(Box::new(c))
        }
    }

    async fn echo_server() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut c, _)) = ln.accept().await else { return };
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn spec(targets: Vec<String>) -> TunnelSpec {
        TunnelSpec {
            id: "t1".into(),
            client: "c1".into(),
            targets,
            handshake_timeout: Duration::from_secs(2),
            ..TunnelSpec::default()
        }
    }

    async fn start(
        spec: TunnelSpec,
        processor: Processor,
        quota: Arc<dyn QuotaOracle>,
    ) -> (Arc<TunnelServer>, SocketAddr, watch::Sender<bool>) {
        let srv = TunnelServer::new(
            spec,
            processor,
            Arc::new(DirectBridge),
            quota,
            Arc::new(telemetry::ConnRegistry::new()),
        );
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let s = srv.clone();
        tokio::spawn(async move { s.start(Box::new(TcpTransportListener::new(ln)), rx).await });
        (srv, addr, tx)
    }

    async fn echo_roundtrip(c: &mut TcpStream, msg: &[u8]) {
        c.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg);
    }

    #[tokio::test]
    async fn tcp_relay_reaches_target() {
        let target = echo_server().await;
        let (_srv, addr, _stop) = start(
            spec(vec![target.to_string()]),
            Processor::TcpRelay,
            Arc::new(ClientQuotas::default()),
        )
        .await;

        let mut c = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut c, b"relay me").await;
    }

    #[tokio::test]
    async fn connection_over_limit_is_rejected_and_others_survive() {
        let target = echo_server().await;
        let quota: Arc<dyn QuotaOracle> = Arc::new(ClientQuotas::new([(
            "c1",
            ClientLimits {
                max_conn: 1,
                flow_limit: 0,
            },
        )]));
        let (_srv, addr, _stop) = start(spec(vec![target.to_string()]), Processor::TcpRelay, quota).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut first, b"one").await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        echo_roundtrip(&mut first, b"still here").await;
    }

    #[tokio::test]
    async fn http_proxy_requires_auth_then_rewrites_request() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_addr = upstream.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (mut c, _) = upstream.accept().await.unwrap();
            let mut buf = Vec::new();
            let end = read_head(&mut c, &mut buf).await.unwrap();
            c.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            String::from_utf8(buf[..end].to_vec()).unwrap()
        });

        let mut s = spec(vec![]);
        s.auth_user = "u".into();
        s.auth_password = "p".into();
        let (_srv, addr, _stop) = start(s, Processor::HttpProxy, Arc::new(ClientQuotas::default())).await;

        let mut c = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET http://{up_addr}/x?y=1 HTTP/1.1\r\nHost: {up_addr}\r\nProxy-Connection: keep-alive\r\n");
        c.write_all(format!("{req}\r\n").as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let end = read_head(&mut c, &mut buf).await.unwrap();
        let resp = String::from_utf8_lossy(&buf[..end]).to_string();
        assert!(resp.starts_with("HTTP/1.1 407"), "{resp}");
        assert!(resp.contains("Proxy-Authenticate: Basic"), "{resp}");

        let token = base64::engine::general_purpose::STANDARD.encode("u:p");
        c.write_all(format!("{req}Proxy-Authorization: Basic {token}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut buf = Vec::new();
        let end = read_head(&mut c, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..end]).starts_with("HTTP/1.1 204"));

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /x?y=1 HTTP/1.1\r\n"), "{head}");
        assert!(head.contains(&format!("Host: {up_addr}")));
        assert!(!head.to_ascii_lowercase().contains("proxy-"), "{head}");
    }

    #[tokio::test]
    async fn http_connect_tunnels_raw_bytes() {
        let target = echo_server().await;
        let (_srv, addr, _stop) = start(spec(vec![]), Processor::HttpProxy, Arc::new(ClientQuotas::default())).await;

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\nearly").as_bytes())
            .await
            .unwrap();
        let mut buf = Vec::new();
        let end = read_head(&mut c, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..end]).starts_with("HTTP/1.1 200"));

        let mut rest = buf.split_off(end);
        while rest.len() < 5 {
            let mut b = [0u8; 16];
            let n = c.read(&mut b).await.unwrap();
            assert!(n > 0);
            rest.extend_from_slice(&b[..n]);
        }
        assert_eq!(&rest, b"early");
        echo_roundtrip(&mut c, b"raw bytes").await;
    }

    #[tokio::test]
    async fn close_aborts_connections_and_is_idempotent() {
        let target = echo_server().await;
        let (srv, addr, _stop) = start(
            spec(vec![target.to_string()]),
            Processor::TcpRelay,
            Arc::new(ClientQuotas::default()),
        )
        .await;

        let mut c = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut c, b"hi").await;
        assert_eq!(srv.active_count(), 1);

        srv.close().await;
        srv.close().await;
        assert_eq!(srv.active_count(), 0);

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn connection_handed_over_after_close_is_not_tracked() {
        let target = echo_server().await;
        let (srv, _addr, _stop) = start(
            spec(vec![target.to_string()]),
            Processor::TcpRelay,
            Arc::new(ClientQuotas::default()),
        )
        .await;
        srv.close().await;

        // A connection the accept loop already pulled when close ran.
        let side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut c = TcpStream::connect(side.local_addr().unwrap()).await.unwrap();
        let (late, peer) = side.accept().await.unwrap();
        srv.track(Box::new(late), peer);
        assert_eq!(srv.active_count(), 0);

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    /// Plays the client end of `udp` links: datagrams go to the descriptor's
    /// target from a fresh socket.
    struct UdpRelayBridge;

    #[async_trait]
    impl Bridge for UdpRelayBridge {
        async fn request_link(&self, _client_id: &str, desc: LinkDescriptor) -> Result<BoxedStream, BridgeError> {
            let sock = UdpSocket::bind("127.0.0.1:0")
                .await
                .map_err(|e| BridgeError::Handshake(e.into()))?;
            sock.connect(&desc.target)
                .await
                .map_err(|e| BridgeError::Handshake(e.into()))?;
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let _ = datagram::relay_udp(theirs, sock).await;
            });
            Ok(Box::new(ours))
        }
    }

    async fn udp_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn udp_roundtrip(c: &UdpSocket, msg: &[u8]) {
        c.send(msg).await.unwrap();
        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(2), c.recv(&mut buf))
            .await
            .expect("udp reply")
            .unwrap();
        assert_eq!(&buf[..n], msg);
    }

    #[tokio::test]
    async fn udp_tunnel_keeps_one_flow_per_source_and_forgets_idle_ones() {
        let target = udp_echo().await;
        let tunnel = UdpTunnel::new(
            spec(vec![target.to_string()]),
            Arc::new(UdpRelayBridge),
            Arc::new(ClientQuotas::default()),
            Arc::new(telemetry::ConnRegistry::new()),
            Duration::from_secs(1),
        );
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let (_stop, rx) = watch::channel(false);
        tokio::spawn(tunnel.clone().serve(sock, rx));

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(addr).await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        b.connect(addr).await.unwrap();

        udp_roundtrip(&a, b"first").await;
        udp_roundtrip(&a, b"second").await;
        udp_roundtrip(&b, b"other source").await;
        assert_eq!(tunnel.flow_count(), 2);

        tokio::time::timeout(Duration::from_secs(5), async {
            while tunnel.flow_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("idle flows are dropped");

        udp_roundtrip(&a, b"again").await;
        assert_eq!(tunnel.flow_count(), 1);
    }

    #[tokio::test]
    async fn udp_flow_over_limit_gets_no_link() {
        let target = udp_echo().await;
        let quota: Arc<dyn QuotaOracle> = Arc::new(ClientQuotas::new([(
            "c1",
            ClientLimits {
                max_conn: 1,
                flow_limit: 0,
            },
        )]));
        let tunnel = UdpTunnel::new(
            spec(vec![target.to_string()]),
            Arc::new(UdpRelayBridge),
            quota,
            Arc::new(telemetry::ConnRegistry::new()),
            Duration::from_secs(30),
        );
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let (_stop, rx) = watch::channel(false);
        tokio::spawn(tunnel.clone().serve(sock, rx));

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(addr).await.unwrap();
        udp_roundtrip(&a, b"admitted").await;

        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        b.connect(addr).await.unwrap();
        b.send(b"refused").await.unwrap();
        let mut buf = [0u8; 64];
        assert!(
            tokio::time::timeout(Duration::from_millis(300), b.recv(&mut buf))
                .await
                .is_err()
        );
        assert_eq!(tunnel.flow_count(), 1);
        udp_roundtrip(&a, b"still admitted").await;
    }

    #[tokio::test]
    async fn proxy_header_encodes_v4_and_falls_back_to_unspec() {
        let mut out = Vec::new();
        let src: SocketAddr = "[::ffff:10.0.0.1]:1234".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:80".parse().unwrap();
        write_proxy_proto_v2(&mut out, Some(src), Some(dst)).await.unwrap();
        assert_eq!(out.len(), 16 + 12);
        assert_eq!(out[13], 0x11);
        assert_eq!(&out[16..20], &[10, 0, 0, 1]);
        assert_eq!(&out[24..26], &1234u16.to_be_bytes());

        let mut out = Vec::new();
        write_proxy_proto_v2(&mut out, None, Some(dst)).await.unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(out[13], 0x00);
    }
}
