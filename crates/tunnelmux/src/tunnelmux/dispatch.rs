//! Single-port protocol dispatch.
//!
//! When several services share one TCP port, [`PortDispatcher`] peeks at the
//! first bytes of every connection, decides which service it belongs to and
//! hands it to that service's [`VirtualListener`] as a [`PeekedStream`] that
//! replays the peeked bytes.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::TcpListener,
    sync::{Mutex, mpsc, watch},
};

use crate::tunnelmux::tunnel::{
    protocol::MAGIC_BRIDGE,
    transport::{BoxedStream, TransportListener},
};

pub const MAX_PEEK_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnClass {
    BridgeControl,
    BridgeTls,
    BridgeWs,
    BridgeWss,
    HttpProxy,
    HttpsProxy,
    Manager,
}

impl ConnClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnClass::BridgeControl => "bridge",
            ConnClass::BridgeTls => "bridge_tls",
            ConnClass::BridgeWs => "bridge_ws",
            ConnClass::BridgeWss => "bridge_wss",
            ConnClass::HttpProxy => "http_proxy",
            ConnClass::HttpsProxy => "https_proxy",
            ConnClass::Manager => "manager",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    ClassificationTimeout,
    UnknownProtocol,
    NoListener,
}

impl DispatchEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchEvent::ClassificationTimeout => "classification_timeout",
            DispatchEvent::UnknownProtocol => "unknown_protocol",
            DispatchEvent::NoListener => "no_listener",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRules {
    /// SNI of TLS bridge connections.
    pub bridge_host: String,
    /// Request path of WebSocket bridge upgrades.
    pub bridge_path: String,
    /// Host (HTTP `Host` or TLS SNI) of the management server.
    pub web_host: String,
    pub timeout: Duration,
    pub max_peek: usize,
    pub backlog: usize,
}

impl Default for DispatchRules {
    fn default() -> Self {
        Self {
            bridge_host: String::new(),
            bridge_path: "/ws".into(),
            web_host: String::new(),
            timeout: Duration::from_secs(5),
            max_peek: MAX_PEEK_BYTES,
            backlog: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Matched(ConnClass),
    NeedMore,
    NoMatch,
}

/// Classifies a connection from its first bytes. `full` is set once the peek
/// budget is exhausted; partial heads are then judged on what is available.
pub fn classify_prefix(buf: &[u8], rules: &DispatchRules, full: bool) -> Classification {
    if buf.is_empty() {
        return Classification::NeedMore;
    }

    let n = buf.len().min(MAGIC_BRIDGE.len());
    if buf[..n] == MAGIC_BRIDGE[..n] {
        return if n == MAGIC_BRIDGE.len() {
            Classification::Matched(ConnClass::BridgeControl)
        } else {
            Classification::NeedMore
        };
    }

    if buf[0] == 0x16 {
        return classify_tls(buf, rules, full);
    }

    classify_http(buf, rules, full)
}

fn host_eq(host: &str, want: &str) -> bool {
    !want.is_empty() && host.eq_ignore_ascii_case(want.trim())
}

fn classify_tls(buf: &[u8], rules: &DispatchRules, full: bool) -> Classification {
    if buf.len() >= 2 && buf[1] != 0x03 {
        return Classification::NoMatch;
    }
    let hello = match parse_client_hello(buf) {
        TlsParse::Hello(h) => h,
        TlsParse::NeedMore if !full => return Classification::NeedMore,
        TlsParse::NeedMore => ClientHelloInfo::default(),
        TlsParse::Invalid => return Classification::NoMatch,
    };

    let sni = hello.sni.as_deref().unwrap_or("");
    let class = if host_eq(sni, &rules.bridge_host) {
        if hello.alpn.iter().any(|p| p == "http/1.1") {
            ConnClass::BridgeWss
        } else {
            ConnClass::BridgeTls
        }
    } else if host_eq(sni, &rules.web_host) {
        ConnClass::Manager
    } else {
        ConnClass::HttpsProxy
    };
    Classification::Matched(class)
}

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

fn classify_http(buf: &[u8], rules: &DispatchRules, full: bool) -> Classification {
    let method = HTTP_METHODS.iter().find(|m| {
        let tok = m.as_bytes();
        buf.len() > tok.len() && buf.starts_with(tok) && buf[tok.len()] == b' '
    });
    if method.is_none() {
        let partial = HTTP_METHODS.iter().any(|m| {
            let tok = m.as_bytes();
            buf.len() <= tok.len() && tok.starts_with(buf)
        });
        return if partial && !full {
            Classification::NeedMore
        } else {
            Classification::NoMatch
        };
    }

    let Some(end) = find_head_end(buf) else {
        return if full {
            Classification::Matched(ConnClass::HttpProxy)
        } else {
            Classification::NeedMore
        };
    };

    let head = String::from_utf8_lossy(&buf[..end]);
    let mut lines = head.split("\r\n");
    let path = lines
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .unwrap_or("")
        .to_string();

    let mut host = "";
    let mut upgrade_ws = false;
    for line in lines {
        let Some((k, v)) = line.split_once(':') else { continue };
        let v = v.trim();
        if k.trim().eq_ignore_ascii_case("host") {
            host = v;
        } else if k.trim().eq_ignore_ascii_case("upgrade") {
            upgrade_ws = v.eq_ignore_ascii_case("websocket");
        }
    }
    let host = strip_port(host);

    if host_eq(host, &rules.web_host) {
        Classification::Matched(ConnClass::Manager)
    } else if upgrade_ws && path == rules.bridge_path {
        Classification::Matched(ConnClass::BridgeWs)
    } else {
        Classification::Matched(ConnClass::HttpProxy)
    }
}

pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

#[derive(Debug, Default)]
struct ClientHelloInfo {
    sni: Option<String>,
    alpn: Vec<String>,
}

enum TlsParse {
    NeedMore,
    Hello(ClientHelloInfo),
    Invalid,
}

struct Cursor<'a> {
    b: &'a [u8],
    i: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.b.get(self.i..self.i.checked_add(n)?)?;
        self.i += n;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

/// Parses SNI and ALPN out of the ClientHello in the first TLS record.
fn parse_client_hello(buf: &[u8]) -> TlsParse {
    if buf.len() < 5 {
        return TlsParse::NeedMore;
    }
    let rec_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let Some(frag) = buf.get(5..5 + rec_len) else {
        return TlsParse::NeedMore;
    };
    match parse_hello_fragment(frag) {
        Some(h) => TlsParse::Hello(h),
        None => TlsParse::Invalid,
    }
}

fn parse_hello_fragment(frag: &[u8]) -> Option<ClientHelloInfo> {
    let mut c = Cursor { b: frag, i: 0 };
    if c.u8()? != 0x01 {
        return None;
    }
    let _len = c.u24()?;
    c.take(2 + 32)?;
    let sid = c.u8()? as usize;
    c.take(sid)?;
    let suites = c.u16()? as usize;
    c.take(suites)?;
    let comp = c.u8()? as usize;
    c.take(comp)?;

    let mut info = ClientHelloInfo::default();
    let Some(ext_len) = c.u16() else {
        return Some(info);
    };
    let mut ext = Cursor {
        b: c.take(ext_len as usize)?,
        i: 0,
    };
    while let Some(kind) = ext.u16() {
        let len = ext.u16()? as usize;
        let mut body = Cursor { b: ext.take(len)?, i: 0 };
        match kind {
            0x0000 => {
                let list_len = body.u16()? as usize;
                let mut list = Cursor {
                    b: body.take(list_len)?,
                    i: 0,
                };
                while let Some(name_type) = list.u8() {
                    let n = list.u16()? as usize;
                    let name = list.take(n)?;
                    if name_type == 0 {
                        info.sni = Some(String::from_utf8_lossy(name).into_owned());
                    }
                }
            }
            0x0010 => {
                let list_len = body.u16()? as usize;
                let mut list = Cursor {
                    b: body.take(list_len)?,
                    i: 0,
                };
                while let Some(n) = list.u8() {
                    info.alpn.push(String::from_utf8_lossy(list.take(n as usize)?).into_owned());
                }
            }
            _ => {}
        }
    }
    Some(info)
}

pin_project! {
    /// A stream that yields `prefix` before reading from `inner`.
    pub struct PeekedStream<S> {
        prefix: Vec<u8>,
        pos: usize,
        #[pin]
        inner: S,
    }
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PeekedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.pos < this.prefix.len() {
            let rest = &this.prefix[*this.pos..];
            let n = rest.len().min(buf.remaining());
            buf.put_slice(&rest[..n]);
            *this.pos += n;
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PeekedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

type Handoff = (BoxedStream, SocketAddr);

/// Receives the connections the dispatcher classified into one class.
pub struct VirtualListener {
    class: ConnClass,
    rx: Mutex<mpsc::Receiver<Handoff>>,
    local: Arc<OnceLock<SocketAddr>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl TransportListener for VirtualListener {
    async fn accept(&self) -> anyhow::Result<Handoff> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            anyhow::bail!("dispatch: {} listener closed", self.class.as_str());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            next = rx.recv() => next.ok_or_else(|| anyhow::anyhow!("dispatch: dispatcher stopped")),
            _ = closed.wait_for(|c| *c) => anyhow::bail!("dispatch: {} listener closed", self.class.as_str()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local.get().copied()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.send_replace(true);
        // Refuse further handoffs; queued ones are dropped with the receiver's buffer.
        let mut rx = self.rx.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {}
        Ok(())
    }
}

impl axum::serve::Listener for VirtualListener {
    type Io = BoxedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match TransportListener::accept(&*self).await {
            Ok(v) => v,
            // axum expects accept to keep going; a closed listener just idles.
            Err(_) => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.local
            .get()
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "dispatcher not serving"))
    }
}

/// Classifies connections accepted on one port and routes them to the
/// registered virtual listeners.
pub struct PortDispatcher {
    rules: DispatchRules,
    routes: std::sync::Mutex<HashMap<ConnClass, mpsc::Sender<Handoff>>>,
    local: Arc<OnceLock<SocketAddr>>,
}

impl PortDispatcher {
    pub fn new(rules: DispatchRules) -> Arc<Self> {
        Arc::new(Self {
            rules,
            routes: std::sync::Mutex::new(HashMap::new()),
            local: Arc::new(OnceLock::new()),
        })
    }

    /// Registers the listener for `class`, replacing an earlier one.
    pub fn listener(&self, class: ConnClass) -> VirtualListener {
        let (tx, rx) = mpsc::channel(self.rules.backlog.max(1));
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(class, tx);
        let (closed, _) = watch::channel(false);
        VirtualListener {
            class,
            rx: Mutex::new(rx),
            local: self.local.clone(),
            closed,
        }
    }

    fn route(&self, class: ConnClass) -> Option<mpsc::Sender<Handoff>> {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&class)
            .cloned()
    }

    pub async fn serve(self: Arc<Self>, ln: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if let Ok(addr) = ln.local_addr() {
            let _ = self.local.set(addr);
            tracing::info!(addr=%addr, "dispatch: listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = res?;
                    let _ = conn.set_nodelay(true);
                    let this = self.clone();
                    tokio::spawn(async move { this.dispatch(conn, peer).await });
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, mut conn: tokio::net::TcpStream, peer: SocketAddr) {
        let max = self.rules.max_peek.max(16);
        let mut captured: Vec<u8> = Vec::with_capacity(max.min(4096));
        let mut tmp = vec![0u8; max];

        let read_fut = async {
            loop {
                let n = conn.read(&mut tmp[..max - captured.len()]).await?;
                if n == 0 {
                    return Ok::<Option<ConnClass>, io::Error>(None);
                }
                captured.extend_from_slice(&tmp[..n]);

                let full = captured.len() >= max;
                match classify_prefix(&captured, &self.rules, full) {
                    Classification::Matched(c) => return Ok(Some(c)),
                    Classification::NoMatch => return Ok(None),
                    Classification::NeedMore if full => return Ok(None),
                    Classification::NeedMore => continue,
                }
            }
        };

        let class = match tokio::time::timeout(self.rules.timeout, read_fut).await {
            Ok(Ok(Some(c))) => c,
            Ok(Ok(None)) => return self.event(DispatchEvent::UnknownProtocol, peer, None),
            Ok(Err(err)) => {
                tracing::debug!(client=%peer, err=%err, "dispatch: read failed");
                return;
            }
            Err(_) => return self.event(DispatchEvent::ClassificationTimeout, peer, None),
        };

        let Some(tx) = self.route(class) else {
            return self.event(DispatchEvent::NoListener, peer, Some(class));
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(client=%peer, class=class.as_str(), peeked=captured.len(), "dispatch: classified");
        }
        metrics::counter!("tunnelmux_dispatch_total", "class" => class.as_str()).increment(1);

        let stream: BoxedStream = Box::new(PeekedStream::new(captured, conn));
        // Blocks while the consumer's backlog is full.
        if tx.send((stream, peer)).await.is_err() {
            self.event(DispatchEvent::NoListener, peer, Some(class));
        }
    }

    fn event(&self, ev: DispatchEvent, peer: SocketAddr, class: Option<ConnClass>) {
        metrics::counter!("tunnelmux_dispatch_events_total", "event" => ev.as_str()).increment(1);
        match ev {
            DispatchEvent::NoListener => {
                tracing::warn!(client=%peer, class=class.map(|c| c.as_str()).unwrap_or(""), "dispatch: no listener for class")
            }
            _ => tracing::debug!(client=%peer, event=ev.as_str(), "dispatch: connection dropped"),
        }
    }
}
