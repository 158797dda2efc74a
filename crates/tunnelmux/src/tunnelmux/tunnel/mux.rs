//! Stream multiplexing over a single physical connection.
//!
//! A [`MuxSession`] owns one reliable byte channel and carries any number of
//! [`MuxStream`]s over it using the frames from [`super::frame`]. The dialing
//! side allocates odd stream ids, the accepting side even ids; ids only grow
//! and are never reused within a session.
//!
//! Every stream starts with [`INITIAL_WINDOW`] bytes of credit in each
//! direction. Readers hand credit back with `WindowUpdate` frames once half of
//! the window has been consumed, so a slow consumer bounds the memory a fast
//! producer can pin on the remote side.
//!
//! The writer queue only carries `Open`, `Data` and `Close`, all produced
//! locally and bounded by credit. `Ping`, `Pong` and `WindowUpdate` are
//! coalesced in a control slot the writer drains before each batch.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};

use crate::tunnelmux::tunnel::frame::{Frame, FrameError, FrameType};

pub const INITIAL_WINDOW: u32 = 256 * 1024;

const MAX_DATA_CHUNK: usize = 16 * 1024;
const WRITE_BATCH_BYTES: usize = 64 * 1024;
/// How long a closing session keeps writing frames queued before the close.
const CLOSE_FLUSH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between keepalive pings while pings are due.
    pub keepalive_interval: Duration,
    /// Tear the session down after this long without any frame while no
    /// stream is open. `None` keeps the session up and pings continuously.
    pub idle_timeout: Option<Duration>,
    /// Tear the session down when pings are due but nothing arrived for this long.
    pub dead_peer_timeout: Option<Duration>,
    /// Remotely opened streams queued for `accept`. Opens beyond this are reset.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            idle_timeout: None,
            dead_peer_timeout: Some(Duration::from_secs(60)),
            accept_backlog: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_local_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn is_remote_id(self, id: u32) -> bool {
        match self {
            Role::Client => id != 0 && id % 2 == 0,
            Role::Server => id % 2 == 1,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("fatal protocol error: {0}")]
    FatalProtocol(String),
    #[error("session closed: {0}")]
    Closed(String),
    #[error("stream ids exhausted")]
    IdsExhausted,
}

impl From<FrameError> for MuxError {
    fn from(e: FrameError) -> Self {
        MuxError::FatalProtocol(e.to_string())
    }
}

impl From<MuxError> for io::Error {
    fn from(e: MuxError) -> Self {
        io::Error::new(io::ErrorKind::ConnectionAborted, e)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn next_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    format!("m{}", SEQ.fetch_add(1, Ordering::Relaxed))
}

struct SessionState {
    next_local_id: u32,
    last_remote_id: u32,
    streams: HashMap<u32, Arc<StreamShared>>,
    accept_tx: Option<mpsc::Sender<MuxStream>>,
    close_reason: Option<String>,
    last_frame: Instant,
}

/// Pending control frames. Only the latest ping and pong matter; window
/// credit for the same stream adds up.
#[derive(Default)]
struct Control {
    ping: Option<u64>,
    pong: Option<u64>,
    window: HashMap<u32, u32>,
}

impl Control {
    fn is_empty(&self) -> bool {
        self.ping.is_none() && self.pong.is_none() && self.window.is_empty()
    }
}

struct Shared {
    id: String,
    role: Role,
    cfg: MuxConfig,
    remote_addr: Option<SocketAddr>,
    out_tx: mpsc::UnboundedSender<Frame>,
    control: Mutex<Control>,
    control_ready: Notify,
    state: Mutex<SessionState>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    closed_tx: watch::Sender<bool>,
    /// Reader and keepalive. The writer exits on its own once closed.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn queue_ping(&self, nonce: u64) {
        lock(&self.control).ping = Some(nonce);
        self.control_ready.notify_one();
    }

    fn queue_pong(&self, nonce: u64) {
        lock(&self.control).pong = Some(nonce);
        self.control_ready.notify_one();
    }

    fn queue_window_update(&self, id: u32, delta: u32) {
        {
            let mut ctl = lock(&self.control);
            let credit = ctl.window.entry(id).or_insert(0);
            *credit = credit.saturating_add(delta);
        }
        self.control_ready.notify_one();
    }

    fn take_control(&self, batch: &mut BytesMut) {
        let ctl = std::mem::take(&mut *lock(&self.control));
        if ctl.is_empty() {
            return;
        }
        if let Some(nonce) = ctl.pong {
            Frame::pong(nonce).encode_into(batch);
        }
        if let Some(nonce) = ctl.ping {
            Frame::ping(nonce).encode_into(batch);
        }
        for (id, delta) in ctl.window {
            Frame::window_update(id, delta).encode_into(batch);
        }
    }

    /// Tears the session down. Streams keep what they buffered unless
    /// `discard` is set; frames already queued are still flushed.
    fn close_with(&self, reason: &str, discard: bool) {
        let (streams, accept_tx) = {
            let mut st = lock(&self.state);
            if st.close_reason.is_some() {
                return;
            }
            st.close_reason = Some(reason.to_string());
            (std::mem::take(&mut st.streams), st.accept_tx.take())
        };
        drop(accept_tx);

        for s in streams.values() {
            s.fail(reason, discard);
        }

        let _ = self.closed_tx.send(true);
        metrics::gauge!("tunnelmux_mux_sessions_active").decrement(1.0);
        tracing::debug!(session = %self.id, streams = streams.len(), reason = %reason, "mux: session closed");

        if let Ok(mut rx) = self.accept_rx.try_lock() {
            rx.close();
            while let Ok(s) = rx.try_recv() {
                drop(s);
            }
        }

        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
    }

    fn close_reason(&self) -> String {
        lock(&self.state)
            .close_reason
            .clone()
            .unwrap_or_else(|| "closed".into())
    }

    fn is_retired(&self, st: &SessionState, id: u32) -> bool {
        if self.role.is_remote_id(id) {
            id <= st.last_remote_id
        } else {
            id != 0 && id < st.next_local_id
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        let id = frame.stream_id;
        let mut st = lock(&self.state);
        st.last_frame = Instant::now();

        match frame.kind {
            FrameType::Open => {
                if !self.role.is_remote_id(id) {
                    return Err(MuxError::FatalProtocol(format!(
                        "stream {id} opened with the wrong parity"
                    )));
                }
                if id <= st.last_remote_id {
                    return Err(MuxError::FatalProtocol(format!(
                        "stream id {id} reused (last opened {})",
                        st.last_remote_id
                    )));
                }
                st.last_remote_id = id;

                let Some(tx) = st.accept_tx.clone() else {
                    return Ok(());
                };
                let shared = Arc::new(StreamShared::new(id));
                st.streams.insert(id, shared.clone());
                drop(st);

                let stream = MuxStream::new(shared, self);
                if let Err(err) = tx.try_send(stream) {
                    tracing::warn!(session = %self.id, stream = id, "mux: accept backlog full; resetting stream");
                    drop(err);
                }
                Ok(())
            }
            FrameType::Data => {
                let found = st.streams.get(&id).cloned();
                match found {
                    Some(s) => {
                        drop(st);
                        s.push(frame.payload)
                    }
                    None if self.is_retired(&st, id) => Ok(()),
                    None => Err(MuxError::FatalProtocol(format!(
                        "data for unopened stream {id}"
                    ))),
                }
            }
            FrameType::WindowUpdate => {
                let delta = frame
                    .window_delta()
                    .ok_or_else(|| MuxError::FatalProtocol("bad window update".into()))?;
                let found = st.streams.get(&id).cloned();
                match found {
                    Some(s) => {
                        drop(st);
                        s.add_credit(delta);
                        Ok(())
                    }
                    None if self.is_retired(&st, id) => Ok(()),
                    None => Err(MuxError::FatalProtocol(format!(
                        "window update for unopened stream {id}"
                    ))),
                }
            }
            FrameType::Close => {
                let found = st.streams.get(&id).cloned();
                if let Some(s) = found {
                    drop(st);
                    s.remote_close();
                }
                Ok(())
            }
            FrameType::Ping => {
                drop(st);
                self.queue_pong(frame.nonce());
                Ok(())
            }
            FrameType::Pong => Ok(()),
        }
    }
}

/// One multiplexed session. Dropping it closes the session.
pub struct MuxSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish_non_exhaustive()
    }
}

impl MuxSession {
    pub fn client<S>(conn: S, cfg: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(conn, Role::Client, cfg, None)
    }

    pub fn server<S>(conn: S, cfg: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(conn, Role::Server, cfg, None)
    }

    pub fn new<S>(conn: S, role: Role, cfg: MuxConfig, remote_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_backlog.max(1));
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: next_session_id(),
            role,
            cfg,
            remote_addr,
            out_tx,
            control: Mutex::new(Control::default()),
            control_ready: Notify::new(),
            state: Mutex::new(SessionState {
                next_local_id: role.first_local_id(),
                last_remote_id: 0,
                streams: HashMap::new(),
                accept_tx: Some(accept_tx),
                close_reason: None,
                last_frame: Instant::now(),
            }),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        });

        metrics::gauge!("tunnelmux_mux_sessions_active").increment(1.0);

        // Preface: lets the peer see traffic before any stream exists.
        shared.queue_ping(0);

        let (rd, wr) = tokio::io::split(conn);
        tokio::spawn(write_loop(shared.clone(), wr, out_rx));
        let tasks = [
            tokio::spawn(read_loop(shared.clone(), rd)),
            tokio::spawn(keepalive_loop(shared.clone())),
        ];
        {
            let mut held = lock(&shared.tasks);
            held.extend(tasks);
            // The reader may have closed the session before the handles landed.
            if *shared.closed_tx.borrow() {
                for t in held.drain(..) {
                    t.abort();
                }
            }
        }

        tracing::debug!(session = %shared.id, role = ?role, "mux: session started");
        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    /// Opens a new stream. The remote is not waited for; the stream can be
    /// written to immediately within the initial window.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let mut st = lock(&self.shared.state);
        if let Some(reason) = &st.close_reason {
            return Err(MuxError::Closed(reason.clone()));
        }

        let id = st.next_local_id;
        st.next_local_id = id.checked_add(2).ok_or(MuxError::IdsExhausted)?;

        let shared = Arc::new(StreamShared::new(id));
        st.streams.insert(id, shared.clone());
        // Queued under the table lock so Open frames leave in allocation order.
        if self.shared.out_tx.send(Frame::open(id)).is_err() {
            st.streams.remove(&id);
            return Err(MuxError::Closed("writer gone".into()));
        }
        drop(st);

        Ok(MuxStream::new(shared, &self.shared))
    }

    /// Waits for the next remotely opened stream.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        let mut rx = self.shared.accept_rx.lock().await;
        match rx.recv().await {
            Some(s) => Ok(s),
            None => Err(MuxError::Closed(self.shared.close_reason())),
        }
    }

    pub fn close(&self) {
        self.shared.close_with("closed locally", false);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).close_reason.is_some()
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.shared.state).streams.len()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.close_with("session dropped", false);
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut rd: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(64 * 1024);

    let reason = 'outer: loop {
        loop {
            match Frame::decode(&buf) {
                Ok((frame, used)) => {
                    buf.advance(used);
                    if let Err(err) = shared.handle_frame(frame) {
                        break 'outer err;
                    }
                }
                Err(FrameError::Malformed { .. }) => break,
                Err(err) => break 'outer err.into(),
            }
        }

        match rd.read_buf(&mut buf).await {
            Ok(0) => {
                // A clean close ends every stream like a `Close` frame would.
                let streams: Vec<_> = lock(&shared.state).streams.values().cloned().collect();
                for s in streams {
                    s.remote_close();
                }
                break MuxError::Closed("peer closed the connection".into());
            }
            Ok(_) => {}
            Err(err) => break MuxError::Closed(format!("read: {err}")),
        }
    };

    let discard = matches!(reason, MuxError::FatalProtocol(_));
    if let MuxError::FatalProtocol(msg) = &reason {
        metrics::counter!("tunnelmux_mux_protocol_errors_total").increment(1);
        tracing::warn!(session = %shared.id, err = %msg, "mux: protocol violation; closing session");
    }
    shared.close_with(&reason.to_string(), discard);
}

async fn session_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

/// Resolves `CLOSE_FLUSH` after the session closed.
async fn flush_deadline(rx: &mut watch::Receiver<bool>) {
    session_closed(rx).await;
    tokio::time::sleep(CLOSE_FLUSH).await;
}

async fn write_batch<W>(wr: &mut W, batch: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(batch).await?;
    wr.flush().await
}

async fn write_loop<W>(shared: Arc<Shared>, mut wr: W, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.closed_tx.subscribe();
    let mut batch = BytesMut::with_capacity(WRITE_BATCH_BYTES);

    let reason = loop {
        let closing = tokio::select! {
            biased;
            _ = shared.control_ready.notified() => false,
            f = rx.recv() => match f {
                Some(f) => {
                    f.encode_into(&mut batch);
                    false
                }
                None => break "writer channel closed".to_string(),
            },
            _ = session_closed(&mut closed) => true,
        };

        shared.take_control(&mut batch);
        while closing || batch.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(f) => f.encode_into(&mut batch),
                Err(_) => break,
            }
        }

        if closing {
            let _ = tokio::time::timeout(CLOSE_FLUSH, async {
                write_batch(&mut wr, &batch).await?;
                wr.shutdown().await
            })
            .await;
            return;
        }

        let written = tokio::select! {
            res = write_batch(&mut wr, &batch) => res,
            _ = flush_deadline(&mut closed) => Err(io::Error::new(io::ErrorKind::TimedOut, "close flush timed out")),
        };
        if let Err(err) = written {
            break format!("write: {err}");
        }
        batch.clear();
    };

    let _ = tokio::time::timeout(CLOSE_FLUSH, wr.shutdown()).await;
    shared.close_with(&reason, false);
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let cfg = shared.cfg.clone();

    let mut tick = cfg.keepalive_interval;
    if let Some(idle) = cfg.idle_timeout {
        tick = tick.min(idle / 4);
    }
    if let Some(dead) = cfg.dead_peer_timeout {
        tick = tick.min(dead / 4);
    }
    let tick = tick.max(Duration::from_millis(10));

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_ping = Instant::now();
    let mut nonce: u64 = 0;

    loop {
        ticker.tick().await;

        let (streams, quiet_for) = {
            let st = lock(&shared.state);
            if st.close_reason.is_some() {
                return;
            }
            (st.streams.len(), st.last_frame.elapsed())
        };

        if streams == 0 {
            if let Some(idle) = cfg.idle_timeout {
                if quiet_for >= idle {
                    shared.close_with("idle timeout", false);
                    return;
                }
                continue;
            }
        }

        if let Some(dead) = cfg.dead_peer_timeout {
            if quiet_for >= dead {
                shared.close_with("keepalive timeout", false);
                return;
            }
        }

        if last_ping.elapsed() >= cfg.keepalive_interval {
            nonce = nonce.wrapping_add(1);
            last_ping = Instant::now();
            shared.queue_ping(nonce);
        }
    }
}

struct StreamState {
    buf: BytesMut,
    /// Bytes the peer may still send before it needs a window update.
    recv_credit: u32,
    /// Bytes handed to the reader since the last window update.
    unacked: u32,
    send_credit: u32,
    remote_closed: bool,
    local_closed: bool,
    error: Option<String>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
}

impl StreamShared {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState {
                buf: BytesMut::new(),
                recv_credit: INITIAL_WINDOW,
                unacked: 0,
                send_credit: INITIAL_WINDOW,
                remote_closed: false,
                local_closed: false,
                error: None,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    fn push(&self, payload: Bytes) -> Result<(), MuxError> {
        let mut st = lock(&self.state);
        let n = payload.len();
        if n > st.recv_credit as usize {
            return Err(MuxError::FatalProtocol(format!(
                "stream {} sent {n} bytes with only {} credit",
                self.id, st.recv_credit
            )));
        }
        st.recv_credit -= n as u32;
        if st.error.is_none() {
            st.buf.extend_from_slice(&payload);
        }
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
        Ok(())
    }

    fn add_credit(&self, delta: u32) {
        let mut st = lock(&self.state);
        st.send_credit = st.send_credit.saturating_add(delta);
        if let Some(w) = st.write_waker.take() {
            w.wake();
        }
    }

    fn remote_close(&self) {
        let mut st = lock(&self.state);
        st.remote_closed = true;
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
    }

    fn fail(&self, reason: &str, discard: bool) {
        let mut st = lock(&self.state);
        st.error = Some(reason.to_string());
        if discard {
            st.buf.clear();
            st.remote_closed = false;
        }
        if let Some(w) = st.read_waker.take() {
            w.wake();
        }
        if let Some(w) = st.write_waker.take() {
            w.wake();
        }
    }
}

/// A logical bidirectional byte stream inside a [`MuxSession`].
pub struct MuxStream {
    shared: Arc<StreamShared>,
    session: Weak<Shared>,
    session_id: String,
    out_tx: mpsc::UnboundedSender<Frame>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("session", &self.session_id)
            .field("id", &self.shared.id)
            .finish()
    }
}

impl MuxStream {
    fn new(shared: Arc<StreamShared>, session: &Arc<Shared>) -> Self {
        Self {
            shared,
            session: Arc::downgrade(session),
            session_id: session.id.clone(),
            out_tx: session.out_tx.clone(),
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut st = lock(&self.shared.state);

        // Bytes that arrived before a close stay readable.
        if !st.buf.is_empty() {
            let n = buf.remaining().min(st.buf.len());
            buf.put_slice(&st.buf[..n]);
            st.buf.advance(n);
            st.unacked += n as u32;

            if st.unacked >= INITIAL_WINDOW / 2 && !st.remote_closed && st.error.is_none() {
                let delta = st.unacked;
                st.unacked = 0;
                st.recv_credit += delta;
                drop(st);
                if let Some(session) = self.session.upgrade() {
                    session.queue_window_update(self.shared.id, delta);
                }
            }
            return Poll::Ready(Ok(()));
        }

        if st.remote_closed {
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = &st.error {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                err.clone(),
            )));
        }

        st.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut st = lock(&self.shared.state);
        if let Some(err) = &st.error {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                err.clone(),
            )));
        }
        if st.local_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mux stream already shut down",
            )));
        }
        if st.send_credit == 0 {
            st.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(st.send_credit as usize).min(MAX_DATA_CHUNK);
        st.send_credit -= n as u32;
        let frame = Frame::data(self.shared.id, Bytes::copy_from_slice(&buf[..n]));
        if self.out_tx.send(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "mux session writer gone",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut st = lock(&self.shared.state);
        if !st.local_closed {
            st.local_closed = true;
            if st.error.is_none() {
                let _ = self.out_tx.send(Frame::close(self.shared.id));
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        {
            let mut st = lock(&self.shared.state);
            if !st.local_closed && st.error.is_none() {
                st.local_closed = true;
                let _ = self.out_tx.send(Frame::close(self.shared.id));
            }
        }
        if let Some(session) = self.session.upgrade() {
            lock(&session.state).streams.remove(&self.shared.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngExt, rng};

    fn pair(cfg: MuxConfig) -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (MuxSession::client(a, cfg.clone()), MuxSession::server(b, cfg))
    }

    #[tokio::test]
    async fn stream_ids_increase_and_keep_parity() {
        let (client, server) = pair(MuxConfig::default());

        let mut ids = Vec::new();
        let mut held = Vec::new();
        for _ in 0..5 {
            let s = client.open_stream().unwrap();
            ids.push(s.id());
            held.push(s);
        }
        // Dropping streams must not free their ids for reuse.
        held.clear();
        ids.push(client.open_stream().unwrap().id());
        assert_eq!(ids, vec![1, 3, 5, 7, 9, 11]);

        let s = server.open_stream().unwrap();
        assert_eq!(s.id(), 2);
        assert_eq!(server.open_stream().unwrap().id(), 4);
    }

    #[tokio::test]
    async fn accept_yields_streams_in_open_order() {
        let (client, server) = pair(MuxConfig::default());

        let mut opened = Vec::new();
        for i in 0..3u8 {
            let mut s = client.open_stream().unwrap();
            s.write_all(&[i]).await.unwrap();
            opened.push(s);
        }

        for i in 0..3u8 {
            let mut s = server.accept().await.unwrap();
            assert_eq!(s.id(), opened[i as usize].id());
            let mut b = [0u8; 1];
            s.read_exact(&mut b).await.unwrap();
            assert_eq!(b[0], i);
        }
    }

    #[tokio::test]
    async fn concurrent_streams_keep_their_own_bytes() {
        let (client, server) = pair(MuxConfig::default());

        let mut writers = Vec::new();
        for n in 0..3u8 {
            let mut s = client.open_stream().unwrap();
            writers.push(tokio::spawn(async move {
                let payload: Vec<u8> = (0..1000u32).map(|i| (i as u8).wrapping_mul(n + 1)).collect();
                let mut off = 0;
                while off < payload.len() {
                    let chunk = rng().random_range(1..=37usize).min(payload.len() - off);
                    s.write_all(&payload[off..off + chunk]).await.unwrap();
                    off += chunk;
                    if rng().random_range(0..3u8) == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                s.shutdown().await.unwrap();
                (s.id(), payload, s)
            }));
        }

        let mut readers = Vec::new();
        for _ in 0..3 {
            let mut s = server.accept().await.unwrap();
            readers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                s.read_to_end(&mut got).await.unwrap();
                (s.id(), got)
            }));
        }

        let mut sent = HashMap::new();
        let mut keep = Vec::new();
        for w in writers {
            let (id, payload, s) = w.await.unwrap();
            sent.insert(id, payload);
            keep.push(s);
        }
        for r in readers {
            let (id, got) = r.await.unwrap();
            assert_eq!(got.len(), 1000);
            assert_eq!(&got, sent.get(&id).unwrap());
        }
    }

    #[tokio::test]
    async fn writer_blocks_on_exhausted_window_until_reader_drains() {
        let (client, server) = pair(MuxConfig::default());

        let mut tx = client.open_stream().unwrap();
        let big = vec![7u8; INITIAL_WINDOW as usize + 4096];

        let blocked = tokio::time::timeout(Duration::from_millis(200), tx.write_all(&big)).await;
        assert!(blocked.is_err(), "write beyond the window must wait for credit");

        let mut rx = server.accept().await.unwrap();
        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; INITIAL_WINDOW as usize];
            rx.read_exact(&mut got).await.unwrap();
            rx
        });
        let _rx = reader.await.unwrap();

        // Remaining bytes fit once the window update arrives.
        tokio::time::timeout(Duration::from_secs(2), tx.write_all(&[1u8; 1024]))
            .await
            .expect("credit replenished")
            .unwrap();
    }

    #[tokio::test]
    async fn idle_session_without_streams_is_torn_down() {
        let cfg = MuxConfig {
            keepalive_interval: Duration::from_millis(50),
            idle_timeout: Some(Duration::from_millis(200)),
            dead_peer_timeout: None,
            accept_backlog: 8,
        };
        let (client, _server) = pair(cfg);

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("idle session should close");
        assert!(client.is_closed());
        assert!(client.open_stream().is_err());
    }

    #[tokio::test]
    async fn session_with_open_stream_survives_idle_timeout() {
        let cfg = MuxConfig {
            keepalive_interval: Duration::from_millis(50),
            idle_timeout: Some(Duration::from_millis(200)),
            dead_peer_timeout: None,
            accept_backlog: 8,
        };
        let (client, server) = pair(cfg);

        let mut s = client.open_stream().unwrap();
        s.write_all(b"x").await.unwrap();
        let _peer = server.accept().await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn open_with_wrong_parity_is_fatal_and_fails_streams() {
        let (raw, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(b, MuxConfig::default());
        let mut raw = raw;

        raw.write_all(&Frame::open(1).encode()).await.unwrap();
        let mut good = server.accept().await.unwrap();

        // Even ids belong to the server side.
        raw.write_all(&Frame::open(2).encode()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("session must close");

        let mut buf = [0u8; 8];
        let err = good.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(good.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn reused_stream_id_is_fatal() {
        let (mut raw, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(b, MuxConfig::default());

        raw.write_all(&Frame::open(3).encode()).await.unwrap();
        raw.write_all(&Frame::open(3).encode()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("session must close");
    }

    #[tokio::test]
    async fn unknown_frame_type_discards_buffered_payload() {
        let (mut raw, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(b, MuxConfig::default());

        raw.write_all(&Frame::open(1).encode()).await.unwrap();
        let mut s = server.accept().await.unwrap();

        let mut wire = Frame::data(1, Bytes::from_static(b"partial")).encode().to_vec();
        wire.extend_from_slice(&[0xee, 0, 0, 0, 1, 0, 0, 0, 0]);
        raw.write_all(&wire).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("session must close");

        let mut buf = Vec::new();
        assert!(s.read_to_end(&mut buf).await.is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn close_unblocks_writer_and_accept() {
        let (client, server) = pair(MuxConfig::default());

        let mut tx = client.open_stream().unwrap();
        tx.write_all(b"hi").await.unwrap();
        let _rx = server.accept().await.unwrap();

        let writer = tokio::spawn(async move {
            let big = vec![0u8; INITIAL_WINDOW as usize * 2];
            tx.write_all(&big).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close();

        let res = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer unblocked")
            .unwrap();
        assert!(res.is_err());

        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("peer sees the close");
        let accepted = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .expect("accept unblocked");
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn clean_peer_close_keeps_buffered_bytes() {
        let (client, server) = pair(MuxConfig::default());

        let mut done = client.open_stream().unwrap();
        done.write_all(b"complete response").await.unwrap();
        done.shutdown().await.unwrap();
        let mut cut = client.open_stream().unwrap();
        cut.write_all(b"partial").await.unwrap();

        let mut done_rx = server.accept().await.unwrap();
        let mut cut_rx = server.accept().await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(client);
            drop((done, cut));
        });
        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("peer close seen");

        let mut got = Vec::new();
        done_rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"complete response");
        got.clear();
        cut_rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"partial");
    }

    #[tokio::test]
    async fn local_close_flushes_queued_frames() {
        let (client, server) = pair(MuxConfig::default());
        let reader = tokio::spawn(async move {
            let mut rx = server.accept().await.unwrap();
            let mut got = Vec::new();
            rx.read_to_end(&mut got).await.unwrap();
            got
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut tx = client.open_stream().unwrap();
        tx.write_all(b"complete response").await.unwrap();
        tx.shutdown().await.unwrap();
        client.close();

        let got = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader finished")
            .unwrap();
        assert_eq!(got, b"complete response");
    }

    #[tokio::test]
    async fn ping_flood_is_answered_with_coalesced_pongs() {
        let (mut raw, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(b, MuxConfig::default());

        const PINGS: u64 = 10_000;
        let mut wire = Vec::new();
        for n in 1..=PINGS {
            wire.extend_from_slice(&Frame::ping(n).encode());
        }
        raw.write_all(&wire).await.unwrap();

        let mut buf = BytesMut::new();
        let mut pongs = 0usize;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                while let Ok((f, used)) = Frame::decode(&buf) {
                    buf.advance(used);
                    if matches!(f.kind, FrameType::Pong) {
                        pongs += 1;
                        if f.nonce() == PINGS {
                            return;
                        }
                    }
                }
                let n = raw.read_buf(&mut buf).await.unwrap();
                assert!(n > 0, "session closed before the last pong");
            }
        })
        .await
        .expect("latest ping answered");

        assert!(pongs < 1000, "{pongs} pongs for {PINGS} pings");
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn writer_finishes_when_reader_sees_eof_first() {
        let (wr, mut peer) = tokio::io::duplex(4096);
        let sess = MuxSession::client(tokio::io::join(tokio::io::empty(), wr), MuxConfig::default());

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), peer.read_to_end(&mut got))
            .await
            .expect("writer shut down")
            .unwrap();
        let (preface, _) = Frame::decode(&got).unwrap();
        assert!(matches!(preface.kind, FrameType::Ping));
        assert!(sess.is_closed());
    }
}
