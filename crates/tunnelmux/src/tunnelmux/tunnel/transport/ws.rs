use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::AbortHandle,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Message,
        handshake::server::{Request, Response},
        http::StatusCode,
    },
};

use crate::tunnelmux::tunnel::transport::{BoxedStream, Transport, TransportListener, tcp::TcpTransport};

const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP_BUF: usize = 16 * 1024;
/// Upgraded connections waiting for `accept`.
const WS_BACKLOG: usize = 64;

type Handoff = (BoxedStream, SocketAddr);

/// Bridge transport carried inside binary WebSocket messages.
pub struct WsTransport {
    path: String,
}

impl WsTransport {
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize_path(path),
        }
    }
}

fn normalize_path(path: &str) -> String {
    let p = path.trim();
    if p.is_empty() {
        "/".to_string()
    } else if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let inner = TcpTransport::new().listen(addr).await?;
        Ok(Box::new(WsListener::new(inner, &self.path)))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let tcp = TcpStream::connect(addr).await?;
        let _ = tcp.set_nodelay(true);
        let url = format!("ws://{addr}{}", self.path);
        let (ws, _resp) = tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, tokio_tungstenite::client_async(url, tcp))
            .await
            .map_err(|_| anyhow::anyhow!("ws: handshake timeout"))??;
        Ok(into_byte_stream(ws))
    }
}

/// Upgrades connections from any inner listener. The inner listener may be a
/// plain TCP socket or a dispatcher lane that already classified the bytes as
/// a WebSocket upgrade.
///
/// Each handshake runs in its own task, so a client that never finishes its
/// upgrade holds up nobody but itself.
pub struct WsListener {
    inner: Arc<dyn TransportListener>,
    rx: Mutex<mpsc::Receiver<Handoff>>,
    acceptor: AbortHandle,
}

impl WsListener {
    pub fn new(inner: Box<dyn TransportListener>, path: &str) -> Self {
        let inner: Arc<dyn TransportListener> = Arc::from(inner);
        let (tx, rx) = mpsc::channel(WS_BACKLOG);
        let acceptor = tokio::spawn(accept_loop(inner.clone(), normalize_path(path), tx)).abort_handle();
        Self {
            inner,
            rx: Mutex::new(rx),
            acceptor,
        }
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(inner: Arc<dyn TransportListener>, path: String, tx: mpsc::Sender<Handoff>) {
    loop {
        let accepted = tokio::select! {
            res = inner.accept() => res,
            _ = tx.closed() => return,
        };
        let (conn, peer) = match accepted {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(err=%err, "ws: inner listener stopped");
                return;
            }
        };
        tokio::spawn(upgrade(conn, peer, path.clone(), tx.clone()));
    }
}

async fn upgrade(conn: BoxedStream, peer: SocketAddr, expected: String, tx: mpsc::Sender<Handoff>) {
    let callback = move |req: &Request, response: Response| {
        let path = req.uri().path();
        if path == expected || path.trim_end_matches('/') == expected.trim_end_matches('/') {
            Ok(response)
        } else {
            let mut resp = tokio_tungstenite::tungstenite::handshake::server::ErrorResponse::new(None);
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Err(resp)
        }
    };

    match tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_hdr_async(conn, callback)).await {
        Ok(Ok(ws)) => {
            // Blocks while the backlog is full.
            if tx.send((into_byte_stream(ws), peer)).await.is_err() {
                tracing::debug!(peer=%peer, "ws: listener closed; dropping upgraded connection");
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(peer=%peer, err=%err, "ws: handshake failed");
        }
        Err(_) => {
            tracing::warn!(peer=%peer, "ws: handshake timeout");
        }
    }
}

#[async_trait]
impl TransportListener for WsListener {
    async fn accept(&self) -> anyhow::Result<Handoff> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| anyhow::anyhow!("ws: listener closed"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.acceptor.abort();
        self.rx.lock().await.close();
        self.inner.close().await
    }
}

/// Turns a message-oriented WebSocket into a plain byte stream by pumping
/// binary messages through an in-memory duplex pipe.
fn into_byte_stream<S>(ws: WebSocketStream<S>) -> BoxedStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(4 * PUMP_BUF);
    let (mut rd, mut wr) = tokio::io::split(remote);
    let (mut sink, mut stream) = ws.split();

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(b)) => {
                    if wr.write_all(&b).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = wr.shutdown().await;
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUF];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    Box::new(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_normalized() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("bridge"), "/bridge");
        assert_eq!(normalize_path(" /ws "), "/ws");
    }

    #[tokio::test]
    async fn bytes_cross_websocket_both_ways() {
        let tr = WsTransport::new("/tunnel");
        let ln = tr.listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            s.flush().await.unwrap();
            buf
        });

        let mut c = WsTransport::new("tunnel").dial(&addr.to_string()).await.unwrap();
        c.write_all(b"hello").await.unwrap();
        let mut back = [0u8; 5];
        c.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"hello");
        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn silent_client_does_not_hold_up_other_upgrades() {
        let ln = WsTransport::new("/").listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        // Connects but never sends its upgrade request.
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dial = tokio::spawn(async move { WsTransport::new("/").dial(&addr.to_string()).await });
        let (_conn, _peer) = tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .expect("second client upgraded while the first stays silent")
            .unwrap();
        dial.await.unwrap().unwrap();
    }
}
