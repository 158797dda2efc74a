use std::{collections::HashMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::tunnelmux::tunnel::{
    bridge::{Bridge, BridgeError},
    link::{self, LinkDescriptor},
    mux::MuxSession,
    transport::BoxedStream,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub session: String,
    pub remote: String,
    pub streams: usize,
    pub connected_secs: u64,
}

struct ClientConn {
    sess: Arc<MuxSession>,
    remote: String,
    started: Instant,
}

/// Control sessions of connected clients, keyed by client id.
pub struct Manager {
    state: RwLock<HashMap<String, ClientConn>>,
    changed: tokio::sync::watch::Sender<u64>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(0u64);
        Self {
            state: RwLock::new(HashMap::new()),
            changed: tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Registers `sess` for `client_id`. A previous session of the same client
    /// is closed and replaced.
    pub async fn register_client(&self, client_id: &str, sess: Arc<MuxSession>) -> anyhow::Result<()> {
        let id = client_id.trim();
        if id.is_empty() {
            anyhow::bail!("tunnel: empty client id");
        }

        let cc = ClientConn {
            remote: sess.remote_addr().map(|a| a.to_string()).unwrap_or_default(),
            sess,
            started: Instant::now(),
        };

        let old = self.state.write().await.insert(id.to_string(), cc);
        if let Some(old) = old {
            tracing::info!(client = %id, session = %old.sess.id(), "tunnel: replacing previous session");
            old.sess.close();
        }

        self.bump_changed();
        Ok(())
    }

    /// Removes the client only if `session_id` is still its current session,
    /// so a late cleanup of a replaced session leaves the newer one alone.
    pub async fn unregister_client(&self, client_id: &str, session_id: &str) {
        let mut st = self.state.write().await;
        let current = st.get(client_id).is_some_and(|cc| cc.sess.id() == session_id);
        if !current {
            return;
        }
        let old = st.remove(client_id);
        drop(st);

        if let Some(old) = old {
            old.sess.close();
        }
        self.bump_changed();
    }

    pub async fn is_online(&self, client_id: &str) -> bool {
        self.state
            .read()
            .await
            .get(client_id)
            .is_some_and(|cc| !cc.sess.is_closed())
    }

    pub async fn snapshot_clients(&self) -> Vec<ClientSnapshot> {
        let st = self.state.read().await;
        let mut out: Vec<ClientSnapshot> = st
            .iter()
            .map(|(cid, cc)| ClientSnapshot {
                client_id: cid.clone(),
                session: cc.sess.id().to_string(),
                remote: cc.remote.clone(),
                streams: cc.sess.stream_count(),
                connected_secs: cc.started.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }

    pub async fn close_all(&self) {
        let drained: Vec<ClientConn> = self.state.write().await.drain().map(|(_, cc)| cc).collect();
        for cc in drained {
            cc.sess.close();
        }
        self.bump_changed();
    }

    fn bump_changed(&self) {
        let prev = *self.changed.borrow();
        let _ = self.changed.send(prev.wrapping_add(1));
    }
}

#[async_trait]
impl Bridge for Manager {
    async fn request_link(&self, client_id: &str, desc: LinkDescriptor) -> Result<BoxedStream, BridgeError> {
        let sess = {
            let st = self.state.read().await;
            match st.get(client_id) {
                Some(cc) if !cc.sess.is_closed() => cc.sess.clone(),
                _ => return Err(BridgeError::ClientOffline(client_id.to_string())),
            }
        };

        let stream = link::open_link(&sess, &desc).await?;
        tracing::debug!(
            client = %client_id,
            session = %sess.id(),
            stream = stream.id(),
            kind = desc.kind.as_str(),
            addr = %desc.target,
            "tunnel: link opened"
        );
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelmux::tunnel::mux::MuxConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Arc<MuxSession>, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Arc::new(MuxSession::server(a, MuxConfig::default())),
            MuxSession::client(b, MuxConfig::default()),
        )
    }

    #[tokio::test]
    async fn request_link_reaches_registered_client() {
        let m = Manager::new();
        let (server_side, client_side) = pair();
        m.register_client("c1", server_side).await.unwrap();

        let mut link = m.request_link("c1", LinkDescriptor::tcp("127.0.0.1:22")).await.unwrap();
        link.write_all(b"hi").await.unwrap();

        let mut inbound = client_side.accept().await.unwrap();
        let desc = link::read_descriptor(&mut inbound).await.unwrap();
        assert_eq!(desc.target, "127.0.0.1:22");
        let mut buf = [0u8; 2];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn unknown_client_is_offline() {
        let m = Manager::new();
        let err = m.request_link("nobody", LinkDescriptor::tcp("x:1")).await.err().unwrap();
        assert!(matches!(err, BridgeError::ClientOffline(_)));
    }

    #[tokio::test]
    async fn newer_login_replaces_and_stale_unregister_is_ignored() {
        let m = Manager::new();
        let (first, _c1) = pair();
        let (second, _c2) = pair();
        let first_id = first.id().to_string();

        m.register_client("c1", first.clone()).await.unwrap();
        m.register_client("c1", second.clone()).await.unwrap();
        assert!(first.is_closed());

        m.unregister_client("c1", &first_id).await;
        assert!(m.is_online("c1").await);

        m.unregister_client("c1", second.id()).await;
        assert!(!m.is_online("c1").await);
        assert!(second.is_closed());
    }
}
