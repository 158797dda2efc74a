use async_trait::async_trait;
use thiserror::Error;

use crate::tunnelmux::tunnel::{link::LinkDescriptor, link::LinkError, transport::BoxedStream};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("client {0:?} is offline")]
    ClientOffline(String),
    #[error("no healthy session")]
    NoSession,
    #[error("link handshake failed: {0}")]
    Handshake(#[from] LinkError),
}

/// Obtains a logical connection to a client, whatever carries it.
///
/// Implemented by the server-side [`Manager`](crate::tunnelmux::tunnel::manager::Manager),
/// which opens a stream on the client's control session, and by the
/// client-side [`P2pBridge`](crate::tunnelmux::tunnel::p2p::P2pBridge).
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn request_link(&self, client_id: &str, desc: LinkDescriptor) -> Result<BoxedStream, BridgeError>;
}
