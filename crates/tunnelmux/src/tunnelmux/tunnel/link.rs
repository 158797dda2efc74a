//! Link descriptor sent as the first bytes of every mux stream.
//!
//! Wire format: `"TMLK"` | version u8 | `u32be len` | JSON body.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tunnelmux::tunnel::mux::{MuxError, MuxSession, MuxStream};

const MAGIC_LINK: &[u8; 4] = b"TMLK";
const LINK_V1: u8 = 1;

pub const MAX_DESCRIPTOR_BYTES: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("stream closed before the link descriptor was complete")]
    IncompleteHandshake,
    #[error("bad link header: {0}")]
    BadHeader(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(std::io::Error),
    #[error("mux: {0}")]
    Mux(#[from] MuxError),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            LinkError::IncompleteHandshake
        } else {
            LinkError::Io(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Tcp,
    Udp,
    /// Signals the provider side of a p2p tunnel to join a rendezvous.
    P2p,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkKind::Tcp => "tcp",
            LinkKind::Udp => "udp",
            LinkKind::P2p => "p2p",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescriptor {
    pub kind: LinkKind,
    pub target: String,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub crypt: bool,
    /// Address of the connection that caused this link.
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ticket: String,
}

impl LinkDescriptor {
    pub fn tcp(target: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::Tcp,
            target: target.into(),
            proxy_protocol: false,
            compress: false,
            crypt: false,
            remote_addr: String::new(),
            ticket: String::new(),
        }
    }

    pub fn udp(target: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::Udp,
            ..Self::tcp(target)
        }
    }

    pub fn p2p(rendezvous: impl Into<String>, ticket: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::P2p,
            ticket: ticket.into(),
            ..Self::tcp(rendezvous)
        }
    }
}

/// Writes the descriptor as a single write so it leads the stream.
pub async fn send_descriptor<W: AsyncWrite + Unpin>(w: &mut W, desc: &LinkDescriptor) -> Result<(), LinkError> {
    let body = serde_json::to_vec(desc)?;
    let n: u32 = body
        .len()
        .try_into()
        .ok()
        .filter(|n| *n <= MAX_DESCRIPTOR_BYTES)
        .ok_or_else(|| LinkError::BadHeader(format!("descriptor too large: {} bytes", body.len())))?;

    let mut buf = Vec::with_capacity(9 + body.len());
    buf.extend_from_slice(MAGIC_LINK);
    buf.push(LINK_V1);
    buf.extend_from_slice(&n.to_be_bytes());
    buf.extend_from_slice(&body);
    w.write_all(&buf).await.map_err(LinkError::Io)?;
    w.flush().await.map_err(LinkError::Io)?;
    Ok(())
}

/// Reads exactly the descriptor bytes; anything after them is link payload
/// and stays in the stream.
pub async fn read_descriptor<R: AsyncRead + Unpin>(r: &mut R) -> Result<LinkDescriptor, LinkError> {
    let mut head = [0u8; 9];
    r.read_exact(&mut head).await?;
    if &head[..4] != MAGIC_LINK {
        return Err(LinkError::BadHeader("bad magic".into()));
    }
    if head[4] != LINK_V1 {
        return Err(LinkError::BadHeader(format!("unsupported version {}", head[4])));
    }
    let n = u32::from_be_bytes([head[5], head[6], head[7], head[8]]);
    if n > MAX_DESCRIPTOR_BYTES {
        return Err(LinkError::BadHeader(format!("descriptor too large: {n} bytes")));
    }
    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Opens a stream on `session` and sends `desc` on it.
pub async fn open_link(session: &MuxSession, desc: &LinkDescriptor) -> Result<MuxStream, LinkError> {
    let mut stream = session.open_stream()?;
    send_descriptor(&mut stream, desc).await?;
    Ok(stream)
}
