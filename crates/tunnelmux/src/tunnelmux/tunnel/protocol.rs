//! Bridge hello exchanged on every new physical connection to the bridge port.
//!
//! ```text
//! client -> server: "TMUX" | version u8 | kind u8 | u16be len | key digest (hex)
//! server -> client: status u8 [ | u16be len | rendezvous addr | u16be len | ticket ]   (p2p only)
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC_BRIDGE: &[u8; 4] = b"TMUX";
const PROTOCOL_V1: u8 = 1;

pub const MAX_SHORT_STRING: u16 = 1024;
pub const MAX_DATAGRAM_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("unknown work kind: {0}")]
    BadKind(u8),
    #[error("unknown status: {0}")]
    BadStatus(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// What a physical bridge connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkKind {
    /// Long-lived control session of a client; carries every relayed link.
    Main = 1,
    /// One relayed link for a secret tunnel visitor.
    Secret = 2,
    /// Rendezvous request of a p2p visitor.
    P2p = 3,
}

impl WorkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkKind::Main => "main",
            WorkKind::Secret => "secret",
            WorkKind::P2p => "p2p",
        }
    }
}

impl TryFrom<u8> for WorkKind {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(WorkKind::Main),
            2 => Ok(WorkKind::Secret),
            3 => Ok(WorkKind::P2p),
            other => Err(ProtocolError::BadKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    BadKey = 1,
    UnknownTunnel = 2,
    ClientOffline = 3,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Status::Ok),
            1 => Ok(Status::BadKey),
            2 => Ok(Status::UnknownTunnel),
            3 => Ok(Status::ClientOffline),
            other => Err(ProtocolError::BadStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub kind: WorkKind,
    /// Hex SHA-256 of the client vkey (`Main`) or the tunnel password.
    pub key: String,
}

/// Hex SHA-256 digest. Secrets never cross the wire in clear.
pub fn key_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, hello: &Hello) -> Result<(), ProtocolError> {
    let mut buf = Vec::with_capacity(8 + hello.key.len());
    buf.extend_from_slice(MAGIC_BRIDGE);
    buf.push(PROTOCOL_V1);
    buf.push(hello.kind as u8);
    put_short_string(&mut buf, &hello.key)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC_BRIDGE {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion);
    }
    let kind = WorkKind::try_from(r.read_u8().await?)?;
    let key = read_short_string(r).await?;
    Ok(Hello { kind, key })
}

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: Status) -> Result<(), ProtocolError> {
    w.write_u8(status as u8).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<Status, ProtocolError> {
    Status::try_from(r.read_u8().await?)
}

/// Reply to a `P2p` hello: status followed by the rendezvous address and ticket.
pub async fn write_p2p_grant<W: AsyncWrite + Unpin>(
    w: &mut W,
    rendezvous: &str,
    ticket: &str,
) -> Result<(), ProtocolError> {
    let mut buf = vec![Status::Ok as u8];
    put_short_string(&mut buf, rendezvous)?;
    put_short_string(&mut buf, ticket)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_p2p_grant<R: AsyncRead + Unpin>(r: &mut R) -> Result<(String, String), ProtocolError> {
    let rendezvous = read_short_string(r).await?;
    let ticket = read_short_string(r).await?;
    Ok((rendezvous, ticket))
}

fn put_short_string(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let b = s.as_bytes();
    let n: u16 = b.len().try_into().map_err(|_| ProtocolError::PayloadTooLarge(b.len() as u32))?;
    if n > MAX_SHORT_STRING {
        return Err(ProtocolError::PayloadTooLarge(n as u32));
    }
    buf.extend_from_slice(&n.to_be_bytes());
    buf.extend_from_slice(b);
    Ok(())
}

async fn read_short_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let n = r.read_u16().await?;
    if n > MAX_SHORT_STRING {
        return Err(ProtocolError::PayloadTooLarge(n as u32));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
