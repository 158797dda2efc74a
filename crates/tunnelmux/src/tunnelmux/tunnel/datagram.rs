//! Datagram framing over a link: `u32be len` + `payload` per datagram.
//!
//! Used for `udp` links so datagram boundaries survive the byte stream.

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
};

use crate::tunnelmux::tunnel::protocol::{MAX_DATAGRAM_BYTES, ProtocolError};

const UDP_BUF: usize = 64 * 1024;

pub async fn read_datagram<R: AsyncRead + Unpin>(r: &mut R, out: &mut [u8]) -> Result<usize, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let n = n as usize;
    if n > out.len() {
        // Drain to keep stream aligned.
        let mut drain = vec![0u8; n];
        r.read_exact(&mut drain).await?;
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "short buffer",
        )));
    }
    r.read_exact(&mut out[..n]).await?;
    Ok(n)
}

pub async fn write_datagram<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let n: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&n.to_be_bytes());
    frame.extend_from_slice(payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Relays datagrams between a link and a connected UDP socket until either
/// side fails or the link reaches EOF.
pub async fn relay_udp<RW>(link: RW, sock: UdpSocket) -> Result<(), ProtocolError>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(link);

    let upstream = async {
        let mut buf = vec![0u8; UDP_BUF];
        loop {
            let n = match read_datagram(&mut rd, &mut buf).await {
                Ok(n) => n,
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Err(e) = sock.send(&buf[..n]).await {
                return Err(ProtocolError::Io(e));
            }
        }
    };

    let downstream = async {
        let mut buf = vec![0u8; UDP_BUF];
        loop {
            let n = match sock.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => return Err::<(), ProtocolError>(ProtocolError::Io(e)),
            };
            write_datagram(&mut wr, &buf[..n]).await?;
        }
    };

    tokio::select! {
        res = upstream => res,
        res = downstream => res,
    }
}
