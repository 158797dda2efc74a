//! Byte pump between a plain connection and a link, with optional
//! compression and encryption of the link side.
//!
//! When either transform is enabled the link carries blocks of
//! `u32be len` + `body`, where body = encrypt(deflate(chunk)). Both ends of a
//! link must agree on the transforms; they are fixed by the link descriptor.
//!
//! With encryption on, each direction starts with a random 32-byte salt. The
//! direction's key is HKDF-SHA256 over the client vkey with that salt, so no
//! two links share a keystream and the key never equals the hello digest.

use std::io;

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use hkdf::Hkdf;
use rand::{RngExt, rng};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK: usize = 16 * 1024;
const MAX_BLOCK: u32 = 1 << 20;
const MAX_INFLATED: usize = 4 << 20;
const SALT_LEN: usize = 32;
const KEY_LABEL: &[u8] = b"tunnelmux link key v1";

/// Which end of the link this pump runs on. Each direction derives its own
/// key and keeps its own nonce counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The end that requested the link (server side of a relay).
    Initiator,
    /// The end that dialed the target.
    Responder,
}

impl Side {
    fn send_dir(self) -> u8 {
        match self {
            Side::Initiator => 0,
            Side::Responder => 1,
        }
    }

    fn recv_dir(self) -> u8 {
        1 - self.send_dir()
    }
}

#[derive(Clone, Default)]
pub struct LinkCodec {
    compress: bool,
    /// Key material for per-link keys; `None` leaves the link unencrypted.
    secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for LinkCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCodec")
            .field("compress", &self.compress)
            .field("crypt", &self.secret.is_some())
            .finish()
    }
}

impl LinkCodec {
    pub fn plain() -> Self {
        Self::default()
    }

    /// `vkey` is the owning client's key.
    pub fn new(compress: bool, crypt: bool, vkey: &str) -> Self {
        Self {
            compress,
            secret: crypt.then(|| vkey.as_bytes().to_vec()),
        }
    }

    pub fn is_plain(&self) -> bool {
        !self.compress && self.secret.is_none()
    }
}

fn link_cipher(secret: &[u8], salt: &[u8; SALT_LEN], dir: u8) -> io::Result<ChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut info = KEY_LABEL.to_vec();
    info.push(dir);
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key)
        .map_err(|_| io::Error::other("codec: key derivation failed"))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}

fn nonce(dir: u8, counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[0] = dir;
    n[4..].copy_from_slice(&counter.to_be_bytes());
    n
}

/// Copies bytes both ways until both directions finish. Returns
/// `(plain_to_link, link_to_plain)` counted in plain bytes.
pub async fn pipe<P, L>(mut plain: P, mut link: L, codec: &LinkCodec, side: Side) -> io::Result<(u64, u64)>
where
    P: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    if codec.is_plain() {
        return tokio::io::copy_bidirectional(&mut plain, &mut link).await;
    }

    let (mut prd, mut pwr) = tokio::io::split(plain);
    let (mut lrd, mut lwr) = tokio::io::split(link);

    let up = encode_loop(&mut prd, &mut lwr, codec, side.send_dir());
    let down = decode_loop(&mut lrd, &mut pwr, codec, side.recv_dir());
    tokio::try_join!(up, down)
}

async fn encode_loop<R, W>(r: &mut R, w: &mut W, codec: &LinkCodec, dir: u8) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut deflate = codec.compress.then(|| Compress::new(Compression::fast(), false));
    let cipher = match &codec.secret {
        Some(secret) => {
            let salt: [u8; SALT_LEN] = rng().random();
            w.write_all(&salt).await?;
            w.flush().await?;
            Some(link_cipher(secret, &salt, dir)?)
        }
        None => None,
    };
    let mut buf = vec![0u8; CHUNK];
    let mut scratch = Vec::with_capacity(CHUNK);
    let mut counter = 0u64;
    let mut total = 0u64;

    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            w.shutdown().await?;
            return Ok(total);
        }
        total += n as u64;

        let mut block = match deflate.as_mut() {
            Some(c) => {
                deflate_chunk(c, &buf[..n], &mut scratch)?;
                std::mem::take(&mut scratch)
            }
            None => buf[..n].to_vec(),
        };
        if let Some(cipher) = &cipher {
            block = cipher
                .encrypt(Nonce::from_slice(&nonce(dir, counter)), block.as_slice())
                .map_err(|_| io::Error::other("codec: encrypt failed"))?;
            counter += 1;
        }

        let mut frame = Vec::with_capacity(4 + block.len());
        frame.extend_from_slice(&(block.len() as u32).to_be_bytes());
        frame.extend_from_slice(&block);
        w.write_all(&frame).await?;
        w.flush().await?;
        scratch = block;
    }
}

async fn decode_loop<R, W>(r: &mut R, w: &mut W, codec: &LinkCodec, dir: u8) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut inflate = codec.compress.then(|| Decompress::new(false));
    let cipher = match &codec.secret {
        Some(secret) => {
            let mut salt = [0u8; SALT_LEN];
            match r.read_exact(&mut salt).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    w.shutdown().await?;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
            Some(link_cipher(secret, &salt, dir)?)
        }
        None => None,
    };
    let mut block = Vec::new();
    let mut out = Vec::new();
    let mut counter = 0u64;
    let mut total = 0u64;

    loop {
        let mut len = [0u8; 4];
        match r.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                w.shutdown().await?;
                return Ok(total);
            }
            Err(e) => return Err(e),
        }
        let n = u32::from_be_bytes(len);
        if n > MAX_BLOCK {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "codec: block too large"));
        }
        block.resize(n as usize, 0);
        r.read_exact(&mut block).await?;

        if let Some(cipher) = &cipher {
            block = cipher
                .decrypt(Nonce::from_slice(&nonce(dir, counter)), block.as_slice())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "codec: authentication failed"))?;
            counter += 1;
        }

        let plain: &[u8] = match inflate.as_mut() {
            Some(d) => {
                inflate_block(d, &block, &mut out)?;
                &out
            }
            None => &block,
        };
        w.write_all(plain).await?;
        w.flush().await?;
        total += plain.len() as u64;
    }
}

/// Raw deflate with a sync flush so each block is decodable on its own
/// against the shared stream state.
fn deflate_chunk(c: &mut Compress, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    out.clear();
    let mut consumed = 0usize;
    loop {
        out.reserve(input.len() / 2 + 64);
        let before = c.total_in();
        c.compress_vec(&input[consumed..], out, FlushCompress::Sync)
            .map_err(io::Error::other)?;
        consumed += (c.total_in() - before) as usize;
        if consumed >= input.len() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}

fn inflate_block(d: &mut Decompress, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    out.clear();
    let mut consumed = 0usize;
    loop {
        if out.len() > MAX_INFLATED {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "codec: block inflates too far"));
        }
        out.reserve(input.len() * 2 + 1024);
        let before = d.total_in();
        d.decompress_vec(&input[consumed..], out, FlushDecompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        consumed += (d.total_in() - before) as usize;
        if consumed >= input.len() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}
