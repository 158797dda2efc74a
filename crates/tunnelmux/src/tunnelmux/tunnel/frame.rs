//! Wire frames of the multiplexing protocol.
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! |  Type  |          Stream ID (u32 BE)        |          Length (u32 BE)          |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! |                              Payload (Length bytes)                            |
//! +--------------------------------------------------------------------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 9;

/// Upper bound for a single frame payload. Data frames produced by the session
/// are much smaller; this only guards the decoder against hostile lengths.
pub const MAX_FRAME_PAYLOAD: u32 = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough buffered bytes yet. The caller should read more and retry.
    #[error("malformed frame: need {needed} more bytes")]
    Malformed { needed: usize },
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
    #[error("frame payload too large: {0}")]
    TooLarge(u32),
    #[error("window update payload must be 4 bytes, got {0}")]
    BadWindowUpdate(usize),
}

impl FrameError {
    /// Whether this error should tear down the owning session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::Malformed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Data = 1,
    WindowUpdate = 2,
    Close = 3,
    Ping = 4,
    Pong = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::WindowUpdate),
            3 => Ok(FrameType::Close),
            4 => Ok(FrameType::Ping),
            5 => Ok(FrameType::Pong),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream_id: u32) -> Self {
        Self {
            kind: FrameType::Open,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameType::Data,
            stream_id,
            payload,
        }
    }

    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        Self {
            kind: FrameType::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&delta.to_be_bytes()),
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            kind: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn ping(nonce: u64) -> Self {
        Self {
            kind: FrameType::Ping,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        }
    }

    pub fn pong(nonce: u64) -> Self {
        Self {
            kind: FrameType::Pong,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }

    /// Decodes one frame from the front of `buf`, returning it together with the
    /// number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Malformed {
                needed: FRAME_HEADER_LEN - buf.len(),
            });
        }

        let kind = FrameType::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(len));
        }

        let total = FRAME_HEADER_LEN + len as usize;
        if buf.len() < total {
            return Err(FrameError::Malformed {
                needed: total - buf.len(),
            });
        }

        if kind == FrameType::WindowUpdate && len != 4 {
            return Err(FrameError::BadWindowUpdate(len as usize));
        }

        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..total]);
        Ok((
            Frame {
                kind,
                stream_id,
                payload,
            },
            total,
        ))
    }

    /// Window delta carried by a `WindowUpdate` frame.
    pub fn window_delta(&self) -> Option<u32> {
        if self.kind != FrameType::WindowUpdate || self.payload.len() != 4 {
            return None;
        }
        let p = &self.payload;
        Some(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
    }

    pub fn nonce(&self) -> u64 {
        let mut n = [0u8; 8];
        let k = self.payload.len().min(8);
        n[..k].copy_from_slice(&self.payload[..k]);
        u64::from_be_bytes(n)
    }
}
