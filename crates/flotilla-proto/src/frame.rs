use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::message::Envelope;

/// Hard ceiling on a single frame. Generous for control messages; anything
/// larger is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Length-prefixed JSON framing: a u32 big-endian byte count followed by one
/// JSON-encoded [`Envelope`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec { max_len: MAX_FRAME_LEN }
    }

    pub fn with_max_len(max_len: usize) -> Self {
        FrameCodec { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, WireError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_len {
            return Err(WireError::FrameTooLarge { len, max: self.max_len });
        }
        if src.len() < LEN_PREFIX + len {
            // Partial frame: reserve what we still need and wait for more.
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), WireError> {
        let body = serde_json::to_vec(&envelope)?;
        if body.len() > self.max_len {
            return Err(WireError::FrameTooLarge { len: body.len(), max: self.max_len });
        }
        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
