//! Control channel framing.
//!
//! Each frame is a 2-byte little-endian length followed by exactly that many
//! bytes of duplication token. No magic, no version, no checksum.
//!
//! # Design Decisions
//! - The length field is consumed once; the decoder then waits for at least
//!   `length` payload bytes, so arbitrary TCP segmentation is tolerated
//! - A partial frame at end of stream means the peer closed the channel, not
//!   that the data is corrupt; the frame sequence simply ends

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::handoff::token::DuplicationToken;

/// Size of the length prefix.
const HEADER_LEN: usize = 2;

/// Largest token a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Data(usize),
}

/// Codec for length-prefixed duplication token frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = DuplicationToken;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecodeState::Head => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let len = src.get_u16_le() as usize;
                self.state = DecodeState::Data(len);
                len
            }
            DecodeState::Data(len) => len,
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        self.state = DecodeState::Head;
        Ok(Some(DuplicationToken::from(payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if !src.is_empty() || self.state != DecodeState::Head {
            tracing::debug!(
                buffered = src.len(),
                state = ?self.state,
                "Control channel closed mid-frame"
            );
        }
        src.clear();
        self.state = DecodeState::Head;
        Ok(None)
    }
}

impl Encoder<DuplicationToken> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: DuplicationToken, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(item.as_bytes(), dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(item, dst)
    }
}

fn put_frame(payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "token of {} bytes exceeds frame limit of {}",
                payload.len(),
                MAX_FRAME_PAYLOAD
            ),
        )
    })?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u16_le(len);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Encode a single token payload into a standalone frame.
pub fn encode_frame(payload: &[u8]) -> io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_frame(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Lazy sequence of frames read from a control channel.
pub fn frames<R: AsyncRead>(reader: R) -> FramedRead<R, FrameCodec> {
    FramedRead::new(reader, FrameCodec::new())
}
