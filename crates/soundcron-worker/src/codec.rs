//! Length-prefixed Opus frames: `u16` little-endian length, then that many
//! bytes of one encoded frame, repeated until end of input.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error while reading frames: {0}")]
    Io(#[from] std::io::Error),

    /// Input ended inside a frame header or body.
    #[error("truncated frame: needed {expected} bytes, {available} left")]
    Truncated { expected: usize, available: usize },

    #[error("frame of {0} bytes does not fit a 16-bit length prefix")]
    Oversized(usize),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpusFrameCodec;

impl Decoder for OpusFrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let expected = if src.len() < HEADER_LEN {
                    HEADER_LEN
                } else {
                    HEADER_LEN + u16::from_le_bytes([src[0], src[1]]) as usize
                };
                Err(FrameError::Truncated {
                    expected,
                    available: src.len(),
                })
            }
        }
    }
}

impl<'a> Encoder<&'a [u8]> for OpusFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &'a [u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = u16::try_from(frame.len()).map_err(|_| FrameError::Oversized(frame.len()))?;
        dst.reserve(HEADER_LEN + frame.len());
        dst.put_u16_le(len);
        dst.put_slice(frame);
        Ok(())
    }
}
