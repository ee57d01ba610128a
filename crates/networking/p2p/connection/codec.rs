use crate::{error::ChannelError, message::Frame};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard cap on a frame payload: 10 MiB. Anything larger is rejected before
/// any payload storage is reserved.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

/// Kind byte plus the little-endian `u32` payload length.
const HEADER_LEN: usize = 5;

/// Length-prefixed frame codec: `kind(1) || length(4, LE) || payload`.
///
/// Stateless; partial input simply yields `None` until the transport delivers
/// the rest of the frame.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChannelError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(ChannelError::Protocol(format!(
                "frame payload of {length} bytes exceeds the {MAX_FRAME_PAYLOAD} byte cap"
            )));
        }
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }
        let kind = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChannelError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // The peer hung up in the middle of a frame.
            None => Err(ChannelError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ChannelError> {
        let length = frame.payload.len();
        if length > MAX_FRAME_PAYLOAD {
            return Err(ChannelError::Protocol(format!(
                "refusing to send a {length} byte payload"
            )));
        }
        dst.reserve(HEADER_LEN + length);
        dst.put_u8(frame.kind);
        dst.put_u32_le(length as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
