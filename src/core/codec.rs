//! Tokio codec for bus message framing.
//!
//! [`MessageCodec`] turns a byte stream into complete [`Message`]s and back. The
//! frame length is read from the 16-byte fixed header, so oversized frames are
//! refused before their bodies are buffered.

use crate::core::message::{Message, FIXED_HEADER_LEN, MAX_MESSAGE_SIZE};
use crate::error::{constants, BusError};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Frames bus messages over a byte stream.
///
/// Partial frames stay in the read buffer until the rest arrives. The declared
/// frame length is checked against `max_message_size` as soon as the fixed header
/// is available, before any of the frame body is buffered.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(MAX_MESSAGE_SIZE),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        let frame_len = Message::frame_length(&src[..FIXED_HEADER_LEN])?;
        if frame_len > self.max_message_size {
            return Err(BusError::OversizedMessage {
                size: frame_len,
                limit: self.max_message_size,
            });
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        trace!(bytes = frame_len, "Decoded message frame");
        Message::from_bytes(&frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None => Err(BusError::framing(constants::ERR_TRUNCATED_FRAME)),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = BusError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.to_bytes()?;
        if bytes.len() > self.max_message_size {
            return Err(BusError::OversizedMessage {
                size: bytes.len(),
                limit: self.max_message_size,
            });
        }
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
