//! Fixed-size wire frame for [`Message`]s.
//!
//! Every message, whatever its kind, is carried in one [`Frame`] of
//! [`MESSAGE_SIZE`] bytes, which is what a mailbox slot holds.
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────┐
//! │ len: u16 │ payload: [u8; FRAME_CAP]             │
//! │ (LE)     │ tag | postcard body | zero padding   │
//! └──────────┴──────────────────────────────────────┘
//! ```
//!
//! The first payload byte is the [`Kind`] tag (postcard writes enum variant
//! indices as varints, and every tag is below 128).

use std::mem::size_of;

use thiserror::Error;

use crate::message::{Kind, Message};

/// Payload capacity of a frame; fits the largest encoded message.
pub const FRAME_CAP: usize = 32;

/// Size in bytes of one encoded message (one mailbox slot).
pub const MESSAGE_SIZE: usize = size_of::<Frame>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Frame {
    /// Bytes used inside `payload`.
    pub len: u16,
    /// Serialized message bytes, zero padded.
    pub payload: [u8; FRAME_CAP],
}

#[derive(Debug, Error)]
pub enum FrameError {
    /// Serialization failed or the payload is malformed.
    #[error("frame serialization error: {0}")]
    Serialize(#[from] postcard::Error),
    /// `len` exceeds the frame payload.
    #[error("frame length {len} exceeds capacity {cap}")]
    LenOutOfBounds { len: usize, cap: usize },
    /// The frame carries no bytes at all.
    #[error("empty frame")]
    Empty,
    /// The tag byte does not name a known [`Kind`].
    #[error("unknown message kind tag {0}")]
    UnknownVariant(u8),
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    /// An empty, zeroed frame.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            payload: [0; FRAME_CAP],
        }
    }

    /// Serializes `msg` into a fresh frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Serialize`] if the encoding does not fit.
    pub fn encode(msg: &Message) -> Result<Self, FrameError> {
        let mut frame = Self::new();
        let used = postcard::to_slice(msg, &mut frame.payload)?.len();
        frame.len = u16::try_from(used).map_err(|_| FrameError::LenOutOfBounds {
            len: used,
            cap: FRAME_CAP,
        })?;
        Ok(frame)
    }

    /// The kind tag carried by this frame, if it is not empty.
    #[must_use]
    pub fn tag(&self) -> Option<u8> {
        (self.len > 0).then_some(self.payload[0])
    }

    /// Deserializes the message carried by this frame.
    ///
    /// # Errors
    ///
    /// - [`FrameError::LenOutOfBounds`] if `len` is larger than the payload
    /// - [`FrameError::Empty`] if `len` is zero
    /// - [`FrameError::UnknownVariant`] if the tag is not a known kind
    /// - [`FrameError::Serialize`] if the body is malformed
    pub fn decode(&self) -> Result<Message, FrameError> {
        let len = usize::from(self.len);
        if len > FRAME_CAP {
            return Err(FrameError::LenOutOfBounds { len, cap: FRAME_CAP });
        }
        let tag = self.tag().ok_or(FrameError::Empty)?;
        Kind::try_from(tag).map_err(FrameError::UnknownVariant)?;
        Ok(postcard::from_bytes(&self.payload[..len])?)
    }

    /// The frame as slot bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut bytes = [0u8; MESSAGE_SIZE];
        bytes[..2].copy_from_slice(&self.len.to_le_bytes());
        bytes[2..2 + FRAME_CAP].copy_from_slice(&self.payload);
        bytes
    }

    /// Reads a frame back from slot bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; MESSAGE_SIZE]) -> Self {
        let mut payload = [0u8; FRAME_CAP];
        payload.copy_from_slice(&bytes[2..2 + FRAME_CAP]);
        Self {
            len: u16::from_le_bytes([bytes[0], bytes[1]]),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::approx_constant)]
    fn every_kind() -> Vec<Message> {
        vec![
            Message::U32(u32::MAX),
            Message::I32(i32::MIN),
            Message::U16(100),
            Message::I16(-45),
            Message::U8(5),
            Message::F32(3.1415),
            Message::text("This is a test str\n"),
        ]
    }

    #[test]
    fn frame_size_is_fixed() {
        assert_eq!(MESSAGE_SIZE, 2 + FRAME_CAP);
        for msg in every_kind() {
            let frame = Frame::encode(&msg).unwrap();
            assert_eq!(frame.to_bytes().len(), MESSAGE_SIZE);
            assert!(usize::from(frame.len) <= FRAME_CAP);
        }
    }

    #[test]
    fn tag_byte_is_kind() {
        for msg in every_kind() {
            let frame = Frame::encode(&msg).unwrap();
            assert_eq!(frame.tag(), Some(msg.kind().tag()));
        }
    }

    #[test]
    fn largest_text_fits() {
        let msg = Message::text(&"x".repeat(64));
        let frame = Frame::encode(&msg).unwrap();
        assert_eq!(frame.decode().unwrap(), msg);
    }

    #[test]
    fn decode_through_slot_bytes() {
        for msg in every_kind() {
            let frame = Frame::encode(&msg).unwrap();
            let back = Frame::from_bytes(&frame.to_bytes());
            assert_eq!(back, frame);
            assert_eq!(back.decode().unwrap(), msg);
        }
    }

    #[test]
    fn float_bits_survive() {
        let msg = Message::F32(f32::from_bits(0x7FC0_1234));
        let Message::F32(back) = Frame::encode(&msg).unwrap().decode().unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(back.to_bits(), 0x7FC0_1234);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut frame = Frame::encode(&Message::U8(1)).unwrap();
        frame.payload[0] = 7;
        assert!(matches!(frame.decode(), Err(FrameError::UnknownVariant(7))));
    }

    #[test]
    fn empty_and_oversized_frames_are_rejected() {
        assert!(matches!(Frame::new().decode(), Err(FrameError::Empty)));

        let mut frame = Frame::encode(&Message::U8(1)).unwrap();
        frame.len = 200;
        assert!(matches!(
            frame.decode(),
            Err(FrameError::LenOutOfBounds { len: 200, cap: FRAME_CAP })
        ));
    }

    #[test]
    fn truncated_body_is_a_serialize_error() {
        let mut frame = Frame::encode(&Message::U32(u32::MAX)).unwrap();
        frame.len = 2;
        assert!(matches!(frame.decode(), Err(FrameError::Serialize(_))));
    }
}
