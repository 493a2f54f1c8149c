//! Type-tagged message values exchanged through a mailbox.
//!
//! A [`Message`] is a sum type: the variant is the discriminant and carries
//! exactly one payload representation. [`Kind`] names the variant without the
//! payload and fixes the on-wire tag values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capacity of the text payload in bytes, including the NUL terminator.
pub const TEXT_CAP: usize = 30;

/// Payload kind of a [`Message`].
///
/// The discriminants are the wire tags; they match the variant order of
/// [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    U32 = 0,
    I32 = 1,
    U16 = 2,
    I16 = 3,
    U8 = 4,
    F32 = 5,
    Str = 6,
}

impl Kind {
    /// Every kind, in tag order.
    pub const ALL: [Self; 7] = [
        Self::U32,
        Self::I32,
        Self::U16,
        Self::I16,
        Self::U8,
        Self::F32,
        Self::Str,
    ];

    /// Wire tag of this kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// The following kind in tag order, wrapping from `Str` to `U32`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::ALL[(self as usize + 1) % Self::ALL.len()]
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::U32 => "U32",
            Self::I32 => "I32",
            Self::U16 => "U16",
            Self::I16 => "I16",
            Self::U8 => "U8",
            Self::F32 => "F32",
            Self::Str => "STR",
        }
    }
}

impl TryFrom<u8> for Kind {
    /// The unrecognized tag.
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(tag)).copied().ok_or(tag)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-capacity, NUL-terminated text buffer.
///
/// Holds at most `TEXT_CAP - 1` bytes of UTF-8; the remainder is NUL padding,
/// so the buffer always reads as text up to its first NUL.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Text([u8; TEXT_CAP]);

impl Text {
    /// Copies `text`, truncating on a character boundary if it does not fit.
    #[must_use]
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(TEXT_CAP - 1);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0u8; TEXT_CAP];
        buf[..end].copy_from_slice(&text.as_bytes()[..end]);
        Self(buf)
    }

    /// The text up to the first NUL.
    ///
    /// Bytes that are not valid UTF-8 (only possible for buffers received from
    /// a misbehaving peer) end the text early.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(TEXT_CAP);
        let bytes = &self.0[..end];
        match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => std::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
        }
    }

    /// The raw buffer, terminator and padding included.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TEXT_CAP] {
        &self.0
    }
}

impl Default for Text {
    fn default() -> Self {
        Self([0; TEXT_CAP])
    }
}

impl From<&str> for Text {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed value in transit.
///
/// The variant order is the wire tag order (see [`Kind`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Message {
    U32(u32),
    I32(i32),
    U16(u16),
    I16(i16),
    U8(u8),
    F32(f32),
    Str(Text),
}

impl Message {
    /// Builds a text message, truncating `text` to fit.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Str(Text::new(text))
    }

    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::U32(_) => Kind::U32,
            Self::I32(_) => Kind::I32,
            Self::U16(_) => Kind::U16,
            Self::I16(_) => Kind::I16,
            Self::U8(_) => Kind::U8,
            Self::F32(_) => Kind::F32,
            Self::Str(_) => Kind::Str,
        }
    }

    /// Human-readable rendering of the payload alone.
    #[must_use]
    pub const fn value(&self) -> Value<'_> {
        Value(self)
    }
}

/// Display adapter for a message payload, see [`Message::value`].
pub struct Value<'a>(&'a Message);

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::U32(v) => write!(f, "{v}"),
            Message::I32(v) => write!(f, "{v}"),
            Message::U16(v) => write!(f, "{v}"),
            Message::I16(v) => write!(f, "{v}"),
            Message::U8(v) => write!(f, "{v}"),
            Message::F32(v) => write!(f, "{v:.6}"),
            Message::Str(text) => write!(f, "{}", text.as_str().escape_debug()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, value = {}", self.kind(), self.value())
    }
}
