//! Wire representation of messages.

pub mod frame;

pub use frame::{FRAME_CAP, Frame, FrameError, MESSAGE_SIZE};
