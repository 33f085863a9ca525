//! Byte transport between an isolated context and its supervisor.

pub mod channel;
pub mod frame;

pub use channel::{open, wake_pair, Endpoint, WakeWatch, Waker};
pub use frame::{encode_frame, FrameBuffer, Received, HEADER_SIZE};
