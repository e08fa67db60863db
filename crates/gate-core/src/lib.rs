//! gate-core: wire protocol for the game gateway.
//!
//! Defines the frame envelope, message-type class ranges, and the
//! streaming codec (length-prefixed envelopes, Snappy-compressed bodies).

pub mod codec;
pub mod error;
pub mod frame;

// Re-export commonly used items at crate root.
pub use codec::{FrameDecoder, FrameEncoder, DEFAULT_COMPRESS_THRESHOLD, DEFAULT_MAX_BODY};
pub use error::{CodecError, CodecResult};
pub use frame::{msg, unix_millis, Frame, MessageClass};
