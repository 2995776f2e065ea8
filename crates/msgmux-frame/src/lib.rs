//! Connection envelopes and message fragment headers for msgmux.
//!
//! Every envelope on the connection is framed as:
//! - A 4-byte big-endian body length
//! - A 1-byte protocol tag
//! - A 4-byte big-endian channel id
//!
//! Channel bodies then carry either a data fragment header
//! (`u16 message id | u8 flags`) or a window update (`u16 message id | u32 credit`).

pub mod codec;
pub mod error;
pub mod message;
pub mod protocol;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_body, encode_frame, put_envelope_header, Frame, FrameConfig,
    DEFAULT_MAX_PAYLOAD, ENVELOPE_HEADER_SIZE, LENGTH_PREFIX_SIZE,
};
pub use error::{FrameError, Result};
pub use message::{
    MessageHeader, WindowUpdate, MAX_WINDOW_CREDIT, MESSAGE_HEADER_SIZE, WINDOW_UPDATE_SIZE,
};
pub use protocol::{
    tag_name, MESSAGE_DATA, MESSAGE_WINDOW_OPEN, MSG_FLAG_CANCELLED, MSG_FLAG_EOF, MSG_FLAG_NEW,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
