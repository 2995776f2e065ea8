//! Protocol tags and message flags.
//!
//! Every envelope on the connection starts with a one-byte protocol tag
//! that tells the demultiplexer how to interpret the rest of the body.

/// Message data fragment: `u16 id | u8 flags | payload`.
pub const MESSAGE_DATA: u8 = 0x30;

/// Window update for an outbound message: `u16 id | u32 credit`.
pub const MESSAGE_WINDOW_OPEN: u8 = 0x31;

/// The fragment starts a new logical message.
pub const MSG_FLAG_NEW: u8 = 0x01;

/// The fragment is the last one of its message.
pub const MSG_FLAG_EOF: u8 = 0x02;

/// The sender abandoned the message; partial data must be discarded.
pub const MSG_FLAG_CANCELLED: u8 = 0x04;

/// Returns a human-readable name for a protocol tag.
pub fn tag_name(tag: u8) -> &'static str {
    match tag {
        MESSAGE_DATA => "MESSAGE_DATA",
        MESSAGE_WINDOW_OPEN => "MESSAGE_WINDOW_OPEN",
        _ => "UNKNOWN",
    }
}
