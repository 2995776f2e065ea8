//! Multiplexed, flow-controlled message channels over one connection.
//!
//! # Crate Structure
//!
//! - [`frame`]: Length-prefixed envelopes, message-data and window-update bodies
//! - [`channel`]: Channels, outbound/inbound messages, flow control and demultiplexing

/// Re-export frame types.
pub mod frame {
    pub use msgmux_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use msgmux_channel::*;
}
