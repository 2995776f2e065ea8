//! Multiplexed, flow-controlled message channels.
//!
//! A [`Channel`] carries many concurrent logical messages over one shared
//! [`Connection`]. Each outbound message gets a random even id, a send
//! window that the peer replenishes with window updates, and one of a
//! bounded number of send permits. Inbound fragments are reassembled per id
//! and handed to the registered [`Receiver`].
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//!
//! use msgmux_channel::{Channel, ChannelConfig, StreamConnection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = UnixStream::connect("/tmp/peer.sock")?;
//! let connection = Arc::new(StreamConnection::new(stream));
//! let channel = Channel::new(1, connection, ChannelConfig::default())?;
//!
//! let mut message = channel.open_outbound_message()?;
//! message.write_all(b"hello")?;
//! message.close()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod demux;
pub mod error;
pub mod id_alloc;
mod inbound;
pub mod interrupt;
pub mod outbound;
pub mod receiver;

pub use channel::Channel;
pub use config::ChannelConfig;
pub use connection::{Connection, StreamConnection};
pub use demux::Demultiplexer;
pub use error::{ChannelError, FailureCause, ProtocolViolation, Result};
pub use id_alloc::{allocate_id, MAX_ALLOCATION_ATTEMPTS, MESSAGE_ID_MASK};
pub use interrupt::Interrupt;
pub use outbound::MessageWriter;
pub use receiver::Receiver;
