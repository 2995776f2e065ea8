use std::io;

use msgmux_frame::FrameError;

/// Peer behaviour that makes the connection untrustworthy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// A NEW fragment reused an id that is still open.
    #[error("incoming message with duplicate ID {0:#06x} received")]
    DuplicateMessageId(u16),

    /// A continuation fragment named an id that was never opened.
    #[error("incoming message with unknown ID {0:#06x} received")]
    UnknownMessageId(u16),

    /// The peer sent more unacknowledged data than the inbound window allows.
    #[error("message {id:#06x} exceeded inbound window ({outstanding} bytes outstanding, window {window})")]
    WindowExceeded { id: u16, outstanding: u64, window: u32 },

    /// The peer opened more concurrent messages than allowed.
    #[error("too many concurrent inbound messages (max {max})")]
    TooManyInboundMessages { max: u32 },

    /// A reassembled message grew past the configured limit.
    #[error("message {id:#06x} too large ({size} bytes, max {max})")]
    MessageTooLarge { id: u16, size: usize, max: usize },

    /// An envelope carried a protocol tag this layer does not understand.
    #[error("unknown protocol tag {0:#04x}")]
    UnknownProtocolTag(u8),

    /// A fragment or window update could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Why a channel stopped accepting work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The channel was closed locally or by the peer.
    Closed,
    /// The owning connection failed.
    ConnectionFailed(String),
    /// The message was released from its channel while still being written.
    Released,
}

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No permit or no free message id could be obtained.
    #[error("channel busy: {0}")]
    Busy(String),

    /// The permit wait was cancelled through an [`Interrupt`](crate::Interrupt).
    #[error("interrupted while waiting to write message")]
    Interrupted,

    /// The channel was closed.
    #[error("channel closed")]
    Closed,

    /// The underlying connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// `register_receiver` was called while another receiver is pending.
    #[error("message receiver already registered")]
    ReceiverAlreadyRegistered,

    /// The message was already closed or cancelled.
    #[error("message already closed")]
    MessageClosed,

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Configuration rejected by validation.
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),
}

impl From<FailureCause> for ChannelError {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::Closed => ChannelError::Closed,
            FailureCause::ConnectionFailed(reason) => ChannelError::ConnectionFailed(reason),
            FailureCause::Released => ChannelError::MessageClosed,
        }
    }
}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        let kind = match &err {
            ChannelError::Busy(_) => io::ErrorKind::WouldBlock,
            ChannelError::Interrupted => io::ErrorKind::Interrupted,
            ChannelError::Closed | ChannelError::MessageClosed => io::ErrorKind::BrokenPipe,
            ChannelError::ConnectionFailed(_) => io::ErrorKind::ConnectionAborted,
            ChannelError::Protocol(_) => io::ErrorKind::InvalidData,
            ChannelError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            ChannelError::ReceiverAlreadyRegistered => io::ErrorKind::Other,
            ChannelError::Frame(FrameError::Io(io)) => io.kind(),
            ChannelError::Frame(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
