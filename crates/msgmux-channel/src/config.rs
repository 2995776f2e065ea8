use std::time::Duration;

use msgmux_frame::{DEFAULT_MAX_PAYLOAD, MAX_WINDOW_CREDIT};

use crate::error::{ChannelError, Result};

/// Per-channel flow-control and concurrency limits.
///
/// Both ends of a channel must agree on the windows: the sender's
/// `outbound_window` may not exceed the receiver's `inbound_window`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Initial send window of each outbound message, in bytes.
    pub outbound_window: u32,
    /// Unacknowledged bytes the peer may have in flight per inbound message.
    pub inbound_window: u32,
    /// Send permits: how many outbound messages may be open at once.
    pub max_outbound_messages: u32,
    /// How many inbound messages may be open or waiting for a receiver at once.
    pub max_inbound_messages: u32,
    /// Largest payload carried by one data fragment.
    pub max_fragment_size: usize,
    /// Completed messages buffered while no receiver is registered.
    pub max_queued_messages: usize,
    /// Largest reassembled inbound message.
    pub max_inbound_message_size: usize,
    /// Optional bound on waiting for a send permit.
    pub permit_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_window: 64 * 1024,
            inbound_window: 64 * 1024,
            max_outbound_messages: 16,
            max_inbound_messages: 16,
            max_fragment_size: 8 * 1024,
            max_queued_messages: 16,
            max_inbound_message_size: DEFAULT_MAX_PAYLOAD,
            permit_timeout: None,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, window) in [
            ("outbound_window", self.outbound_window),
            ("inbound_window", self.inbound_window),
        ] {
            if window == 0 || window > MAX_WINDOW_CREDIT {
                return Err(ChannelError::InvalidConfig(format!(
                    "{name} must be in 1..={MAX_WINDOW_CREDIT}, got {window}"
                )));
            }
        }
        if self.max_outbound_messages == 0 {
            return Err(ChannelError::InvalidConfig(
                "max_outbound_messages must be at least 1".to_string(),
            ));
        }
        if self.max_inbound_messages == 0 {
            return Err(ChannelError::InvalidConfig(
                "max_inbound_messages must be at least 1".to_string(),
            ));
        }
        if self.max_fragment_size == 0 || self.max_fragment_size > MAX_WINDOW_CREDIT as usize {
            return Err(ChannelError::InvalidConfig(format!(
                "max_fragment_size must be in 1..={MAX_WINDOW_CREDIT}, got {}",
                self.max_fragment_size
            )));
        }
        Ok(())
    }
}
