use bytes::{Bytes, BytesMut};
use msgmux_frame::MessageHeader;

use crate::config::ChannelConfig;
use crate::error::ProtocolViolation;

/// Outcome of feeding one data fragment to an [`InboundMessage`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The payload was buffered; this many bytes of credit are owed to the peer.
    Partial(u32),
    /// The terminal fragment arrived; the reassembled message.
    Complete(Bytes),
    /// The peer abandoned the message.
    Cancelled,
}

/// Reassembly state of one message the peer is sending.
#[derive(Debug)]
pub(crate) struct InboundMessage {
    id: u16,
    buf: BytesMut,
    /// Bytes received but not yet credited back.
    outstanding: u64,
    /// Credit held back while the channel's ready queue is full.
    deferred: u32,
}

impl InboundMessage {
    pub(crate) fn new(id: u16) -> Self {
        Self {
            id,
            buf: BytesMut::new(),
            outstanding: 0,
            deferred: 0,
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn handle_fragment(
        &mut self,
        header: MessageHeader,
        payload: &[u8],
        config: &ChannelConfig,
    ) -> Result<Progress, ProtocolViolation> {
        if header.is_cancelled() {
            return Ok(Progress::Cancelled);
        }

        self.outstanding += payload.len() as u64;
        if self.outstanding > u64::from(config.inbound_window) {
            return Err(ProtocolViolation::WindowExceeded {
                id: self.id,
                outstanding: self.outstanding,
                window: config.inbound_window,
            });
        }

        let size = self.buf.len() + payload.len();
        if size > config.max_inbound_message_size {
            return Err(ProtocolViolation::MessageTooLarge {
                id: self.id,
                size,
                max: config.max_inbound_message_size,
            });
        }
        self.buf.extend_from_slice(payload);

        if header.is_eof() {
            return Ok(Progress::Complete(self.buf.split().freeze()));
        }
        Ok(Progress::Partial(payload.len() as u32))
    }

    /// Record that `credit` bytes were returned to the peer.
    pub(crate) fn release_credit(&mut self, credit: u32) {
        self.outstanding = self.outstanding.saturating_sub(u64::from(credit));
    }

    pub(crate) fn defer(&mut self, credit: u32) {
        self.deferred = self.deferred.saturating_add(credit);
    }

    /// Take the held-back credit, counting it as returned.
    pub(crate) fn take_deferred(&mut self) -> u32 {
        let credit = std::mem::take(&mut self.deferred);
        self.release_credit(credit);
        credit
    }
}
