//! Headers carried inside channel envelopes.

use bytes::{Buf, BufMut};

use crate::error::{FrameError, Result};
use crate::protocol::{MSG_FLAG_CANCELLED, MSG_FLAG_EOF, MSG_FLAG_NEW};

/// Data fragment header: message id (2) + flags (1).
pub const MESSAGE_HEADER_SIZE: usize = 3;

/// Window update body: message id (2) + credit (4).
pub const WINDOW_UPDATE_SIZE: usize = 6;

/// Largest credit a single window update can carry; the top bit is reserved.
pub const MAX_WINDOW_CREDIT: u32 = 0x7FFF_FFFF;

/// Header in front of every message data fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: u16,
    pub flags: u8,
}

impl MessageHeader {
    pub fn new(id: u16, flags: u8) -> Self {
        Self { id, flags }
    }

    pub fn is_new(&self) -> bool {
        self.flags & MSG_FLAG_NEW != 0
    }

    pub fn is_eof(&self) -> bool {
        self.flags & MSG_FLAG_EOF != 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags & MSG_FLAG_CANCELLED != 0
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.id);
        dst.put_u8(self.flags);
    }

    /// Read the header from the front of `src`, leaving the payload behind.
    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        ensure(&*src, MESSAGE_HEADER_SIZE, "message header")?;
        let id = src.get_u16();
        let flags = src.get_u8();
        Ok(Self { id, flags })
    }
}

/// Credit granted by the receiver of a message back to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub id: u16,
    pub credit: u32,
}

impl WindowUpdate {
    pub fn new(id: u16, credit: u32) -> Self {
        Self {
            id,
            credit: credit & MAX_WINDOW_CREDIT,
        }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.id);
        dst.put_u32(self.credit & MAX_WINDOW_CREDIT);
    }

    /// Decode a window update. The reserved top bit of the credit is masked off.
    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        ensure(&*src, WINDOW_UPDATE_SIZE, "window update")?;
        let id = src.get_u16();
        let credit = src.get_u32() & MAX_WINDOW_CREDIT;
        Ok(Self { id, credit })
    }
}

fn ensure(src: &impl Buf, needed: usize, what: &'static str) -> Result<()> {
    if src.remaining() < needed {
        return Err(FrameError::Truncated {
            what,
            needed,
            available: src.remaining(),
        });
    }
    Ok(())
}
