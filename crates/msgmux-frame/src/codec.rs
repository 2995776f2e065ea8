use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Length prefix in front of every envelope body.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Envelope header inside the body: protocol tag (1) + channel id (4).
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Default maximum envelope body size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One envelope routed to a channel.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol tag describing the body.
    pub tag: u8,
    /// The channel this envelope belongs to.
    pub channel: u32,
    /// Everything after the envelope header.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(tag: u8, channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            channel,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (length prefix + envelope header + payload).
    pub fn wire_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + ENVELOPE_HEADER_SIZE + self.payload.len()
    }
}

/// Stamp the envelope header into `dst`.
///
/// Channels call this on a freshly allocated buffer and then append
/// message headers and payload behind it.
pub fn put_envelope_header(tag: u8, channel: u32, dst: &mut BytesMut) {
    dst.put_u8(tag);
    dst.put_u32(channel);
}

/// Encode a frame into the wire format.
///
/// Wire format (big-endian):
/// ```text
/// ┌──────────────┬──────────┬────────────┬──────────────────┐
/// │ Length (4B)  │ Tag (1B) │ Channel    │ Payload          │
/// │ tag..payload │          │ (4B)       │                  │
/// └──────────────┴──────────┴────────────┴──────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let body_len = ENVELOPE_HEADER_SIZE + frame.payload.len();
    check_body_len(body_len)?;
    dst.reserve(LENGTH_PREFIX_SIZE + body_len);
    dst.put_u32(body_len as u32);
    put_envelope_header(frame.tag, frame.channel, dst);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Encode a body that already starts with an envelope header.
pub fn encode_body(body: &[u8], dst: &mut BytesMut) -> Result<()> {
    if body.len() < ENVELOPE_HEADER_SIZE {
        return Err(FrameError::Truncated {
            what: "envelope header",
            needed: ENVELOPE_HEADER_SIZE,
            available: body.len(),
        });
    }
    check_body_len(body.len())?;
    dst.reserve(LENGTH_PREFIX_SIZE + body.len());
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
    Ok(())
}

fn check_body_len(len: usize) -> Result<()> {
    if len > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        });
    }
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

    if body_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: body_len,
            max: max_payload,
        });
    }
    if body_len < ENVELOPE_HEADER_SIZE {
        return Err(FrameError::Truncated {
            what: "envelope header",
            needed: ENVELOPE_HEADER_SIZE,
            available: body_len,
        });
    }

    if src.len() < LENGTH_PREFIX_SIZE + body_len {
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    let tag = src.get_u8();
    let channel = src.get_u32();
    let payload = src.split_to(body_len - ENVELOPE_HEADER_SIZE).freeze();

    Ok(Some(Frame {
        tag,
        channel,
        payload,
    }))
}

/// Configuration for the frame reader and writer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum envelope body size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
