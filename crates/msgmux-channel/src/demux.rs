use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

use msgmux_frame::{tag_name, Frame, FrameError, FrameReader, MESSAGE_DATA, MESSAGE_WINDOW_OPEN};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::connection::{Connection, StreamConnection};
use crate::error::{ChannelError, ProtocolViolation, Result};

/// Routes incoming envelopes to channels by channel id.
#[derive(Default)]
pub struct Demultiplexer {
    channels: RwLock<HashMap<u32, Arc<Channel>>>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel`, replacing any channel with the same id.
    pub fn insert(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.id(), channel)
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Hand one envelope to its channel.
    ///
    /// Envelopes for unregistered channels are dropped. An unknown protocol
    /// tag is a protocol violation.
    pub fn dispatch(&self, frame: Frame) -> Result<()> {
        let Some(channel) = self.get(frame.channel) else {
            debug!(
                channel = frame.channel,
                tag = tag_name(frame.tag),
                "dropping envelope for unknown channel"
            );
            return Ok(());
        };
        match frame.tag {
            MESSAGE_DATA => channel.on_fragment_received(frame.payload),
            MESSAGE_WINDOW_OPEN => channel.on_window_update_received(frame.payload),
            other => return Err(ProtocolViolation::UnknownProtocolTag(other).into()),
        }
        Ok(())
    }

    /// Close every registered channel.
    pub fn close_all(&self) {
        for channel in self.snapshot() {
            channel.close();
        }
    }

    /// Fail every registered channel with `reason`.
    pub fn fail_all(&self, reason: &str) {
        for channel in self.snapshot() {
            channel.fail(reason);
        }
    }

    /// Read envelopes from `reader` until the stream ends or the connection
    /// fails.
    ///
    /// A clean end of stream closes every channel and returns `Ok`. Read
    /// errors and fatal errors reported through `connection` fail every
    /// channel and are returned.
    pub fn run<R, W>(&self, reader: &mut FrameReader<R>, connection: &StreamConnection<W>) -> Result<()>
    where
        R: Read,
        W: Write + Send,
    {
        loop {
            if let Some(reason) = connection.failure() {
                warn!(reason = %reason, "connection failed, stopping reader");
                self.fail_all(&reason);
                return Err(ChannelError::ConnectionFailed(reason));
            }

            let frame = match reader.read_frame() {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    info!("connection closed by peer");
                    self.close_all();
                    return Ok(());
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(error = %reason, "connection read failed");
                    connection.fail(reason.clone());
                    self.fail_all(&reason);
                    return Err(err.into());
                }
            };

            if let Err(err) = self.dispatch(frame) {
                connection.report_fatal_error(err);
            }
        }
    }
}

impl std::fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u32> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("Demultiplexer").field("channels", &ids).finish()
    }
}
