//! Outbound messages: send window and the writable message stream.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, BytesMut};
use msgmux_frame::{MessageHeader, MESSAGE_DATA, MSG_FLAG_CANCELLED, MSG_FLAG_EOF, MSG_FLAG_NEW};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::error::{ChannelError, FailureCause, Result};

/// Send window of one outbound message.
///
/// Shared between the channel's outbound table (which feeds it window
/// updates) and the [`MessageWriter`] (which spends it). Waiting for window
/// space only touches this message's own lock.
pub(crate) struct OutboundWindow {
    id: u16,
    state: Mutex<WindowState>,
    window_open: Condvar,
}

struct WindowState {
    available: u32,
    failure: Option<FailureCause>,
}

impl OutboundWindow {
    pub(crate) fn new(id: u16, window: u32) -> Self {
        Self {
            id,
            state: Mutex::new(WindowState {
                available: window,
                failure: None,
            }),
            window_open: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grow the window by `credit` bytes and wake a blocked writer.
    pub(crate) fn acknowledge(&self, credit: u32) {
        let mut state = self.lock();
        state.available = state.available.saturating_add(credit);
        trace!(message_id = self.id, credit, available = state.available, "window opened");
        self.window_open.notify_all();
    }

    /// Fail the message; blocked and future writes return `cause`.
    pub(crate) fn fail(&self, cause: FailureCause) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(cause);
        }
        self.window_open.notify_all();
    }

    pub(crate) fn available(&self) -> u32 {
        self.lock().available
    }

    fn check(&self) -> Result<()> {
        match &self.lock().failure {
            Some(cause) => Err(cause.clone().into()),
            None => Ok(()),
        }
    }

    fn is_failed(&self) -> bool {
        self.lock().failure.is_some()
    }

    /// Block until at least one byte of window is available, then take up
    /// to `wanted` bytes of it.
    fn reserve(&self, wanted: usize) -> Result<usize> {
        let mut state = self.lock();
        loop {
            if let Some(cause) = &state.failure {
                return Err(cause.clone().into());
            }
            if state.available > 0 {
                let granted = wanted.min(state.available as usize);
                state.available -= granted as u32;
                return Ok(granted);
            }
            trace!(message_id = self.id, "waiting for window space");
            state = self
                .window_open
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Writable stream for one outbound message.
///
/// Bytes are buffered into fragments of at most the channel's
/// `max_fragment_size` and sent as window space allows; `write` blocks
/// while the window is exhausted. [`close`](MessageWriter::close) sends
/// the terminal fragment. Dropping an unfinished writer cancels the
/// message. Either way the send permit returns to the channel.
pub struct MessageWriter {
    channel: Arc<Channel>,
    window: Arc<OutboundWindow>,
    buf: BytesMut,
    max_fragment: usize,
    started: bool,
    finished: bool,
}

impl MessageWriter {
    pub(crate) fn new(channel: Arc<Channel>, window: Arc<OutboundWindow>) -> Self {
        let max_fragment = channel.config().max_fragment_size;
        Self {
            channel,
            window,
            buf: BytesMut::new(),
            max_fragment,
            started: false,
            finished: false,
        }
    }

    /// The message id allocated for this message.
    pub fn id(&self) -> u16 {
        self.window.id()
    }

    /// Send window currently available, in bytes.
    pub fn available_window(&self) -> u32 {
        self.window.available()
    }

    /// Flush buffered bytes, send the terminal fragment, and release the message.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    /// Abandon the message. The peer discards whatever it received.
    pub fn cancel(mut self) {
        self.abort();
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(ChannelError::MessageClosed);
        }
        let result = self.send_buffered(true);
        self.finished = true;
        self.buf.clear();
        self.channel.release_outbound(&self.window);
        debug!(
            channel = self.channel.id(),
            message_id = self.id(),
            ok = result.is_ok(),
            "closed outbound message"
        );
        result
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.buf.clear();
        if self.started && !self.window.is_failed() {
            if let Err(err) = self.send_fragment(&[], MSG_FLAG_EOF | MSG_FLAG_CANCELLED) {
                debug!(message_id = self.id(), error = %err, "failed to send cancel fragment");
            }
        }
        self.channel.release_outbound(&self.window);
        debug!(
            channel = self.channel.id(),
            message_id = self.id(),
            "cancelled outbound message"
        );
    }

    /// Send everything buffered. With `eof`, the last fragment (possibly
    /// empty) carries the EOF flag.
    fn send_buffered(&mut self, eof: bool) -> Result<()> {
        loop {
            if self.buf.is_empty() {
                if eof {
                    self.send_fragment(&[], MSG_FLAG_EOF)?;
                }
                return Ok(());
            }
            self.send_one(self.buf.len().min(self.max_fragment), eof)?;
            if eof && self.buf.is_empty() {
                return Ok(());
            }
        }
    }

    /// Send up to `wanted` buffered bytes as one fragment, waiting for window.
    fn send_one(&mut self, wanted: usize, eof: bool) -> Result<()> {
        let granted = self.window.reserve(wanted)?;
        let chunk = self.buf.split_to(granted);
        let flags = if eof && self.buf.is_empty() {
            MSG_FLAG_EOF
        } else {
            0
        };
        self.send_fragment(&chunk, flags)
    }

    fn send_fragment(&mut self, payload: &[u8], mut flags: u8) -> Result<()> {
        if !self.started {
            flags |= MSG_FLAG_NEW;
        }
        let mut frame = self.channel.frame_allocate(MESSAGE_DATA);
        MessageHeader::new(self.id(), flags).encode(&mut frame);
        frame.put_slice(payload);
        trace!(
            channel = self.channel.id(),
            message_id = self.id(),
            flags,
            len = payload.len(),
            "sending fragment"
        );
        if let Err(err) = self.channel.submit(frame.freeze()) {
            self.window
                .fail(FailureCause::ConnectionFailed(err.to_string()));
            return Err(err);
        }
        self.started = true;
        Ok(())
    }
}

impl io::Write for MessageWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(ChannelError::MessageClosed.into());
        }
        self.window.check()?;
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.max_fragment {
            self.send_one(self.max_fragment, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.finished {
            return Err(ChannelError::MessageClosed.into());
        }
        self.send_buffered(false)?;
        Ok(())
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("channel", &self.channel.id())
            .field("id", &self.id())
            .field("buffered", &self.buf.len())
            .field("finished", &self.finished)
            .finish()
    }
}
