use std::io::Write;
use std::sync::{Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use msgmux_frame::{FrameConfig, FrameWriter};
use tracing::{debug, error};

use crate::error::{ChannelError, Result};

/// Initial capacity of buffers handed out by [`Connection::allocate`].
const FRAME_CAPACITY: usize = 8 * 1024 + 16;

/// The physical connection shared by every channel.
///
/// Channels only ever allocate envelope buffers, submit finished envelopes,
/// and report errors that make the connection untrustworthy.
pub trait Connection: Send + Sync {
    /// A fresh, empty buffer for one envelope.
    fn allocate(&self) -> BytesMut;

    /// Queue one finished envelope (starting with protocol tag and channel id).
    fn submit(&self, frame: Bytes) -> Result<()>;

    /// Report an error that the connection must act on.
    fn report_fatal_error(&self, error: ChannelError);
}

/// A [`Connection`] writing length-prefixed envelopes to a byte stream.
///
/// The first fatal error is remembered; afterwards every submission fails
/// with [`ChannelError::ConnectionFailed`].
pub struct StreamConnection<W> {
    writer: Mutex<FrameWriter<W>>,
    failure: Mutex<Option<String>>,
}

impl<W: Write + Send> StreamConnection<W> {
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        Self {
            writer: Mutex::new(FrameWriter::with_config(inner, config)),
            failure: Mutex::new(None),
        }
    }

    /// The first fatal error, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the connection failed; only the first reason is kept.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(reason.into());
        }
    }
}

impl<W: Write + Send> Connection for StreamConnection<W> {
    fn allocate(&self) -> BytesMut {
        BytesMut::with_capacity(FRAME_CAPACITY)
    }

    fn submit(&self, frame: Bytes) -> Result<()> {
        if let Some(reason) = self.failure() {
            return Err(ChannelError::ConnectionFailed(reason));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writer.send_body(&frame) {
            let reason = err.to_string();
            debug!(error = %reason, "envelope write failed");
            self.fail(reason.clone());
            return Err(ChannelError::ConnectionFailed(reason));
        }
        Ok(())
    }

    fn report_fatal_error(&self, err: ChannelError) {
        error!(error = %err, "fatal connection error");
        self.fail(err.to_string());
    }
}

impl<W> std::fmt::Debug for StreamConnection<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field(
                "failure",
                &*self.failure.lock().unwrap_or_else(PoisonError::into_inner),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BufMut;
    use msgmux_frame::{decode_frame, put_envelope_header, MESSAGE_DATA};

    use super::*;
    use crate::error::ProtocolViolation;

    #[test]
    fn submit_writes_length_prefixed_envelope() {
        let conn = StreamConnection::new(Cursor::new(Vec::<u8>::new()));
        let mut frame = conn.allocate();
        put_envelope_header(MESSAGE_DATA, 9, &mut frame);
        frame.put_slice(b"abc");

        conn.submit(frame.freeze()).unwrap();

        let bytes = conn.writer.into_inner().unwrap().into_inner().into_inner();
        let mut wire = BytesMut::from(bytes.as_slice());
        let decoded = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(decoded.channel, 9);
        assert_eq!(decoded.payload.as_ref(), b"abc");
    }

    #[test]
    fn fatal_error_blocks_further_submissions() {
        let conn = StreamConnection::new(Cursor::new(Vec::<u8>::new()));
        conn.report_fatal_error(ProtocolViolation::UnknownMessageId(4).into());
        conn.report_fatal_error(ChannelError::Closed);

        let failure = conn.failure().unwrap();
        assert!(failure.contains("unknown ID"), "{failure}");

        let mut frame = conn.allocate();
        put_envelope_header(MESSAGE_DATA, 1, &mut frame);
        let err = conn.submit(frame.freeze()).unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionFailed(_)));
    }

    #[test]
    fn write_failure_marks_connection_failed() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let conn = StreamConnection::new(Broken);
        let mut frame = conn.allocate();
        put_envelope_header(MESSAGE_DATA, 1, &mut frame);

        assert!(conn.submit(frame.freeze()).is_err());
        assert!(conn.failure().is_some());
    }
}
