use bytes::Bytes;

use crate::error::ChannelError;

/// One-shot consumer of the next complete inbound message on a channel.
///
/// Exactly one receiver may be pending per channel. It is consumed by the
/// first of: a delivered message, the channel closing, or the connection
/// failing. Callbacks run on the thread that delivered the final fragment
/// (usually the connection reader), without any channel lock held, so a
/// receiver may register its successor from inside `handle_message`.
pub trait Receiver: Send + 'static {
    fn handle_message(self: Box<Self>, message: Bytes);

    /// The channel closed before a message arrived.
    fn handle_end(self: Box<Self>) {}

    /// The connection failed before a message arrived.
    fn handle_error(self: Box<Self>, error: ChannelError) {
        let _ = error;
    }
}

impl<F> Receiver for F
where
    F: FnOnce(Bytes) + Send + 'static,
{
    fn handle_message(self: Box<Self>, message: Bytes) {
        (*self)(message)
    }
}
