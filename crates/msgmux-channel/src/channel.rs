use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use msgmux_frame::{put_envelope_header, MessageHeader, WindowUpdate, MESSAGE_WINDOW_OPEN};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use crate::config::ChannelConfig;
use crate::connection::Connection;
use crate::error::{ChannelError, FailureCause, ProtocolViolation, Result};
use crate::id_alloc::{allocate_id, MAX_ALLOCATION_ATTEMPTS};
use crate::inbound::{InboundMessage, Progress};
use crate::interrupt::Interrupt;
use crate::outbound::{MessageWriter, OutboundWindow};
use crate::receiver::Receiver;

/// One multiplexed channel over a shared [`Connection`].
///
/// The outbound table, the inbound table and the send-permit counter live
/// under a single mutex. Opening an outbound message is the only operation
/// that blocks on it, waiting for a permit; writers waiting for window space
/// block on their own message instead.
pub struct Channel {
    id: u32,
    connection: Arc<dyn Connection>,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    permit_available: Condvar,
}

struct ChannelState {
    outbound: HashMap<u16, Arc<OutboundWindow>>,
    inbound: HashMap<u16, InboundMessage>,
    permits: u32,
    /// Tickets of threads waiting for a permit, oldest first.
    permit_queue: VecDeque<u64>,
    next_ticket: u64,
    receiver: Option<Box<dyn Receiver>>,
    /// Completed messages waiting for a receiver.
    ready: VecDeque<Bytes>,
    failure: Option<FailureCause>,
    rng: StdRng,
}

/// Work decided under the lock and carried out after releasing it.
enum Action {
    Nothing,
    Credit(u16, u32),
    Deliver(Box<dyn Receiver>, Bytes),
    Violation(ProtocolViolation),
}

impl Channel {
    pub fn new(id: u32, connection: Arc<dyn Connection>, config: ChannelConfig) -> Result<Arc<Self>> {
        Self::with_rng(id, connection, config, StdRng::from_os_rng())
    }

    /// Like [`Channel::new`] with a caller-supplied id generator.
    pub fn with_rng(
        id: u32,
        connection: Arc<dyn Connection>,
        config: ChannelConfig,
        rng: StdRng,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let state = ChannelState {
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            permits: config.max_outbound_messages,
            permit_queue: VecDeque::new(),
            next_ticket: 0,
            receiver: None,
            ready: VecDeque::new(),
            failure: None,
            rng,
        };
        debug!(channel = id, "channel opened");
        Ok(Arc::new(Self {
            id,
            connection,
            config,
            state: Mutex::new(state),
            permit_available: Condvar::new(),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new outbound message, blocking until a send permit is free.
    ///
    /// Fails with [`ChannelError::Busy`] if `permit_timeout` expires or no
    /// unused message id turns up; in the latter case the permit stays
    /// consumed.
    pub fn open_outbound_message(self: &Arc<Self>) -> Result<MessageWriter> {
        self.open(None)
    }

    /// Like [`open_outbound_message`](Channel::open_outbound_message), but
    /// the permit wait fails with [`ChannelError::Interrupted`] once
    /// `interrupt` is triggered. The interrupt flag is left set.
    pub fn open_outbound_message_interruptible(
        self: &Arc<Self>,
        interrupt: &Interrupt,
    ) -> Result<MessageWriter> {
        self.open(Some(interrupt))
    }

    fn open(self: &Arc<Self>, interrupt: Option<&Interrupt>) -> Result<MessageWriter> {
        let _registration = interrupt.map(|interrupt| {
            let channel = Arc::downgrade(self);
            interrupt.register(Arc::new(move || {
                if let Some(channel) = channel.upgrade() {
                    let _state = channel.lock();
                    channel.permit_available.notify_all();
                }
            }))
        });

        let mut state = self.acquire_permit(interrupt)?;
        let ChannelState { rng, outbound, .. } = &mut *state;
        let Some(id) = allocate_id(rng, |id| outbound.contains_key(&id)) else {
            warn!(
                channel = self.id,
                attempts = MAX_ALLOCATION_ATTEMPTS,
                "failed to allocate a message id"
            );
            return Err(ChannelError::Busy(
                "failed to send a message (channel is busy)".to_string(),
            ));
        };
        let window = Arc::new(OutboundWindow::new(id, self.config.outbound_window));
        outbound.insert(id, Arc::clone(&window));
        drop(state);

        debug!(channel = self.id, message_id = id, "opened outbound message");
        Ok(MessageWriter::new(Arc::clone(self), window))
    }

    /// Wait in FIFO order for a permit and return the locked state with the
    /// permit already taken.
    fn acquire_permit(&self, interrupt: Option<&Interrupt>) -> Result<MutexGuard<'_, ChannelState>> {
        let deadline = self.config.permit_timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.permit_queue.push_back(ticket);

        loop {
            if let Some(cause) = state.failure.clone() {
                self.leave_queue(&mut state, ticket);
                return Err(cause.into());
            }
            if state.permits > 0 && state.permit_queue.front() == Some(&ticket) {
                state.permit_queue.pop_front();
                state.permits -= 1;
                if state.permits > 0 && !state.permit_queue.is_empty() {
                    self.permit_available.notify_all();
                }
                return Ok(state);
            }
            if interrupt.is_some_and(Interrupt::is_interrupted) {
                self.leave_queue(&mut state, ticket);
                debug!(channel = self.id, "permit wait interrupted");
                return Err(ChannelError::Interrupted);
            }

            state = match deadline {
                None => self
                    .permit_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.leave_queue(&mut state, ticket);
                        return Err(ChannelError::Busy(
                            "timed out waiting for a send permit".to_string(),
                        ));
                    }
                    self.permit_available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn leave_queue(&self, state: &mut ChannelState, ticket: u64) {
        state.permit_queue.retain(|&queued| queued != ticket);
        self.permit_available.notify_all();
    }

    /// Remove `window` from the outbound table and return its permit.
    ///
    /// A no-op if the entry was already released or the channel failed.
    pub(crate) fn release_outbound(&self, window: &Arc<OutboundWindow>) -> bool {
        let id = window.id();
        let mut state = self.lock();
        let owned = state
            .outbound
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, window));
        if !owned {
            return false;
        }
        state.outbound.remove(&id);
        if state.failure.is_none() {
            state.permits += 1;
            self.permit_available.notify_all();
        }
        true
    }

    /// Forcibly release an outbound message, returning its permit.
    ///
    /// Its writer, if still alive, fails with
    /// [`ChannelError::MessageClosed`]. Returns false for unknown ids.
    pub fn release_outbound_message(&self, id: u16) -> bool {
        let window = self.lock().outbound.get(&id).cloned();
        match window {
            Some(window) => {
                window.fail(FailureCause::Released);
                self.release_outbound(&window)
            }
            None => false,
        }
    }

    /// Discard a partially received message.
    pub fn release_inbound_message(&self, id: u16) -> bool {
        let released = self.lock().inbound.remove(&id).is_some();
        if released {
            debug!(channel = self.id, message_id = id, "released inbound message");
        }
        released
    }

    /// Register the consumer of the next complete inbound message.
    ///
    /// If a message is already queued it is handed over immediately, on the
    /// calling thread.
    pub fn register_receiver<R: Receiver>(&self, receiver: R) -> Result<()> {
        let (pending, credits) = {
            let mut state = self.lock();
            if let Some(cause) = &state.failure {
                return Err(cause.clone().into());
            }
            if state.receiver.is_some() {
                return Err(ChannelError::ReceiverAlreadyRegistered);
            }
            let pending = match state.ready.pop_front() {
                Some(message) => Some((receiver, message)),
                None => {
                    state.receiver = Some(Box::new(receiver));
                    None
                }
            };
            let credits = if self.credit_blocked(&state) {
                Vec::new()
            } else {
                state
                    .inbound
                    .values_mut()
                    .filter_map(|message| {
                        let credit = message.take_deferred();
                        (credit > 0).then(|| (message.id(), credit))
                    })
                    .collect()
            };
            (pending, credits)
        };

        for (id, credit) in credits {
            self.send_window_update(id, credit);
        }
        if let Some((receiver, message)) = pending {
            Box::new(receiver).handle_message(message);
        }
        Ok(())
    }

    /// While no receiver waits and the ready queue is full, fragment credit
    /// is withheld.
    fn credit_blocked(&self, state: &ChannelState) -> bool {
        state.receiver.is_none() && state.ready.len() >= self.config.max_queued_messages
    }

    /// Handle one message-data body (envelope header already stripped).
    pub fn on_fragment_received(&self, fragment: Bytes) {
        let mut payload = fragment;
        let header = match MessageHeader::decode(&mut payload) {
            Ok(header) => header,
            Err(err) => {
                self.report_violation(ProtocolViolation::Malformed(err.to_string()));
                return;
            }
        };
        trace!(
            channel = self.id,
            message_id = header.id,
            flags = header.flags,
            len = payload.len(),
            "fragment received"
        );

        let action = {
            let mut state = self.lock();
            if state.failure.is_some() {
                trace!(channel = self.id, "dropping fragment for failed channel");
                return;
            }
            self.accept_fragment(&mut state, header, &payload)
        };

        match action {
            Action::Nothing => {}
            Action::Credit(id, credit) => self.send_window_update(id, credit),
            Action::Deliver(receiver, message) => receiver.handle_message(message),
            Action::Violation(violation) => self.report_violation(violation),
        }
    }

    fn accept_fragment(
        &self,
        state: &mut ChannelState,
        header: MessageHeader,
        payload: &[u8],
    ) -> Action {
        let id = header.id;
        if header.is_new() {
            if state.inbound.contains_key(&id) {
                return Action::Violation(ProtocolViolation::DuplicateMessageId(id));
            }
            // Completed messages still waiting for a receiver keep their slot.
            if state.inbound.len() + state.ready.len() >= self.config.max_inbound_messages as usize {
                return Action::Violation(ProtocolViolation::TooManyInboundMessages {
                    max: self.config.max_inbound_messages,
                });
            }
            state.inbound.insert(id, InboundMessage::new(id));
        }

        let blocked = self.credit_blocked(state);
        let Some(message) = state.inbound.get_mut(&id) else {
            return Action::Violation(ProtocolViolation::UnknownMessageId(id));
        };
        match message.handle_fragment(header, payload, &self.config) {
            Err(violation) => {
                state.inbound.remove(&id);
                Action::Violation(violation)
            }
            Ok(Progress::Partial(0)) => Action::Nothing,
            Ok(Progress::Partial(credit)) if blocked => {
                message.defer(credit);
                trace!(channel = self.id, message_id = id, credit, "credit deferred");
                Action::Nothing
            }
            Ok(Progress::Partial(credit)) => {
                message.release_credit(credit);
                Action::Credit(id, credit)
            }
            Ok(Progress::Complete(body)) => {
                state.inbound.remove(&id);
                debug!(channel = self.id, message_id = id, len = body.len(), "inbound message complete");
                match state.receiver.take() {
                    Some(receiver) => Action::Deliver(receiver, body),
                    None => {
                        state.ready.push_back(body);
                        Action::Nothing
                    }
                }
            }
            Ok(Progress::Cancelled) => {
                state.inbound.remove(&id);
                debug!(channel = self.id, message_id = id, "inbound message cancelled");
                Action::Nothing
            }
        }
    }

    /// Handle one window-update body (envelope header already stripped).
    ///
    /// Updates for messages that are no longer open are ignored.
    pub fn on_window_update_received(&self, update: Bytes) {
        let mut body = update;
        let update = match WindowUpdate::decode(&mut body) {
            Ok(update) => update,
            Err(err) => {
                self.report_violation(ProtocolViolation::Malformed(err.to_string()));
                return;
            }
        };
        let window = self.lock().outbound.get(&update.id).cloned();
        match window {
            Some(window) => window.acknowledge(update.credit),
            None => trace!(
                channel = self.id,
                message_id = update.id,
                "ignoring window update for unknown message"
            ),
        }
    }

    /// A fresh envelope buffer from the connection, stamped with `tag` and
    /// this channel's id.
    pub fn frame_allocate(&self, tag: u8) -> BytesMut {
        let mut frame = self.connection.allocate();
        put_envelope_header(tag, self.id, &mut frame);
        frame
    }

    pub(crate) fn submit(&self, frame: Bytes) -> Result<()> {
        self.connection.submit(frame)
    }

    fn send_window_update(&self, id: u16, credit: u32) {
        let mut frame = self.frame_allocate(MESSAGE_WINDOW_OPEN);
        WindowUpdate::new(id, credit).encode(&mut frame);
        trace!(channel = self.id, message_id = id, credit, "sending window update");
        if let Err(err) = self.submit(frame.freeze()) {
            debug!(channel = self.id, message_id = id, error = %err, "failed to send window update");
        }
    }

    fn report_violation(&self, violation: ProtocolViolation) {
        warn!(channel = self.id, error = %violation, "protocol violation");
        self.connection.report_fatal_error(violation.into());
    }

    /// Close the channel. Blocked writers and permit waiters fail with
    /// [`ChannelError::Closed`]; a pending receiver gets `handle_end`.
    pub fn close(&self) {
        self.shut_down(FailureCause::Closed);
    }

    /// Fail the channel after a connection error. A pending receiver gets
    /// `handle_error`.
    pub fn fail(&self, reason: impl Into<String>) {
        self.shut_down(FailureCause::ConnectionFailed(reason.into()));
    }

    fn shut_down(&self, cause: FailureCause) {
        let (windows, receiver) = {
            let mut state = self.lock();
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(cause.clone());
            state.permits = 0;
            state.inbound.clear();
            state.ready.clear();
            let windows: Vec<_> = state.outbound.drain().map(|(_, window)| window).collect();
            self.permit_available.notify_all();
            (windows, state.receiver.take())
        };
        debug!(channel = self.id, cause = ?cause, open = windows.len(), "channel shut down");

        for window in windows {
            window.fail(cause.clone());
        }
        if let Some(receiver) = receiver {
            match cause {
                FailureCause::Closed => receiver.handle_end(),
                other => receiver.handle_error(other.into()),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().failure.is_some()
    }

    pub fn available_permits(&self) -> u32 {
        self.lock().permits
    }

    pub fn open_outbound_count(&self) -> usize {
        self.lock().outbound.len()
    }

    pub fn open_inbound_count(&self) -> usize {
        self.lock().inbound.len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use msgmux_frame::{MESSAGE_DATA, MSG_FLAG_CANCELLED, MSG_FLAG_EOF, MSG_FLAG_NEW};

    use super::*;
    use crate::id_alloc::MESSAGE_ID_MASK;
    use crate::testing::{
        data_fragment, data_fragments, split_envelope, window_update, window_updates,
        RecordingConnection,
    };

    const WAIT: Duration = Duration::from_secs(5);
    const SETTLE: Duration = Duration::from_millis(150);

    fn channel_with(config: ChannelConfig) -> (Arc<Channel>, Arc<RecordingConnection>) {
        let conn = Arc::new(RecordingConnection::default());
        let channel =
            Channel::with_rng(7, conn.clone(), config, StdRng::seed_from_u64(42)).unwrap();
        (channel, conn)
    }

    fn permits(max: u32) -> ChannelConfig {
        ChannelConfig {
            max_outbound_messages: max,
            ..ChannelConfig::default()
        }
    }

    fn queued_waiters(channel: &Channel) -> usize {
        channel.lock().permit_queue.len()
    }

    fn wait_for_waiters(channel: &Channel, count: usize) {
        let deadline = Instant::now() + WAIT;
        while queued_waiters(channel) < count {
            assert!(Instant::now() < deadline, "waiters never queued");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let conn = Arc::new(RecordingConnection::default());
        let err = Channel::new(1, conn, permits(0)).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfig(_)));
    }

    #[test]
    fn allocated_ids_are_distinct_and_even() {
        let (channel, _conn) = channel_with(permits(64));
        let writers: Vec<_> = (0..64)
            .map(|_| channel.open_outbound_message().unwrap())
            .collect();

        let ids: HashSet<u16> = writers.iter().map(MessageWriter::id).collect();
        assert_eq!(ids.len(), 64);
        assert!(ids.iter().all(|id| id & !MESSAGE_ID_MASK == 0));
        assert_eq!(channel.available_permits(), 0);
    }

    #[test]
    fn extra_open_blocks_until_release() {
        let (channel, _conn) = channel_with(permits(2));
        let first = channel.open_outbound_message().unwrap();
        let _second = channel.open_outbound_message().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || tx.send(channel.open_outbound_message().map(|w| w.id())).unwrap())
        };

        assert!(rx.recv_timeout(SETTLE).is_err());
        assert_eq!(channel.open_outbound_count(), 2);

        first.close().unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        waiter.join().unwrap();
    }

    #[test]
    fn released_permit_goes_to_earliest_waiter() {
        let (channel, _conn) = channel_with(permits(1));
        let held = channel.open_outbound_message().unwrap();
        let (tx, rx) = mpsc::channel();

        let spawn_waiter = |label: &'static str| {
            let channel = Arc::clone(&channel);
            let tx = tx.clone();
            let (release_tx, release_rx) = mpsc::channel::<()>();
            let handle = thread::spawn(move || {
                let writer = channel.open_outbound_message().unwrap();
                tx.send(label).unwrap();
                release_rx.recv().unwrap();
                writer.close().unwrap();
            });
            (handle, release_tx)
        };

        let (a, release_a) = spawn_waiter("a");
        wait_for_waiters(&channel, 1);
        let (b, release_b) = spawn_waiter("b");
        wait_for_waiters(&channel, 2);

        held.close().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "a");
        assert!(rx.recv_timeout(SETTLE).is_err());

        release_a.send(()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "b");
        release_b.send(()).unwrap();

        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(channel.available_permits(), 1);
    }

    #[test]
    fn interrupt_aborts_permit_wait() {
        let (channel, _conn) = channel_with(permits(1));
        let _held = channel.open_outbound_message().unwrap();
        let interrupt = Interrupt::new();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let channel = Arc::clone(&channel);
            let interrupt = interrupt.clone();
            thread::spawn(move || {
                let result = channel.open_outbound_message_interruptible(&interrupt);
                tx.send(result.map(|w| w.id())).unwrap();
            })
        };

        wait_for_waiters(&channel, 1);
        interrupt.interrupt();

        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(result, Err(ChannelError::Interrupted)));
        assert!(interrupt.is_interrupted());
        waiter.join().unwrap();
        assert_eq!(queued_waiters(&channel), 0);
    }

    #[test]
    fn permit_timeout_reports_busy() {
        let config = ChannelConfig {
            max_outbound_messages: 1,
            permit_timeout: Some(Duration::from_millis(50)),
            ..ChannelConfig::default()
        };
        let (channel, _conn) = channel_with(config);
        let _held = channel.open_outbound_message().unwrap();

        let err = channel.open_outbound_message().unwrap_err();
        assert!(matches!(err, ChannelError::Busy(_)));
        assert_eq!(queued_waiters(&channel), 0);
    }

    #[test]
    fn busy_when_every_id_is_taken() {
        let (channel, _conn) = channel_with(permits(4));
        {
            let mut state = channel.lock();
            for id in (0..=u16::MAX).filter(|id| id & !MESSAGE_ID_MASK == 0) {
                state
                    .outbound
                    .insert(id, Arc::new(OutboundWindow::new(id, 1)));
            }
        }

        let err = channel.open_outbound_message().unwrap_err();
        assert!(matches!(err, ChannelError::Busy(_)));
        assert_eq!(channel.available_permits(), 3);
    }

    #[test]
    fn close_unblocks_permit_waiters() {
        let (channel, _conn) = channel_with(permits(1));
        let _held = channel.open_outbound_message().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || tx.send(channel.open_outbound_message().map(|w| w.id())).unwrap())
        };
        wait_for_waiters(&channel, 1);

        channel.close();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(ChannelError::Closed)));
        waiter.join().unwrap();
        assert!(matches!(
            channel.open_outbound_message().unwrap_err(),
            ChannelError::Closed
        ));
    }

    #[test]
    fn close_unblocks_window_waiters() {
        let config = ChannelConfig {
            outbound_window: 1,
            max_fragment_size: 1,
            ..ChannelConfig::default()
        };
        let (channel, _conn) = channel_with(config);
        let mut writer = channel.open_outbound_message().unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || tx.send(writer.write_all(b"ab")).unwrap());

        assert!(rx.recv_timeout(SETTLE).is_err());
        channel.close();

        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        handle.join().unwrap();
    }

    #[test]
    fn fail_reports_connection_failure_to_writers() {
        let (channel, _conn) = channel_with(ChannelConfig::default());
        let mut writer = channel.open_outbound_message().unwrap();
        channel.fail("peer reset");

        let err = writer.write(b"x").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
        assert_eq!(channel.available_permits(), 0);
    }

    #[test]
    fn release_returns_exactly_one_permit() {
        let (channel, _conn) = channel_with(permits(2));
        let writer = channel.open_outbound_message().unwrap();
        let id = writer.id();
        assert_eq!(channel.available_permits(), 1);

        assert!(channel.release_outbound_message(id));
        assert!(!channel.release_outbound_message(id));
        drop(writer);
        assert_eq!(channel.available_permits(), 2);
    }

    #[test]
    fn frame_allocate_stamps_envelope_header() {
        let (channel, _conn) = channel_with(ChannelConfig::default());
        let frame = channel.frame_allocate(MESSAGE_DATA).freeze();

        let (tag, channel_id, body) = split_envelope(&frame);
        assert_eq!(tag, MESSAGE_DATA);
        assert_eq!(channel_id, 7);
        assert!(body.is_empty());
    }

    #[test]
    fn partial_fragments_are_credited() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(data_fragment(8, MSG_FLAG_NEW, b"abc"));
        channel.on_fragment_received(data_fragment(8, 0, b"de"));

        let updates = window_updates(&conn.take_frames());
        let credits: Vec<(u16, u32)> = updates.iter().map(|u| (u.id, u.credit)).collect();
        assert_eq!(credits, vec![(8, 3), (8, 2)]);
        assert_eq!(channel.open_inbound_count(), 1);
    }

    #[test]
    fn completed_message_goes_to_receiver() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        let (tx, rx) = mpsc::channel();
        channel
            .register_receiver(move |message: Bytes| tx.send(message).unwrap())
            .unwrap();

        channel.on_fragment_received(data_fragment(8, MSG_FLAG_NEW, b"hel"));
        channel.on_fragment_received(data_fragment(8, MSG_FLAG_EOF, b"lo"));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_ref(), b"hello");
        assert_eq!(channel.open_inbound_count(), 0);
        assert!(conn.errors().is_empty());
    }

    #[test]
    fn queued_messages_are_delivered_in_order() {
        let (channel, _conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_NEW | MSG_FLAG_EOF, b"one"));
        channel.on_fragment_received(data_fragment(4, MSG_FLAG_NEW | MSG_FLAG_EOF, b"two"));

        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            channel
                .register_receiver(move |message: Bytes| tx.send(message).unwrap())
                .unwrap();
        }

        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_ref(), b"one");
        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_ref(), b"two");
    }

    #[test]
    fn second_receiver_is_rejected() {
        let (channel, _conn) = channel_with(ChannelConfig::default());
        channel.register_receiver(|_: Bytes| {}).unwrap();

        let err = channel.register_receiver(|_: Bytes| {}).unwrap_err();
        assert!(matches!(err, ChannelError::ReceiverAlreadyRegistered));
    }

    #[test]
    fn credit_is_withheld_while_queue_is_full() {
        let config = ChannelConfig {
            max_queued_messages: 1,
            ..ChannelConfig::default()
        };
        let (channel, conn) = channel_with(config);
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_NEW | MSG_FLAG_EOF, b"done"));
        channel.on_fragment_received(data_fragment(4, MSG_FLAG_NEW, b"abc"));
        assert!(window_updates(&conn.take_frames()).is_empty());

        let (tx, rx) = mpsc::channel();
        channel
            .register_receiver(move |message: Bytes| tx.send(message).unwrap())
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_ref(), b"done");
        let updates = window_updates(&conn.take_frames());
        assert_eq!(updates.len(), 1);
        assert_eq!((updates[0].id, updates[0].credit), (4, 3));
    }

    #[test]
    fn duplicate_new_fragment_is_reported_and_ignored() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(data_fragment(6, MSG_FLAG_NEW, b"ab"));
        channel.on_fragment_received(data_fragment(6, MSG_FLAG_NEW, b"zz"));

        let errors = conn.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("duplicate ID"), "{}", errors[0]);

        let (tx, rx) = mpsc::channel();
        channel
            .register_receiver(move |message: Bytes| tx.send(message).unwrap())
            .unwrap();
        channel.on_fragment_received(data_fragment(6, MSG_FLAG_EOF, b"cd"));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_ref(), b"abcd");
    }

    #[test]
    fn unknown_continuation_is_reported_and_dropped() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(data_fragment(10, 0, b"orphan"));

        let errors = conn.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown ID"), "{}", errors[0]);
        assert_eq!(channel.open_inbound_count(), 0);
        assert!(conn.take_frames().is_empty());
    }

    #[test]
    fn too_many_inbound_messages_is_a_violation() {
        let config = ChannelConfig {
            max_inbound_messages: 1,
            ..ChannelConfig::default()
        };
        let (channel, conn) = channel_with(config);
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_NEW, b"a"));
        channel.on_fragment_received(data_fragment(4, MSG_FLAG_NEW, b"b"));

        assert_eq!(conn.errors().len(), 1);
        assert_eq!(channel.open_inbound_count(), 1);
    }

    #[test]
    fn undelivered_messages_count_against_inbound_limit() {
        let config = ChannelConfig {
            max_inbound_messages: 2,
            max_queued_messages: 1,
            ..ChannelConfig::default()
        };
        let (channel, conn) = channel_with(config);
        let body = vec![0x5a; 1024];
        for id in (2..=200u16).step_by(2) {
            channel.on_fragment_received(data_fragment(id, MSG_FLAG_NEW | MSG_FLAG_EOF, &body));
        }

        assert_eq!(channel.lock().ready.len(), 2);
        let errors = conn.errors();
        assert_eq!(errors.len(), 98);
        assert!(errors[0].contains("too many"), "{}", errors[0]);

        let (tx, rx) = mpsc::channel();
        channel
            .register_receiver(move |message: Bytes| tx.send(message).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().len(), body.len());

        channel.on_fragment_received(data_fragment(202, MSG_FLAG_NEW | MSG_FLAG_EOF, b"room"));
        assert_eq!(conn.errors().len(), 98);
        assert_eq!(channel.lock().ready.len(), 2);
    }

    #[test]
    fn window_overrun_is_a_violation() {
        let config = ChannelConfig {
            inbound_window: 4,
            max_queued_messages: 0,
            ..ChannelConfig::default()
        };
        let (channel, conn) = channel_with(config);
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_NEW, b"abcd"));
        channel.on_fragment_received(data_fragment(2, 0, b"e"));

        let errors = conn.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exceeded inbound window"), "{}", errors[0]);
        assert_eq!(channel.open_inbound_count(), 0);
    }

    #[test]
    fn malformed_fragment_is_a_violation() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(Bytes::from_static(&[0, 1]));
        assert!(conn.errors()[0].contains("malformed"));
    }

    #[test]
    fn cancelled_inbound_message_is_discarded() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_NEW, b"ab"));
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_EOF | MSG_FLAG_CANCELLED, b""));

        assert_eq!(channel.open_inbound_count(), 0);
        assert!(channel.lock().ready.is_empty());
        assert!(conn.errors().is_empty());
    }

    #[test]
    fn release_inbound_discards_partial_state() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_fragment_received(data_fragment(2, MSG_FLAG_NEW, b"ab"));
        assert!(channel.release_inbound_message(2));
        assert!(!channel.release_inbound_message(2));

        channel.on_fragment_received(data_fragment(2, MSG_FLAG_EOF, b"cd"));
        assert_eq!(conn.errors().len(), 1);
    }

    #[test]
    fn unknown_window_update_is_ignored() {
        let (channel, conn) = channel_with(ChannelConfig::default());
        channel.on_window_update_received(window_update(12, 100));

        assert!(conn.errors().is_empty());
        assert!(conn.take_frames().is_empty());
        assert_eq!(channel.open_outbound_count(), 0);
    }

    #[test]
    fn window_update_grows_window() {
        let config = ChannelConfig {
            outbound_window: 10,
            ..ChannelConfig::default()
        };
        let (channel, _conn) = channel_with(config);
        let writer = channel.open_outbound_message().unwrap();

        channel.on_window_update_received(window_update(writer.id(), 5));
        assert_eq!(writer.available_window(), 15);
    }

    #[test]
    fn close_ends_pending_receiver() {
        struct Probe(mpsc::Sender<&'static str>);
        impl Receiver for Probe {
            fn handle_message(self: Box<Self>, _message: Bytes) {
                self.0.send("message").unwrap();
            }
            fn handle_end(self: Box<Self>) {
                self.0.send("end").unwrap();
            }
            fn handle_error(self: Box<Self>, _error: ChannelError) {
                self.0.send("error").unwrap();
            }
        }

        let (channel, _conn) = channel_with(ChannelConfig::default());
        let (tx, rx) = mpsc::channel();
        channel.register_receiver(Probe(tx.clone())).unwrap();
        channel.close();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "end");
        assert!(channel.is_closed());
        assert!(matches!(
            channel.register_receiver(Probe(tx.clone())),
            Err(ChannelError::Closed)
        ));

        let (channel, _conn) = channel_with(ChannelConfig::default());
        channel.register_receiver(Probe(tx)).unwrap();
        channel.fail("reset");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "error");
    }

    #[test]
    fn written_fragments_reassemble_on_peer() {
        let config = ChannelConfig {
            max_fragment_size: 5,
            ..ChannelConfig::default()
        };
        let (sender, sent) = channel_with(config.clone());
        let (receiver, _received) = channel_with(config);

        let (tx, rx) = mpsc::channel();
        receiver
            .register_receiver(move |message: Bytes| tx.send(message).unwrap())
            .unwrap();

        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut writer = sender.open_outbound_message().unwrap();
        writer.write_all(&payload[..333]).unwrap();
        writer.write_all(&payload[333..]).unwrap();
        writer.close().unwrap();

        let frames = sent.take_frames();
        assert_eq!(data_fragments(&frames).len(), 201);
        for frame in &frames {
            let (_, _, body) = split_envelope(frame);
            receiver.on_fragment_received(body);
        }

        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_ref(), payload.as_slice());
    }
}
