use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use msgmux_channel::{Channel, ChannelConfig, ChannelError, Demultiplexer, StreamConnection};
use msgmux_frame::FrameReader;
use tracing::{debug, info, warn};

use crate::cmd::LoopbackArgs;
use crate::exit::{
    channel_error, io_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, TIMEOUT, USAGE,
};
use crate::output::{print_loopback, LoopbackReport, OutputFormat};

const LOOPBACK_CHANNEL: u32 = 1;
const INDEX_SIZE: usize = 4;

/// One side of the loopback: a channel plus the thread reading its socket.
struct Endpoint {
    channel: Arc<Channel>,
    stream: UnixStream,
    reader: JoinHandle<msgmux_channel::Result<()>>,
}

impl Endpoint {
    fn start(name: &str, stream: UnixStream, config: ChannelConfig) -> CliResult<Self> {
        let write_half = stream
            .try_clone()
            .map_err(|err| io_error("socket clone failed", err))?;
        let read_half = stream
            .try_clone()
            .map_err(|err| io_error("socket clone failed", err))?;

        let connection = Arc::new(StreamConnection::new(write_half));
        let channel = Channel::new(LOOPBACK_CHANNEL, connection.clone(), config)
            .map_err(|err| channel_error("channel setup failed", err))?;
        let demux = Demultiplexer::new();
        demux.insert(Arc::clone(&channel));

        let mut frames = FrameReader::new(read_half);
        let reader = thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || demux.run(&mut frames, &connection))
            .map_err(|err| io_error("reader thread spawn failed", err))?;

        Ok(Self {
            channel,
            stream,
            reader,
        })
    }

    fn stop(self) -> CliResult<()> {
        let _ = self.stream.shutdown(Shutdown::Both);
        match self.reader.join() {
            Ok(result) => result.map_err(|err| channel_error("reader failed", err)),
            Err(_) => Err(CliError::new(INTERNAL, "reader thread panicked")),
        }
    }
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    if args.size < INDEX_SIZE {
        return Err(CliError::new(
            USAGE,
            format!("message size must be at least {INDEX_SIZE} bytes"),
        ));
    }
    let timeout = parse_duration(&args.timeout)?;
    let config = ChannelConfig {
        outbound_window: args.window,
        inbound_window: args.window,
        max_outbound_messages: args.max_outbound,
        max_inbound_messages: args.max_outbound,
        max_fragment_size: args.fragment_size,
        max_inbound_message_size: args.size,
        ..ChannelConfig::default()
    };
    config
        .validate()
        .map_err(|err| channel_error("invalid loopback config", err))?;

    let (left, right) = UnixStream::pair().map_err(|err| io_error("socket pair failed", err))?;
    let client = Endpoint::start("client", left, config.clone())?;
    let server = Endpoint::start("server", right, config)?;

    let (tx, rx) = mpsc::channel();
    collect_into(&server.channel, tx).map_err(|err| channel_error("register receiver failed", err))?;

    info!(
        messages = args.messages,
        size = args.size,
        writers = args.writers,
        window = args.window,
        "starting loopback"
    );
    let started = Instant::now();
    let writers = spawn_writers(&client.channel, &args)?;
    let received = receive(&rx, &args, started + timeout);

    if received.is_err() {
        client.channel.close();
        server.channel.close();
    }
    let mut bytes = 0u64;
    let mut write_failure = None;
    for writer in writers {
        match writer.join() {
            Ok(Ok(sent)) => bytes += sent,
            Ok(Err(err)) => {
                write_failure.get_or_insert(err);
            }
            Err(_) => {
                write_failure.get_or_insert(CliError::new(INTERNAL, "writer thread panicked"));
            }
        }
    }
    let elapsed = started.elapsed();

    client.stop()?;
    server.stop()?;

    let corrupted = received?;
    if let Some(err) = write_failure {
        return Err(err);
    }

    let report = LoopbackReport {
        messages: args.messages,
        message_size: args.size,
        writers: args.writers,
        window: args.window,
        fragment_size: args.fragment_size,
        max_outbound_messages: args.max_outbound,
        bytes,
        elapsed_ms: elapsed.as_millis() as u64,
        throughput_mib_s: bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(1e-9),
        corrupted,
        verified: corrupted == 0,
    };
    print_loopback(&report, format);

    if report.verified {
        Ok(SUCCESS)
    } else {
        warn!(corrupted, "loopback verification failed");
        Ok(FAILURE)
    }
}

/// Keep a receiver registered on `channel`, forwarding every message to `tx`.
fn collect_into(channel: &Arc<Channel>, tx: mpsc::Sender<Bytes>) -> Result<(), ChannelError> {
    let next = Arc::clone(channel);
    channel.register_receiver(move |message: Bytes| {
        if tx.send(message).is_ok() {
            let _ = collect_into(&next, tx);
        }
    })
}

fn spawn_writers(
    channel: &Arc<Channel>,
    args: &LoopbackArgs,
) -> CliResult<Vec<JoinHandle<CliResult<u64>>>> {
    (0..args.writers)
        .map(|writer| {
            let channel = Arc::clone(channel);
            let indices: Vec<u32> = (writer..args.messages)
                .step_by(args.writers as usize)
                .collect();
            let size = args.size;
            thread::Builder::new()
                .name(format!("writer-{writer}"))
                .spawn(move || send_messages(&channel, &indices, size))
                .map_err(|err| io_error("writer thread spawn failed", err))
        })
        .collect()
}

fn send_messages(channel: &Arc<Channel>, indices: &[u32], size: usize) -> CliResult<u64> {
    let mut sent = 0;
    for &index in indices {
        let mut writer = channel
            .open_outbound_message()
            .map_err(|err| channel_error("open message failed", err))?;
        let message_id = writer.id();
        writer
            .write_all(&payload(index, size))
            .map_err(|err| io_error("message write failed", err))?;
        writer
            .close()
            .map_err(|err| channel_error("message close failed", err))?;
        debug!(index, message_id, "message sent");
        sent += size as u64;
    }
    Ok(sent)
}

/// Wait for every message and return how many failed verification.
fn receive(rx: &mpsc::Receiver<Bytes>, args: &LoopbackArgs, deadline: Instant) -> CliResult<u32> {
    let mut seen = vec![false; args.messages as usize];
    let mut corrupted = 0;
    for received in 0..args.messages {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = rx.recv_timeout(remaining).map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!(
                    "timed out after receiving {received} of {} messages",
                    args.messages
                ),
            )
        })?;
        match verify(&message, args.size) {
            Some(index) if seen.get(index as usize) == Some(&false) => {
                seen[index as usize] = true;
            }
            _ => corrupted += 1,
        }
    }
    Ok(corrupted)
}

/// Message `index`: the index as a big-endian `u32`, then a rolling pattern.
fn payload(index: u32, size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    data.extend_from_slice(&index.to_be_bytes());
    data.extend((0..size - INDEX_SIZE).map(|i| (index as u8).wrapping_add(i as u8)));
    data
}

/// The index of an intact message, if `message` is one.
fn verify(message: &[u8], size: usize) -> Option<u32> {
    if message.len() != size {
        return None;
    }
    let index = u32::from_be_bytes(message[..INDEX_SIZE].try_into().ok()?);
    (message == payload(index, size).as_slice()).then_some(index)
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
