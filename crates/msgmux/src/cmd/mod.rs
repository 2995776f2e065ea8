use clap::{Args, Subcommand};

use crate::exit::CliResult;
#[cfg(not(unix))]
use crate::exit::{CliError, USAGE};
use crate::output::OutputFormat;

#[cfg(unix)]
pub mod loopback;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange messages between two in-process channel endpoints and verify them.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        #[cfg(unix)]
        Command::Loopback(args) => loopback::run(args, format),
        #[cfg(not(unix))]
        Command::Loopback(_) => Err(CliError::new(
            USAGE,
            "loopback requires Unix domain sockets",
        )),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Number of messages to send.
    #[arg(long, short = 'n', default_value_t = 16, value_parser = clap::value_parser!(u32).range(1..))]
    pub messages: u32,
    /// Size of each message in bytes (at least 4).
    #[arg(long, short = 's', default_value_t = 64 * 1024)]
    pub size: usize,
    /// Concurrent writer threads.
    #[arg(long, short = 'w', default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    pub writers: u32,
    /// Per-message window in bytes, used for both directions.
    #[arg(long, default_value_t = 64 * 1024)]
    pub window: u32,
    /// Maximum concurrently open outbound messages.
    #[arg(long, default_value_t = 16)]
    pub max_outbound: u32,
    /// Maximum payload bytes per data fragment.
    #[arg(long, default_value_t = 8 * 1024)]
    pub fragment_size: usize,
    /// Give up if the exchange takes longer than this (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
