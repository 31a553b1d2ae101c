// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! libsidessh implements ssh-style interactive remote shells over
//! side-channel transports: a shared clipboard, a git repository, a
//! Google Drive appData file, a USB serial line, or an acoustic
//! modem between a speaker and a microphone.

use std::{fs, io, path::PathBuf, sync::Mutex};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod attach;
mod audio;
mod backend;
mod consts;
mod daemon;
mod session;
mod sync;
mod transport;
mod tty;

use consts::{
    DEFAULT_BRANCH_C2S, DEFAULT_BRANCH_S2C, DEFAULT_DRIVE_LOG_C2S, DEFAULT_DRIVE_LOG_S2C,
};

/// The command line arguments that sidessh expects.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if sidessh is
running in daemon mode, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that sidessh supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs the server daemon that bridges one remote session to a local shell")]
    Daemon(DaemonArgs),

    #[clap(about = "Connects to a remote shell over the chosen transport")]
    Attach(AttachArgs),
}

#[derive(clap::Args, Debug)]
pub struct DaemonArgs {
    #[clap(flatten)]
    pub transport: TransportArgs,

    #[clap(long, default_value = "tcsh", help = "Preferred shell executable name or path")]
    pub shell: String,

    #[clap(
        long,
        default_value_t = 4096,
        help = "Maximum bytes per pty_output payload before base64 encoding"
    )]
    pub max_output_chunk: usize,

    #[clap(
        long,
        default_value_t = 0.02,
        help = "Maximum seconds to hold buffered PTY output before emitting a frame"
    )]
    pub io_flush_interval: f64,

    #[clap(
        long,
        default_value_t = 120.0,
        help = "Maximum seconds to wait for a clipboard-mode command to finish"
    )]
    pub command_timeout: f64,

    #[clap(long, help = "Seconds between diag_ping heartbeats; omit to disable them")]
    pub diag_interval: Option<f64>,

    #[clap(
        long,
        help = "How many connect_ack frames to send when re-acknowledging a session \
                (defaults to 3 on audio transports, 1 elsewhere)"
    )]
    pub connect_ack_burst: Option<u32>,
}

#[derive(clap::Args, Debug)]
pub struct AttachArgs {
    #[clap(help = "ssh-style target host (informational over side channels)")]
    pub host: String,

    #[clap(flatten)]
    pub transport: TransportArgs,

    #[clap(long, default_value_t = 10.0, help = "Maximum seconds to wait for the handshake")]
    pub connect_timeout: f64,

    #[clap(
        long,
        default_value_t = 300.0,
        help = "Maximum idle seconds before giving up on the session"
    )]
    pub session_timeout: f64,

    #[clap(
        long,
        default_value_t = 0.5,
        help = "Seconds between connect_req retransmissions"
    )]
    pub retry_interval: f64,

    #[clap(
        long,
        default_value_t = 0.02,
        help = "Seconds to batch stdin before shipping a pty_input frame"
    )]
    pub stdin_batch_interval: f64,

    #[clap(long, default_value_t = 4096, help = "Bytes of stdin per pty_input frame")]
    pub input_chunk_bytes: usize,

    #[clap(long, default_value_t = 0.1, help = "Seconds to debounce SIGWINCH resizes")]
    pub resize_debounce: f64,

    #[clap(long, help = "Do not put the local terminal into raw mode")]
    pub no_raw: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Clipboard,
    Git,
    GoogleDrive,
    UsbSerial,
    AudioModem,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Clipboard => "clipboard",
            TransportKind::Git => "git",
            TransportKind::GoogleDrive => "google-drive",
            TransportKind::UsbSerial => "usb-serial",
            TransportKind::AudioModem => "audio-modem",
        };
        write!(f, "{name}")
    }
}

/// Transport selection and per-transport knobs, shared by the daemon
/// and attach subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct TransportArgs {
    #[clap(long, value_enum, default_value_t = TransportKind::Git)]
    pub transport: TransportKind,

    #[clap(long, default_value_t = 100, help = "Polling interval in milliseconds")]
    pub poll_interval_ms: u64,

    #[clap(long, default_value_t = 0.1, help = "Seconds between background fetches")]
    pub fetch_interval: f64,

    #[clap(long, default_value_t = 0.1, help = "Seconds between background pushes")]
    pub push_interval: f64,

    #[clap(long, help = "Path to this peer's local bare mirror repository")]
    pub local_repo: Option<PathBuf>,

    #[clap(
        long,
        default_value = "/tmp/gitssh-upstream.git",
        help = "Shared upstream git bare repository URL or path"
    )]
    pub upstream_url: String,

    #[clap(long, default_value = DEFAULT_BRANCH_C2S, help = "Branch for client-to-server frames")]
    pub branch_c2s: String,

    #[clap(long, default_value = DEFAULT_BRANCH_S2C, help = "Branch for server-to-client frames")]
    pub branch_s2c: String,

    #[clap(long, help = "Path to the Google OAuth client-secrets JSON")]
    pub drive_client_secrets: Option<PathBuf>,

    #[clap(
        long,
        default_value = "~/.config/sidessh/drive-token.json",
        help = "Path to the cached Google OAuth token JSON"
    )]
    pub drive_token_path: String,

    #[clap(long, default_value = DEFAULT_DRIVE_LOG_C2S, help = "Drive appData file for client-to-server frames")]
    pub drive_c2s_file_name: String,

    #[clap(long, default_value = DEFAULT_DRIVE_LOG_S2C, help = "Drive appData file for server-to-client frames")]
    pub drive_s2c_file_name: String,

    #[clap(long, default_value_t = 200, help = "Page size for Drive file lookup queries")]
    pub drive_poll_page_size: u32,

    #[clap(long, default_value = "/dev/ttyACM0", help = "Serial device path")]
    pub serial_port: PathBuf,

    #[clap(long, default_value_t = 3_000_000, help = "Requested serial baud rate")]
    pub serial_baud: u32,

    #[clap(long, default_value_t = 5, help = "Serial read timeout in milliseconds")]
    pub serial_read_timeout_ms: u64,

    #[clap(long, default_value_t = 20, help = "Serial write timeout in milliseconds")]
    pub serial_write_timeout_ms: u64,

    #[clap(long, default_value_t = 65536, help = "Maximum encoded message bytes per serial frame")]
    pub serial_frame_max_bytes: usize,

    #[clap(long, default_value_t = 150, help = "Serial retransmission timeout in milliseconds")]
    pub serial_ack_timeout_ms: u64,

    #[clap(long, default_value_t = 20, help = "Maximum serial retransmissions before failing")]
    pub serial_max_retries: u32,

    #[clap(long, help = "Do not apply raw termios settings to the serial fd")]
    pub serial_no_configure_tty: bool,

    #[clap(long, default_value_t = 48000, help = "PCM sample rate for the audio modem")]
    pub audio_sample_rate: u32,

    #[clap(long, default_value_t = 65536, help = "Maximum encoded message bytes per audio frame")]
    pub audio_frame_max_bytes: usize,

    #[clap(long, default_value_t = 200, help = "Audio retransmission timeout in milliseconds")]
    pub audio_ack_timeout_ms: u64,

    #[clap(long, default_value_t = 32, help = "Maximum audio retransmissions before failing")]
    pub audio_max_retries: u32,

    #[clap(long, default_value_t = 3, help = "Repetition FEC factor for audio bytes")]
    pub audio_byte_repeat: usize,

    #[clap(long, default_value_t = 16, help = "Marker samples delimiting audio frames")]
    pub audio_marker_run: usize,

    #[clap(
        long,
        default_value = "auto",
        help = "Audio modulation profile (auto, legacy, robust-v1)"
    )]
    pub audio_modulation: String,

    #[clap(long, help = "Audio capture device (defaults to the system default source)")]
    pub audio_input: Option<String>,

    #[clap(long, help = "Audio playback device (defaults to the system default sink)")]
    pub audio_output: Option<String>,

    #[clap(long, help = "Probe local devices to find the working speaker/microphone pair")]
    pub audio_discover: bool,

    #[clap(long, default_value_t = 90.0, help = "Overall audio discovery deadline in seconds")]
    pub audio_discovery_timeout: f64,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the sidessh tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Daemon(_) = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon(daemon_args) => daemon::run(daemon_args),
        Commands::Attach(attach_args) => match attach::run(attach_args) {
            Ok(code) => std::process::exit(code),
            Err(err) => Err(err),
        },
    };

    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("sidessh: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}
