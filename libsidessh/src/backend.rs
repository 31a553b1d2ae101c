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

//! Transport construction from CLI arguments.
//!
//! The two sides of a channel are mirror images: the server reads the
//! client-to-server direction and writes server-to-client, the client
//! the other way around. This module owns that flipping plus the
//! per-transport wiring (clipboard tool detection, git mirror setup,
//! drive auth, serial port opening, audio discovery).

use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};
use sidessh_protocol::Endpoint;
use tracing::info;

use crate::{
    audio::{
        discovery::{discover_audio_devices, AudioDiscoveryConfig},
        io::{list_pulse_devices, AudioDuplexIo, PulseCliAudioDuplexIo},
        AudioModulation,
    },
    transport::{
        audio_modem::{AudioModemTransportBackend, AudioModemTransportConfig},
        clipboard::{detect_slot, ClipboardTransportBackend, ClipboardTransportConfig},
        drive::{
            DriveAuthConfig, DriveTransportConfig, GoogleDriveTransportBackend, HttpDriveFiles,
        },
        git::{GitTransportBackend, GitTransportConfig},
        serial::{SerialTransportBackend, SerialTransportConfig},
        TransportBackend,
    },
    TransportArgs, TransportKind,
};

pub fn build(
    args: &TransportArgs,
    role: Endpoint,
) -> anyhow::Result<Box<dyn TransportBackend>> {
    match args.transport {
        TransportKind::Clipboard => build_clipboard(args),
        TransportKind::Git => build_git(args, role),
        TransportKind::GoogleDrive => build_drive(args, role),
        TransportKind::UsbSerial => build_serial(args),
        TransportKind::AudioModem => build_audio(args),
    }
}

fn build_clipboard(args: &TransportArgs) -> anyhow::Result<Box<dyn TransportBackend>> {
    let slot = detect_slot().context("detecting clipboard tools")?;
    let write_gap = Duration::from_millis((args.poll_interval_ms.max(10)) * 2);
    Ok(Box::new(ClipboardTransportBackend::new(
        slot,
        ClipboardTransportConfig { write_gap },
    )))
}

fn build_git(args: &TransportArgs, role: Endpoint) -> anyhow::Result<Box<dyn TransportBackend>> {
    let local_repo = args.local_repo.clone().unwrap_or_else(|| match role {
        Endpoint::Server => PathBuf::from("/tmp/gitssh-server.git"),
        Endpoint::Client => PathBuf::from("/tmp/gitssh-client.git"),
    });
    let (inbound_branch, outbound_branch) = match role {
        Endpoint::Server => (args.branch_c2s.clone(), args.branch_s2c.clone()),
        Endpoint::Client => (args.branch_s2c.clone(), args.branch_c2s.clone()),
    };

    let backend = GitTransportBackend::new(GitTransportConfig {
        local_repo,
        upstream_url: args.upstream_url.clone(),
        inbound_branch,
        outbound_branch,
        ..GitTransportConfig::default()
    })
    .context("initializing git transport")?;
    Ok(Box::new(backend))
}

fn build_drive(
    args: &TransportArgs,
    role: Endpoint,
) -> anyhow::Result<Box<dyn TransportBackend>> {
    let client_secrets = args
        .drive_client_secrets
        .clone()
        .ok_or_else(|| anyhow!("--transport google-drive requires --drive-client-secrets"))?;

    let api = HttpDriveFiles::new(
        DriveAuthConfig {
            client_secrets_path: client_secrets,
            token_path: expand_home(&args.drive_token_path),
        },
        args.drive_poll_page_size.max(1),
    )
    .context("authorizing google drive")?;

    let (inbound_file_name, outbound_file_name) = match role {
        Endpoint::Server => (args.drive_c2s_file_name.clone(), args.drive_s2c_file_name.clone()),
        Endpoint::Client => (args.drive_s2c_file_name.clone(), args.drive_c2s_file_name.clone()),
    };

    let backend = GoogleDriveTransportBackend::new(
        Box::new(api),
        DriveTransportConfig {
            inbound_file_name,
            outbound_file_name,
            poll_page_size: args.drive_poll_page_size.max(1),
            ..DriveTransportConfig::default()
        },
    )
    .context("initializing google drive transport")?;
    Ok(Box::new(backend))
}

fn build_serial(args: &TransportArgs) -> anyhow::Result<Box<dyn TransportBackend>> {
    let backend = SerialTransportBackend::open(
        args.serial_port.clone(),
        SerialTransportConfig {
            baud_rate: args.serial_baud.max(1),
            read_timeout: Duration::from_millis(args.serial_read_timeout_ms),
            write_timeout: Duration::from_millis(args.serial_write_timeout_ms.max(1)),
            frame_max_bytes: args.serial_frame_max_bytes.max(1024),
            ack_timeout: Duration::from_millis(args.serial_ack_timeout_ms.max(10)),
            max_retries: args.serial_max_retries.max(1),
            configure_tty: !args.serial_no_configure_tty,
            ..SerialTransportConfig::default()
        },
    )
    .context("opening serial transport")?;
    Ok(Box::new(backend))
}

fn build_audio(args: &TransportArgs) -> anyhow::Result<Box<dyn TransportBackend>> {
    let modulation: AudioModulation = args
        .audio_modulation
        .parse()
        .map_err(|e: String| anyhow!(e))
        .context("parsing --audio-modulation")?;
    let sample_rate = args.audio_sample_rate.max(8000);

    let (input_device, output_device) = if args.audio_discover {
        let (inputs, outputs) = list_pulse_devices().context("listing audio devices")?;
        let config = AudioDiscoveryConfig {
            sample_rate,
            timeout: Duration::from_secs_f64(args.audio_discovery_timeout.max(1.0)),
            byte_repeat: args.audio_byte_repeat.max(1),
            marker_run: args.audio_marker_run.max(4),
            modulation,
            ..AudioDiscoveryConfig::default()
        };
        let mut factory = |input: &str, output: &str| {
            PulseCliAudioDuplexIo::new(input, output, sample_rate)
                .map(|io| Box::new(io) as Box<dyn AudioDuplexIo>)
        };
        let found = discover_audio_devices(&config, &inputs, &outputs, &mut factory)
            .context("audio device discovery")?;
        info!(
            "audio discovery selected in={} out={} (peer={})",
            found.input_device, found.output_device, found.peer_id
        );
        (found.input_device, found.output_device)
    } else {
        (
            args.audio_input.clone().unwrap_or_else(|| String::from("@DEFAULT_SOURCE@")),
            args.audio_output.clone().unwrap_or_else(|| String::from("@DEFAULT_SINK@")),
        )
    };

    let io = PulseCliAudioDuplexIo::new(&input_device, &output_device, sample_rate)
        .context("opening audio duplex io")?;
    let backend = AudioModemTransportBackend::new(
        Box::new(io),
        &input_device,
        &output_device,
        AudioModemTransportConfig {
            sample_rate,
            frame_max_bytes: args.audio_frame_max_bytes.max(1024),
            ack_timeout: Duration::from_millis(args.audio_ack_timeout_ms.max(10)),
            max_retries: args.audio_max_retries.max(1),
            byte_repeat: args.audio_byte_repeat.max(1),
            marker_run: args.audio_marker_run.max(4),
            modulation,
            ..AudioModemTransportConfig::default()
        },
    );
    Ok(Box::new(backend))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
