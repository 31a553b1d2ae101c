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

//! The server side: a daemon that accepts one remote session over the
//! configured transport and bridges it to a local shell.

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use sidessh_protocol::Endpoint;
use tracing::info;

use crate::{backend, transport, DaemonArgs, TransportKind};

pub mod command;
pub mod server;
pub mod shell;
pub mod signals;

pub fn run(args: DaemonArgs) -> anyhow::Result<()> {
    let raw_backend = backend::build(&args.transport, Endpoint::Server)?;
    let transport = transport::shared(raw_backend);

    let stop = Arc::new(AtomicBool::new(false));
    signals::register_shutdown(stop.clone())?;

    let poll_interval = Duration::from_millis(args.transport.poll_interval_ms.max(10));
    let fetch_interval = Duration::from_secs_f64(args.transport.fetch_interval.max(0.02));
    let push_interval = Duration::from_secs_f64(args.transport.push_interval.max(0.02));

    let result = if args.transport.transport == TransportKind::Clipboard {
        let config = command::CommandServerConfig {
            poll_interval,
            fetch_interval,
            push_interval,
            max_output_chunk: args.max_output_chunk.max(1),
            preferred_shell: args.shell.clone(),
            command_timeout: Duration::from_secs_f64(args.command_timeout.max(1.0)),
            ..command::CommandServerConfig::default()
        };
        command::CommandServer::new(transport.clone(), config).serve_forever(stop)
    } else {
        let config = server::StreamServerConfig {
            poll_interval,
            fetch_interval,
            push_interval,
            max_output_chunk: args.max_output_chunk.max(1),
            io_flush_interval: Duration::from_secs_f64(args.io_flush_interval.max(0.0)),
            preferred_shell: args.shell.clone(),
            connect_ack_burst: effective_ack_burst(&args),
            diag_interval: args
                .diag_interval
                .map(|secs| Duration::from_secs_f64(secs.max(0.1))),
        };
        server::StreamServer::new(transport.clone(), config).serve_forever(stop)
    };

    info!("server loop finished, closing transport");
    transport.lock().unwrap().close();
    result
}

/// Audio links lose first packets often enough that re-acks get
/// bursted there by default; everything else sends one.
fn effective_ack_burst(args: &DaemonArgs) -> u32 {
    if let Some(burst) = args.connect_ack_burst {
        return burst.max(1);
    }
    match args.transport.transport {
        TransportKind::AudioModem => 3,
        _ => 1,
    }
}

pub(crate) fn server_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

pub(crate) fn server_user() -> Option<String> {
    std::env::var("USER").ok().filter(|u| !u.is_empty()).or_else(|| {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
    })
}
