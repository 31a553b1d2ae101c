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

//! The client side: attach to a remote shell over the configured
//! transport. Streaming transports get a raw interactive pty bridge;
//! the clipboard transport gets a line-oriented command loop.

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use sidessh_protocol::Endpoint;
use tracing::info;

use crate::{backend, transport, AttachArgs, TransportKind};

pub mod command;
pub mod stream;

pub use stream::ClientError;

/// Run the attach flow, returning the process exit code: 0 for a
/// clean remote exit, 1 for protocol/transport failures, 2 for local
/// resource problems, 130 for an interrupt during connect.
pub fn run(args: AttachArgs) -> anyhow::Result<i32> {
    let raw_backend = match backend::build(&args.transport, Endpoint::Client) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("sidessh: {e:#}");
            return Ok(2);
        }
    };
    let transport = transport::shared(raw_backend);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone())?;

    let result = if args.transport.transport == TransportKind::Clipboard {
        let config = command::CommandClientConfig {
            poll_interval: Duration::from_millis(args.transport.poll_interval_ms.max(10)),
            connect_timeout: Duration::from_secs_f64(args.connect_timeout.max(0.1)),
            command_timeout: Duration::from_secs_f64(args.session_timeout.max(1.0)),
            retry_interval: Duration::from_secs_f64(args.retry_interval.max(0.05)),
            fetch_interval: Duration::from_secs_f64(args.transport.fetch_interval.max(0.02)),
            push_interval: Duration::from_secs_f64(args.transport.push_interval.max(0.02)),
        };
        let mut client = command::CommandClient::new(transport.clone(), config);
        client.run_repl(&args.host)
    } else {
        let config = stream::StreamClientConfig {
            poll_interval: Duration::from_millis(args.transport.poll_interval_ms.max(10)),
            connect_timeout: Duration::from_secs_f64(args.connect_timeout.max(0.1)),
            session_timeout: Duration::from_secs_f64(args.session_timeout.max(1.0)),
            retry_interval: Duration::from_secs_f64(args.retry_interval.max(0.05)),
            fetch_interval: Duration::from_secs_f64(args.transport.fetch_interval.max(0.02)),
            push_interval: Duration::from_secs_f64(args.transport.push_interval.max(0.02)),
            stdin_batch_interval: Duration::from_secs_f64(args.stdin_batch_interval.max(0.0)),
            input_chunk_bytes: args.input_chunk_bytes.max(1),
            resize_debounce: Duration::from_secs_f64(args.resize_debounce.max(0.0)),
            no_raw: args.no_raw,
        };
        let mut client = stream::StreamClient::new(transport.clone(), config);
        client.set_interrupt_flag(interrupted);
        client.run_interactive(&args.host)
    };

    info!("attach finished, closing transport");
    transport.lock().unwrap().close();

    match result {
        Ok(code) => Ok(code),
        Err(ClientError::Interrupted) => Ok(130),
        Err(e @ ClientError::Io(_)) => {
            eprintln!("sidessh: {e}");
            Ok(2)
        }
        Err(e) => {
            eprintln!("sidessh: {e}");
            Ok(1)
        }
    }
}
