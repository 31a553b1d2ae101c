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

//! The clipboard client: a line-oriented remote shell.
//!
//! One command at a time is shipped as `cmd{command, cmd_id}` and
//! retransmitted until the matching `exit` frame is observed, which
//! is the only reliable way to get a frame through a slot both peers
//! keep overwriting.

use std::{
    io,
    io::{BufRead as _, Write as _},
    thread,
    time::{Duration, Instant},
};

use sidessh_protocol::{
    build_message, CmdReq, ConnectReq, Endpoint, Message, Payload, PromptContext, Protocol,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::stream::ClientError;
use crate::{session::EndpointState, sync::SyncWorker, transport::SharedTransport};

#[derive(Debug, Clone)]
pub struct CommandClientConfig {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub retry_interval: Duration,
    pub fetch_interval: Duration,
    pub push_interval: Duration,
}

impl Default for CommandClientConfig {
    fn default() -> Self {
        CommandClientConfig {
            poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
            retry_interval: Duration::from_millis(500),
            fetch_interval: Duration::from_millis(100),
            push_interval: Duration::from_millis(100),
        }
    }
}

/// Everything the server sent back for one command.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub struct CommandClient {
    transport: SharedTransport,
    config: CommandClientConfig,
    state: Option<EndpointState>,
    prompt: PromptContext,
    worker: Option<SyncWorker>,
}

impl CommandClient {
    pub fn new(transport: SharedTransport, config: CommandClientConfig) -> Self {
        CommandClient { transport, config, state: None, prompt: PromptContext::default(), worker: None }
    }

    pub fn prompt(&self) -> &PromptContext {
        &self.prompt
    }

    fn read_messages(&mut self) -> Vec<Message> {
        let mut transport = self.transport.lock().unwrap();
        match transport.read_inbound_messages(None) {
            Ok((messages, _)) => messages,
            Err(e) => {
                warn!("transport read failed: {e}");
                Vec::new()
            }
        }
    }

    fn write_message(&self, message: &Message) -> Result<(), ClientError> {
        let mut transport = self.transport.lock().unwrap();
        transport.write_outbound_message(message)?;
        if let Err(e) = transport.push_outbound() {
            debug!("immediate push failed, deferring to worker: {e}");
        }
        Ok(())
    }

    /// Handshake: fresh connect_req per retry until the server
    /// responds.
    #[instrument(skip_all)]
    pub fn connect(&mut self, host: &str) -> Result<(), ClientError> {
        if self.state.is_some() {
            return Err(ClientError::Io(String::from("already connected")));
        }

        self.worker = Some(SyncWorker::spawn(
            "client",
            self.transport.clone(),
            self.config.fetch_interval,
            self.config.push_interval,
        ));

        let session_id = Uuid::new_v4();
        let mut state = EndpointState::new(session_id);
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut next_send = Instant::now();

        info!("connecting session {session_id} to {host}");
        while Instant::now() < deadline {
            let now = Instant::now();
            if now >= next_send {
                let request = build_message(
                    Protocol::ClipV1,
                    Payload::ConnectReq(ConnectReq { host: String::from(host), pty: None }),
                    session_id,
                    Endpoint::Client,
                    Endpoint::Server,
                    state.outgoing_seq.next(),
                )
                .map_err(|e| ClientError::Io(e.to_string()))?;
                self.write_message(&request)?;
                next_send = now + self.config.retry_interval;
            }

            for incoming in self.read_messages() {
                if incoming.target != Endpoint::Client || incoming.source != Endpoint::Server {
                    continue;
                }
                if incoming.session_id != session_id {
                    continue;
                }
                if !state.incoming_seen.mark(incoming.msg_id) {
                    continue;
                }

                match incoming.payload {
                    Payload::ConnectAck(ack) => {
                        self.prompt = ack.prompt;
                        self.state = Some(state);
                        info!("connected session {session_id}");
                        return Ok(());
                    }
                    Payload::Busy(_) => {
                        self.teardown_worker();
                        return Err(ClientError::Busy);
                    }
                    Payload::Error(body) => {
                        self.teardown_worker();
                        return Err(ClientError::Server(body.error));
                    }
                    _ => {}
                }
            }

            thread::sleep(self.config.poll_interval);
        }

        self.teardown_worker();
        Err(ClientError::Timeout(String::from("timed out waiting for server connect_ack")))
    }

    /// Run one remote command, retransmitting the request until its
    /// `exit` frame is observed.
    pub fn run_command(&mut self, command: &str) -> Result<CommandOutcome, ClientError> {
        let (session_id, seq) = match self.state.as_ref() {
            Some(state) => (state.session_id, state.outgoing_seq.next()),
            None => return Err(ClientError::Io(String::from("not connected"))),
        };

        let cmd_id = Uuid::new_v4().to_string();
        let request = build_message(
            Protocol::ClipV1,
            Payload::Cmd(CmdReq {
                command: String::from(command),
                cmd_id: cmd_id.clone(),
            }),
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            seq,
        )
        .map_err(|e| ClientError::Io(e.to_string()))?;

        let mut outcome = CommandOutcome::default();
        let deadline = Instant::now() + self.config.command_timeout;
        let mut next_send = Instant::now();

        while Instant::now() < deadline {
            let now = Instant::now();
            if now >= next_send {
                // Retransmit the same frame: the server replays its
                // cached response if it already ran the command.
                self.write_message(&request)?;
                next_send = now + self.config.retry_interval;
            }

            for incoming in self.read_messages() {
                let state = match self.state.as_mut() {
                    Some(state) => state,
                    None => return Err(ClientError::Io(String::from("not connected"))),
                };
                if incoming.target != Endpoint::Client || incoming.source != Endpoint::Server {
                    continue;
                }
                if incoming.session_id != state.session_id {
                    continue;
                }
                if !state.incoming_seen.mark(incoming.msg_id) {
                    continue;
                }

                match incoming.payload {
                    Payload::Stdout(data) if data.cmd_id == cmd_id => {
                        outcome.stdout.push_str(&data.data);
                    }
                    Payload::Stderr(data) if data.cmd_id == cmd_id => {
                        outcome.stderr.push_str(&data.data);
                    }
                    Payload::Exit(exit) if exit.cmd_id == cmd_id => {
                        outcome.exit_code = exit.exit_code;
                        if let Some(prompt) = exit.prompt {
                            self.prompt = prompt;
                        }
                        return Ok(outcome);
                    }
                    Payload::Error(body) => return Err(ClientError::Server(body.error)),
                    _ => {}
                }
            }

            thread::sleep(self.config.poll_interval);
        }

        Err(ClientError::Timeout(format!("timed out waiting for command result: {command:?}")))
    }

    /// Interactive prompt loop over stdin/stdout.
    pub fn run_repl(&mut self, host: &str) -> Result<i32, ClientError> {
        self.connect(host)?;

        let stdin = io::stdin();
        let mut last_exit = 0;
        loop {
            {
                let mut stdout = io::stdout();
                let user = self.prompt.user.as_deref().unwrap_or("user");
                let shown_host = self.prompt.host.as_deref().unwrap_or(host);
                let _ = write!(stdout, "{user}@{shown_host}$ ");
                let _ = stdout.flush();
            }

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    self.disconnect();
                    return Err(ClientError::Io(format!("reading stdin: {e}")));
                }
            }

            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if command == "exit" || command == "logout" {
                break;
            }

            match self.run_command(command) {
                Ok(outcome) => {
                    print!("{}", outcome.stdout);
                    eprint!("{}", outcome.stderr);
                    let _ = io::stdout().flush();
                    last_exit = outcome.exit_code;
                }
                Err(e @ ClientError::Timeout(_)) => {
                    eprintln!("sidessh: {e}");
                    last_exit = 1;
                }
                Err(e) => {
                    self.disconnect();
                    return Err(e);
                }
            }
        }

        self.disconnect();
        Ok(last_exit)
    }

    pub fn disconnect(&mut self) {
        if let Some(state) = self.state.take() {
            let message = build_message(
                Protocol::ClipV1,
                Payload::Disconnect {},
                state.session_id,
                Endpoint::Client,
                Endpoint::Server,
                state.outgoing_seq.next(),
            );
            if let Ok(message) = message {
                if let Err(e) = self.write_message(&message) {
                    debug!("disconnect write failed: {e}");
                }
            }
        }
        self.teardown_worker();
    }

    fn teardown_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}
