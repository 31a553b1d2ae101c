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

//! The clipboard request/response server.
//!
//! Instead of a pty byte stream, the clipboard variant ships whole
//! commands: the client sends `cmd{command, cmd_id}`, the server runs
//! it through a shell and answers with chunked `stdout`/`stderr`
//! frames and a final `exit`. Because the clipboard slot races with
//! the peer's polling, clients retransmit requests; the server
//! replays the cached response list for any command it has already
//! run rather than running it twice.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use sidessh_protocol::{
    build_message, BusyBody, CmdData, CmdExit, ConnectAck, Endpoint, ErrorBody, Message,
    Payload, PromptContext, Protocol,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    daemon::shell::CommandShell,
    session::{EndpointState, SequenceCounter},
    sync::SyncWorker,
    transport::SharedTransport,
};

#[derive(Debug, Clone)]
pub struct CommandServerConfig {
    pub poll_interval: Duration,
    pub fetch_interval: Duration,
    pub push_interval: Duration,
    pub max_output_chunk: usize,
    pub preferred_shell: String,
    pub command_timeout: Duration,
    /// Bounded replay cache: responses for this many distinct
    /// commands are kept per session.
    pub response_cache_cap: usize,
}

impl Default for CommandServerConfig {
    fn default() -> Self {
        CommandServerConfig {
            poll_interval: Duration::from_millis(100),
            fetch_interval: Duration::from_millis(100),
            push_interval: Duration::from_millis(100),
            max_output_chunk: 32768,
            preferred_shell: String::from("tcsh"),
            command_timeout: Duration::from_secs(120),
            response_cache_cap: 128,
        }
    }
}

/// Response frames for commands we already executed, keyed by cmd_id
/// with FIFO eviction. Clients retry a lost command with a fresh
/// msg_id, so keying by request id would grow without bound.
struct ResponseCache {
    capacity: usize,
    by_cmd: HashMap<String, Vec<Message>>,
    order: VecDeque<String>,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        ResponseCache {
            capacity: capacity.max(1),
            by_cmd: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, cmd_id: &str) -> Option<&Vec<Message>> {
        self.by_cmd.get(cmd_id)
    }

    fn insert(&mut self, cmd_id: String, frames: Vec<Message>) {
        if !self.by_cmd.contains_key(&cmd_id) {
            self.order.push_back(cmd_id.clone());
        }
        self.by_cmd.insert(cmd_id, frames);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.by_cmd.remove(&evicted);
            }
        }
    }
}

struct CommandSession {
    state: EndpointState,
    shell: CommandShell,
    responses: ResponseCache,
}

pub struct CommandServer {
    transport: SharedTransport,
    config: CommandServerConfig,
    active: Option<CommandSession>,
    server_seq: SequenceCounter,
    cursor: Option<String>,
}

impl CommandServer {
    pub fn new(transport: SharedTransport, config: CommandServerConfig) -> Self {
        CommandServer {
            transport,
            config,
            active: None,
            server_seq: SequenceCounter::new(),
            cursor: None,
        }
    }

    #[instrument(skip_all)]
    pub fn serve_forever(&mut self, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
        info!("server started with backend={}", self.transport.lock().unwrap().name());
        let worker = SyncWorker::spawn(
            "server",
            self.transport.clone(),
            self.config.fetch_interval,
            self.config.push_interval,
        );

        while !stop.load(Ordering::SeqCst) {
            for message in self.read_messages() {
                self.handle_message(&message);
            }
            thread::sleep(self.config.poll_interval);
        }

        worker.stop();
        self.close_active_session();
        Ok(())
    }

    fn read_messages(&mut self) -> Vec<Message> {
        let mut transport = self.transport.lock().unwrap();
        match transport.read_inbound_messages(self.cursor.as_deref()) {
            Ok((messages, cursor)) => {
                self.cursor = cursor;
                messages
            }
            Err(e) => {
                warn!("transport read failed: {e}");
                Vec::new()
            }
        }
    }

    fn make_message(&self, session_id: Uuid, payload: Payload) -> Option<Message> {
        match build_message(
            Protocol::ClipV1,
            payload,
            session_id,
            Endpoint::Server,
            Endpoint::Client,
            self.server_seq.next(),
        ) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("building outbound message: {e}");
                None
            }
        }
    }

    fn write_message(&self, message: &Message) {
        let mut transport = self.transport.lock().unwrap();
        if let Err(e) = transport.write_outbound_message(message) {
            warn!("transport write failed: {e}");
            return;
        }
        // Best effort immediate flush; the sync worker retries and
        // paces whatever is left.
        if let Err(e) = transport.push_outbound() {
            debug!("immediate push failed, deferring to worker: {e}");
        }
    }

    fn emit(&self, session_id: Uuid, payload: Payload) {
        if let Some(message) = self.make_message(session_id, payload) {
            self.write_message(&message);
        }
    }

    fn prompt_context(&self) -> PromptContext {
        PromptContext { user: super::server_user(), cwd: None, host: super::server_hostname() }
    }

    fn chunk_text(&self, text: &str) -> Vec<String> {
        let size = self.config.max_output_chunk.max(1);
        let mut chunks = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            // Chunk on a char boundary at or below the size cap.
            let mut cut = size.min(rest.len());
            while cut > 0 && !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == 0 {
                cut = rest.len();
            }
            let (head, tail) = rest.split_at(cut);
            chunks.push(String::from(head));
            rest = tail;
        }
        chunks
    }

    #[instrument(skip_all, fields(session = %message.session_id))]
    fn handle_connect(&mut self, message: &Message) {
        if let Some(active) = self.active.as_ref() {
            if active.state.session_id == message.session_id {
                info!("re-acknowledging session {}", message.session_id);
                let shell_path = active.shell.shell_path.clone();
                self.emit(
                    message.session_id,
                    Payload::ConnectAck(ConnectAck {
                        shell: Some(shell_path),
                        backend: self.transport.lock().unwrap().name(),
                        stream_id: None,
                        prompt: self.prompt_context(),
                    }),
                );
                return;
            }

            info!("rejecting session {}: busy", message.session_id);
            self.emit(
                message.session_id,
                Payload::Busy(BusyBody {
                    reason: String::from("server has an active session"),
                }),
            );
            return;
        }

        let shell = match CommandShell::new(&self.config.preferred_shell) {
            Ok(shell) => shell,
            Err(e) => {
                self.emit(
                    message.session_id,
                    Payload::Error(ErrorBody { error: format!("failed to start shell: {e}") }),
                );
                return;
            }
        };

        info!("accepted session {} using {}", message.session_id, shell.shell_path);
        let shell_path = shell.shell_path.clone();
        self.active = Some(CommandSession {
            state: EndpointState::new(message.session_id),
            shell,
            responses: ResponseCache::new(self.config.response_cache_cap),
        });
        self.emit(
            message.session_id,
            Payload::ConnectAck(ConnectAck {
                shell: Some(shell_path),
                backend: self.transport.lock().unwrap().name(),
                stream_id: None,
                prompt: self.prompt_context(),
            }),
        );
    }

    fn handle_command(&mut self, message: &Message) {
        let (command, cmd_id) = match &message.payload {
            Payload::Cmd(req) => (req.command.clone(), req.cmd_id.clone()),
            _ => return,
        };

        // A retransmitted request (fresh msg_id or not) for a command
        // we already ran gets the cached response replayed instead of
        // a second execution.
        let cached = self
            .active
            .as_ref()
            .and_then(|session| session.responses.get(&cmd_id).cloned());
        if let Some(frames) = cached {
            debug!("replaying cached response for command {cmd_id}");
            for frame in &frames {
                self.write_message(frame);
            }
            return;
        }

        info!("executing command for session {}: {command:?}", message.session_id);
        let result = match self.active.as_ref() {
            Some(session) => session.shell.execute(&command, self.config.command_timeout),
            None => return,
        };
        let result = match result {
            Ok(result) => result,
            // Shell failures become the command's stderr, mirroring
            // what an ssh user would see.
            Err(e) => crate::daemon::shell::CommandResult {
                stdout: String::new(),
                stderr: format!("{e}\n"),
                exit_code: 1,
            },
        };

        let mut outgoing = Vec::new();
        for chunk in self.chunk_text(&result.stdout) {
            if let Some(frame) = self.make_message(
                message.session_id,
                Payload::Stdout(CmdData { cmd_id: cmd_id.clone(), data: chunk }),
            ) {
                outgoing.push(frame);
            }
        }
        for chunk in self.chunk_text(&result.stderr) {
            if let Some(frame) = self.make_message(
                message.session_id,
                Payload::Stderr(CmdData { cmd_id: cmd_id.clone(), data: chunk }),
            ) {
                outgoing.push(frame);
            }
        }
        if let Some(frame) = self.make_message(
            message.session_id,
            Payload::Exit(CmdExit {
                cmd_id: cmd_id.clone(),
                exit_code: result.exit_code,
                prompt: Some(self.prompt_context()),
            }),
        ) {
            outgoing.push(frame);
        }

        if let Some(session) = self.active.as_mut() {
            session.responses.insert(cmd_id, outgoing.clone());
        }
        for frame in &outgoing {
            self.write_message(frame);
        }
    }

    fn handle_session_message(&mut self, message: &Message) {
        let is_new = {
            let session = match self.active.as_mut() {
                Some(s) => s,
                None => return,
            };
            if session.state.session_id != message.session_id {
                return;
            }
            session.state.incoming_seen.mark(message.msg_id)
        };

        match &message.payload {
            // Commands replay their cached output on duplicates, so
            // they go through regardless of is_new.
            Payload::Cmd(_) => self.handle_command(message),
            _ if !is_new => {}
            Payload::Disconnect {} => {
                info!("disconnect requested for session {}", message.session_id);
                self.close_active_session();
            }
            Payload::Heartbeat {} => {}
            other => {
                self.emit(
                    message.session_id,
                    Payload::Error(ErrorBody {
                        error: format!("unsupported session message kind: {}", other.kind()),
                    }),
                );
            }
        }
    }

    pub fn handle_message(&mut self, message: &Message) {
        if message.target != Endpoint::Server {
            return;
        }
        if matches!(message.payload, Payload::ConnectReq(_)) {
            self.handle_connect(message);
            return;
        }
        if self.active.is_none() {
            return;
        }
        self.handle_session_message(message);
    }

    fn close_active_session(&mut self) {
        if let Some(session) = self.active.take() {
            info!("closing session {}", session.state.session_id);
        }
    }
}
