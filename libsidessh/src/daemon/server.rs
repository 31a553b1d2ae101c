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

//! The streaming PTY server: accepts one session at a time, bridges
//! its messages to a shell on a pty, and streams the shell's output
//! back in batched chunks.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use base64::Engine as _;
use sidessh_protocol::{
    build_message, BusyBody, ConnectAck, DiagPing, Endpoint, ErrorBody, Message, Payload,
    PromptContext, Protocol, PtyClosed, PtyData,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    consts,
    daemon::shell::{resolve_shell, PtyShellSession},
    session::{EndpointState, SequenceCounter},
    sync::SyncWorker,
    transport::SharedTransport,
};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    pub poll_interval: Duration,
    pub fetch_interval: Duration,
    pub push_interval: Duration,
    pub max_output_chunk: usize,
    pub io_flush_interval: Duration,
    pub preferred_shell: String,
    /// How many times to resend connect_ack when a duplicate
    /// connect_req for the live session arrives. Lossy first-packet
    /// media (audio) set this above one.
    pub connect_ack_burst: u32,
    /// Periodic diag_ping emission; None disables the heartbeat.
    pub diag_interval: Option<Duration>,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        StreamServerConfig {
            poll_interval: Duration::from_millis(100),
            fetch_interval: Duration::from_millis(100),
            push_interval: Duration::from_millis(100),
            max_output_chunk: 4096,
            io_flush_interval: Duration::from_millis(20),
            preferred_shell: String::from("tcsh"),
            connect_ack_burst: 1,
            diag_interval: None,
        }
    }
}

/// The single live session: per-session protocol state plus the shell
/// it drives and the output spool in front of the transport.
struct ActiveSession {
    state: EndpointState,
    shell: PtyShellSession,
    stream_id: Uuid,
    pending_output: Vec<u8>,
    last_flush_at: Instant,
}

pub struct StreamServer {
    transport: SharedTransport,
    config: StreamServerConfig,
    active: Option<ActiveSession>,
    server_seq: SequenceCounter,
    cursor: Option<String>,
    diag_counter: u64,
    next_diag_at: Instant,
}

impl StreamServer {
    pub fn new(transport: SharedTransport, config: StreamServerConfig) -> Self {
        StreamServer {
            transport,
            config,
            active: None,
            server_seq: SequenceCounter::new(),
            cursor: None,
            diag_counter: 0,
            next_diag_at: Instant::now(),
        }
    }

    /// Run the server until `stop` is raised. Owns the sync worker
    /// for the duration.
    #[instrument(skip_all)]
    pub fn serve_forever(&mut self, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
        info!("server started with backend={}", self.transport.lock().unwrap().name());
        let worker = SyncWorker::spawn(
            "server",
            self.transport.clone(),
            self.config.fetch_interval,
            self.config.push_interval,
        );

        {
            let mut transport = self.transport.lock().unwrap();
            if let Err(e) = transport.fetch_inbound() {
                warn!("initial fetch failed: {e}");
            }
            self.cursor = transport.snapshot_inbound_cursor();
        }

        while !stop.load(Ordering::SeqCst) {
            for message in self.read_messages() {
                self.handle_message(&message);
            }

            self.drain_pty_output();
            self.check_for_shell_exit();
            self.maybe_emit_diag();

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

    fn write_message(&self, session_id: Uuid, payload: Payload) {
        let message = match build_message(
            Protocol::StreamV2,
            payload,
            session_id,
            Endpoint::Server,
            Endpoint::Client,
            self.server_seq.next(),
        ) {
            Ok(m) => m,
            Err(e) => {
                error!("building outbound message: {e}");
                return;
            }
        };

        if let Err(e) = self.transport.lock().unwrap().write_outbound_message(&message) {
            warn!("transport write failed: {e}");
        }
    }

    fn session_error(&self, session_id: Uuid, text: impl Into<String>) {
        let text = text.into();
        warn!("session error: {text}");
        self.write_message(session_id, Payload::Error(ErrorBody { error: text }));
    }

    fn prompt_context(&self) -> PromptContext {
        PromptContext {
            user: super::server_user(),
            cwd: None,
            host: super::server_hostname(),
        }
    }

    fn connect_ack(&self, shell_path: &str, stream_id: Uuid) -> Payload {
        Payload::ConnectAck(ConnectAck {
            shell: Some(String::from(shell_path)),
            backend: self.transport.lock().unwrap().name(),
            stream_id: Some(stream_id),
            prompt: self.prompt_context(),
        })
    }

    #[instrument(skip_all, fields(session = %message.session_id))]
    fn handle_connect(&mut self, message: &Message) {
        let req = match &message.payload {
            Payload::ConnectReq(req) => req,
            _ => return,
        };

        if let Some(active) = self.active.as_ref() {
            if active.state.session_id == message.session_id {
                info!("re-acknowledging session {}", message.session_id);
                let ack = self.connect_ack(&active.shell.shell_path, active.stream_id);
                // Burst the re-ack on lossy media so a dropped first
                // ack does not strand the client.
                for _ in 0..self.config.connect_ack_burst.max(1) {
                    self.write_message(message.session_id, ack.clone());
                }
                return;
            }

            info!("rejecting session {}: busy", message.session_id);
            self.write_message(
                message.session_id,
                Payload::Busy(BusyBody {
                    reason: String::from("server has an active session"),
                }),
            );
            return;
        }

        let (cols, rows) = match &req.pty {
            Some(size) => (size.cols.max(1), size.rows.max(1)),
            None => (80, 24),
        };

        let shell_path = match resolve_shell(&self.config.preferred_shell) {
            Ok(path) => path,
            Err(e) => {
                self.session_error(message.session_id, format!("failed to start pty shell: {e}"));
                return;
            }
        };
        let shell = match PtyShellSession::spawn(&shell_path, cols, rows) {
            Ok(shell) => shell,
            Err(e) => {
                self.session_error(message.session_id, format!("failed to start pty shell: {e}"));
                return;
            }
        };

        let stream_id = Uuid::new_v4();
        info!(
            "accepted session {} using {shell_path} (stream_id={stream_id})",
            message.session_id
        );
        let ack = {
            self.active = Some(ActiveSession {
                state: EndpointState::new(message.session_id),
                shell,
                stream_id,
                pending_output: Vec::new(),
                last_flush_at: Instant::now(),
            });
            self.connect_ack(&shell_path, stream_id)
        };
        self.write_message(message.session_id, ack);
    }

    fn handle_pty_input(&mut self, message: &Message) {
        let input = match &message.payload {
            Payload::PtyInput(input) => input,
            _ => return,
        };
        let expected_stream = match self.active.as_ref() {
            Some(s) => s.stream_id,
            None => return,
        };

        if input.stream_id != expected_stream {
            self.session_error(
                message.session_id,
                "pty_input stream_id does not match active stream",
            );
            return;
        }

        let data = match BASE64.decode(input.data_b64.as_bytes()) {
            Ok(data) => data,
            Err(_) => {
                self.session_error(message.session_id, "pty_input contains invalid base64 data");
                return;
            }
        };
        if data.is_empty() {
            return;
        }

        let write_res = match self.active.as_mut() {
            Some(s) => s.shell.write_input(&data),
            None => return,
        };
        if let Err(e) = write_res {
            self.session_error(message.session_id, format!("failed to write PTY input: {e}"));
        }
    }

    fn handle_pty_resize(&mut self, message: &Message) {
        let resize = match &message.payload {
            Payload::PtyResize(resize) => resize,
            _ => return,
        };
        let expected_stream = match self.active.as_ref() {
            Some(s) => s.stream_id,
            None => return,
        };

        if resize.stream_id != expected_stream {
            self.session_error(
                message.session_id,
                "pty_resize stream_id does not match active stream",
            );
            return;
        }

        let resize_res = match self.active.as_mut() {
            Some(s) => s.shell.resize(resize.cols.max(1), resize.rows.max(1)),
            None => return,
        };
        if let Err(e) = resize_res {
            self.session_error(message.session_id, format!("failed to resize PTY: {e}"));
        }
    }

    fn handle_pty_signal(&mut self, message: &Message) {
        let sig = match &message.payload {
            Payload::PtySignal(sig) => sig,
            _ => return,
        };
        let expected_stream = match self.active.as_ref() {
            Some(s) => s.stream_id,
            None => return,
        };

        if sig.stream_id != expected_stream {
            self.session_error(
                message.session_id,
                "pty_signal stream_id does not match active stream",
            );
            return;
        }

        let signal_res = match self.active.as_mut() {
            Some(s) => s.shell.send_signal(sig.signal),
            None => return,
        };
        if let Err(e) = signal_res {
            self.session_error(
                message.session_id,
                format!("failed to send signal to PTY: {e}"),
            );
        }
    }

    fn handle_disconnect(&mut self, message: &Message) {
        info!("disconnect requested for session {}", message.session_id);
        self.close_active_session();
    }

    fn handle_session_message(&mut self, message: &Message) {
        {
            let session = match self.active.as_mut() {
                Some(s) => s,
                None => return,
            };
            if session.state.session_id != message.session_id {
                return;
            }
            if !session.state.incoming_seen.mark(message.msg_id) {
                debug!("dropping duplicate msg {}", message.msg_id);
                return;
            }
        }

        match &message.payload {
            Payload::PtyInput(_) => self.handle_pty_input(message),
            Payload::PtyResize(_) => self.handle_pty_resize(message),
            Payload::PtySignal(_) => self.handle_pty_signal(message),
            Payload::Disconnect {} => self.handle_disconnect(message),
            other => self.session_error(
                message.session_id,
                format!("unsupported session message kind: {}", other.kind()),
            ),
        }
    }

    fn handle_message(&mut self, message: &Message) {
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

    fn emit_pty_output(&self, session_id: Uuid, stream_id: Uuid, data: &[u8]) {
        self.write_message(
            session_id,
            Payload::PtyOutput(PtyData {
                stream_id,
                data_b64: BASE64.encode(data),
            }),
        );
    }

    /// Cut chunks out of the pending buffer. Without `force`, a
    /// partial chunk only flushes once `io_flush_interval` has gone by
    /// since the last flush, batching bursty single-byte echo into
    /// fewer frames.
    fn flush_pending_output(&mut self, force: bool) {
        let chunk_size = self.config.max_output_chunk.max(1);
        let flush_interval = self.config.io_flush_interval;

        loop {
            let (session_id, stream_id, data) = {
                let session = match self.active.as_mut() {
                    Some(s) => s,
                    None => return,
                };
                if session.pending_output.is_empty() {
                    return;
                }

                let due = force
                    || session.pending_output.len() >= chunk_size
                    || session.last_flush_at.elapsed() >= flush_interval;
                if !due {
                    return;
                }

                let take = chunk_size.min(session.pending_output.len());
                let data: Vec<u8> = session.pending_output.drain(..take).collect();
                session.last_flush_at = Instant::now();
                (session.state.session_id, session.stream_id, data)
            };

            self.emit_pty_output(session_id, stream_id, &data);

            if !force {
                let done = self
                    .active
                    .as_ref()
                    .map(|s| s.pending_output.len() < chunk_size)
                    .unwrap_or(true);
                if done {
                    return;
                }
            }
        }
    }

    fn drain_pty_output(&mut self) {
        let chunk_size = self.config.max_output_chunk.max(1);
        loop {
            let data = {
                let session = match self.active.as_mut() {
                    Some(s) => s,
                    None => return,
                };
                match session.shell.read_output(chunk_size) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("pty output read failed: {e}");
                        break;
                    }
                }
            };
            if data.is_empty() {
                break;
            }

            if let Some(session) = self.active.as_mut() {
                session.pending_output.extend_from_slice(&data);
            }
            self.flush_pending_output(false);
        }

        self.flush_pending_output(false);
    }

    fn check_for_shell_exit(&mut self) {
        let exited = match self.active.as_mut() {
            Some(session) => !session.shell.is_alive(),
            None => return,
        };
        if !exited {
            return;
        }

        // Get the last of the output out before announcing the close,
        // so pty_output never trails pty_closed.
        self.drain_pty_output();
        self.flush_pending_output(true);

        if let Some(session) = self.active.as_mut() {
            let exit_code = session.shell.exit_code().unwrap_or(1);
            let session_id = session.state.session_id;
            let stream_id = session.stream_id;
            info!("shell exited with code {exit_code}, closing session {session_id}");
            self.write_message(
                session_id,
                Payload::PtyClosed(PtyClosed { stream_id, exit_code }),
            );
        }
        self.close_active_session();
    }

    fn maybe_emit_diag(&mut self) {
        let interval = match self.config.diag_interval {
            Some(interval) => interval,
            None => return,
        };
        if Instant::now() < self.next_diag_at {
            return;
        }
        self.next_diag_at = Instant::now() + interval;
        self.diag_counter += 1;

        let (session_id, phase, active, stream_id) = match self.active.as_ref() {
            Some(session) => (
                session.state.session_id,
                String::from("session"),
                true,
                Some(session.stream_id),
            ),
            None => (consts::DIAG_IDLE_SESSION_ID, String::from("idle"), false, None),
        };

        self.write_message(
            session_id,
            Payload::DiagPing(DiagPing {
                phase,
                diag_counter: self.diag_counter,
                active_session: active,
                stream_id,
            }),
        );
    }

    fn close_active_session(&mut self) {
        if let Some(mut session) = self.active.take() {
            info!("closing session {}", session.state.session_id);
            session.shell.close();
        }
    }
}

#[cfg(test)]
mod test {
    use sidessh_protocol::{ConnectReq, PtySize};

    use crate::transport::{shared, testing::message_pipe, TransportBackend};

    use super::*;

    fn connect_req(session_id: Uuid, seq: u64) -> Message {
        build_message(
            Protocol::StreamV2,
            Payload::ConnectReq(ConnectReq {
                host: String::from("testhost"),
                pty: Some(PtySize { cols: 80, rows: 24 }),
            }),
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            seq,
        )
        .expect("build to succeed")
    }

    fn server_with_pipe() -> (StreamServer, crate::transport::testing::PipeTransport) {
        let (server_end, client_end) = message_pipe();
        let config = StreamServerConfig {
            preferred_shell: String::from("sh"),
            poll_interval: Duration::from_millis(5),
            io_flush_interval: Duration::from_millis(5),
            ..StreamServerConfig::default()
        };
        (StreamServer::new(shared(Box::new(server_end)), config), client_end)
    }

    fn drain(client: &mut crate::transport::testing::PipeTransport) -> Vec<Message> {
        client.read_inbound_messages(None).expect("read").0
    }

    #[test]
    #[ntest::timeout(60000)]
    fn connect_then_echo_then_exit() {
        let (mut server, mut client) = server_with_pipe();
        let session_id = Uuid::new_v4();

        server.handle_message(&connect_req(session_id, 1));

        let replies = drain(&mut client);
        let ack = replies
            .iter()
            .find_map(|m| match &m.payload {
                Payload::ConnectAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .expect("connect_ack");
        let stream_id = ack.stream_id.expect("stream id");
        assert!(ack.shell.expect("shell path").ends_with("sh"));

        // Type a command at the shell.
        let input = build_message(
            Protocol::StreamV2,
            Payload::PtyInput(PtyData {
                stream_id,
                data_b64: BASE64.encode(b"echo stream-check\n"),
            }),
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            2,
        )
        .expect("build input");
        server.handle_message(&input);

        let mut output = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            server.drain_pty_output();
            for message in drain(&mut client) {
                if let Payload::PtyOutput(data) = &message.payload {
                    assert_eq!(data.stream_id, stream_id);
                    output.extend(BASE64.decode(&data.data_b64).expect("valid base64"));
                }
            }
            if String::from_utf8_lossy(&output).contains("stream-check") {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(String::from_utf8_lossy(&output).contains("stream-check"));

        // Ask the shell to exit and expect a pty_closed frame.
        let exit_input = build_message(
            Protocol::StreamV2,
            Payload::PtyInput(PtyData {
                stream_id,
                data_b64: BASE64.encode(b"exit 5\n"),
            }),
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            3,
        )
        .expect("build exit input");
        server.handle_message(&exit_input);

        let mut closed = None;
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline && closed.is_none() {
            server.drain_pty_output();
            server.check_for_shell_exit();
            for message in drain(&mut client) {
                if let Payload::PtyClosed(body) = &message.payload {
                    closed = Some(body.clone());
                }
            }
            thread::sleep(Duration::from_millis(10));
        }

        let closed = closed.expect("pty_closed");
        assert_eq!(closed.stream_id, stream_id);
        assert_eq!(closed.exit_code, 5);
        assert!(server.active.is_none());
    }

    #[test]
    #[ntest::timeout(60000)]
    fn second_session_is_rejected_busy() {
        let (mut server, mut client) = server_with_pipe();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        server.handle_message(&connect_req(first, 1));
        drain(&mut client);

        server.handle_message(&connect_req(second, 1));
        let replies = drain(&mut client);
        let busy = replies
            .iter()
            .find(|m| matches!(m.payload, Payload::Busy(_)))
            .expect("busy reply");
        assert_eq!(busy.session_id, second);
    }

    #[test]
    #[ntest::timeout(60000)]
    fn duplicate_connect_req_is_reacked() {
        let (mut server, mut client) = server_with_pipe();
        server.config.connect_ack_burst = 3;
        let session_id = Uuid::new_v4();

        server.handle_message(&connect_req(session_id, 1));
        let first_ack = drain(&mut client);
        assert_eq!(
            first_ack.iter().filter(|m| matches!(m.payload, Payload::ConnectAck(_))).count(),
            1
        );

        // The retry carries a new msg_id, as a real client's would.
        server.handle_message(&connect_req(session_id, 2));
        let reacks = drain(&mut client);
        assert_eq!(
            reacks.iter().filter(|m| matches!(m.payload, Payload::ConnectAck(_))).count(),
            3
        );
    }

    #[test]
    #[ntest::timeout(60000)]
    fn duplicate_messages_are_ignored() {
        let (mut server, mut client) = server_with_pipe();
        let session_id = Uuid::new_v4();
        server.handle_message(&connect_req(session_id, 1));
        let stream_id = drain(&mut client)
            .iter()
            .find_map(|m| match &m.payload {
                Payload::ConnectAck(ack) => ack.stream_id,
                _ => None,
            })
            .expect("stream id");

        let resize = build_message(
            Protocol::StreamV2,
            Payload::PtyResize(sidessh_protocol::PtyResize {
                stream_id,
                cols: 100,
                rows: 50,
            }),
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            2,
        )
        .expect("build resize");

        server.handle_message(&resize);
        server.handle_message(&resize);
        // No error frames for the duplicate.
        let replies = drain(&mut client);
        assert!(replies.iter().all(|m| !matches!(m.payload, Payload::Error(_))));
    }

    #[test]
    fn diag_ping_uses_idle_session_id_when_no_session() {
        let (mut server, mut client) = server_with_pipe();
        server.config.diag_interval = Some(Duration::from_millis(1));
        server.next_diag_at = Instant::now();

        server.maybe_emit_diag();
        let replies = drain(&mut client);
        let diag = replies
            .iter()
            .find(|m| matches!(m.payload, Payload::DiagPing(_)))
            .expect("diag ping");
        assert_eq!(diag.session_id, consts::DIAG_IDLE_SESSION_ID);
        if let Payload::DiagPing(body) = &diag.payload {
            assert_eq!(body.phase, "idle");
            assert!(!body.active_session);
            assert!(body.stream_id.is_none());
        }
    }

    #[test]
    #[ntest::timeout(60000)]
    fn mismatched_stream_id_produces_error() {
        let (mut server, mut client) = server_with_pipe();
        let session_id = Uuid::new_v4();
        server.handle_message(&connect_req(session_id, 1));
        drain(&mut client);

        let bogus = build_message(
            Protocol::StreamV2,
            Payload::PtyInput(PtyData {
                stream_id: Uuid::new_v4(),
                data_b64: BASE64.encode(b"ls\n"),
            }),
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            2,
        )
        .expect("build input");
        server.handle_message(&bogus);

        let replies = drain(&mut client);
        assert!(replies.iter().any(|m| matches!(m.payload, Payload::Error(_))));
    }
}
