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

//! The streaming client: raw-mode bridge between the local terminal
//! and the remote pty.
//!
//! Connect floods `connect_req` retries (each with a fresh msg_id and
//! a higher seq) until the server acks, then the interactive loop
//! shuffles stdin batches out and pty output in, forwarding window
//! size changes and Ctrl-C along the way.

use std::{
    io,
    io::Write as _,
    os::fd::AsFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use base64::Engine as _;
use nix::poll::{self, PollFd, PollFlags};
use sidessh_protocol::{
    build_message, ConnectReq, Endpoint, Message, Payload, PromptContext, Protocol, PtyData,
    PtyResize, PtySignal, PtySize, SignalName,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    session::EndpointState,
    sync::SyncWorker,
    transport::{SharedTransport, TransportError},
    tty,
};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server is busy with another active session")]
    Busy,
    #[error("{0}")]
    Timeout(String),
    #[error("server rejected the session: {0}")]
    Server(String),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("local io failure: {0}")]
    Io(String),
    #[error("interrupted")]
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub session_timeout: Duration,
    pub retry_interval: Duration,
    pub fetch_interval: Duration,
    pub push_interval: Duration,
    pub stdin_batch_interval: Duration,
    pub input_chunk_bytes: usize,
    pub resize_debounce: Duration,
    pub no_raw: bool,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        StreamClientConfig {
            poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(300),
            retry_interval: Duration::from_millis(500),
            fetch_interval: Duration::from_millis(100),
            push_interval: Duration::from_millis(100),
            stdin_batch_interval: Duration::from_millis(20),
            input_chunk_bytes: 4096,
            resize_debounce: Duration::from_millis(100),
            no_raw: false,
        }
    }
}

pub struct StreamClient {
    transport: SharedTransport,
    config: StreamClientConfig,
    state: Option<EndpointState>,
    cursor: Option<String>,
    stream_id: Option<Uuid>,
    prompt: PromptContext,
    worker: Option<SyncWorker>,
    diag_pings_seen: u64,
    last_diag_phase: Option<String>,
    /// Raised by a SIGINT handler while the handshake is running;
    /// aborts the connect cleanly.
    interrupt: Option<Arc<AtomicBool>>,
}

impl StreamClient {
    pub fn new(transport: SharedTransport, config: StreamClientConfig) -> Self {
        StreamClient {
            transport,
            config,
            state: None,
            cursor: None,
            stream_id: None,
            prompt: PromptContext::default(),
            worker: None,
            diag_pings_seen: 0,
            last_diag_phase: None,
            interrupt: None,
        }
    }

    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_some() && self.stream_id.is_some()
    }

    pub fn prompt(&self) -> &PromptContext {
        &self.prompt
    }

    fn start_sync_worker(&mut self) {
        if self.worker.is_none() {
            self.worker = Some(SyncWorker::spawn(
                "client",
                self.transport.clone(),
                self.config.fetch_interval,
                self.config.push_interval,
            ));
        }
    }

    fn stop_sync_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
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

    fn write_message(&self, message: &Message) -> Result<(), ClientError> {
        let mut transport = self.transport.lock().unwrap();
        transport.write_outbound_message(message)?;
        // Kick an immediate push so handshakes are not at the mercy of
        // the worker's timer; the worker retries anything left over.
        if let Err(e) = transport.push_outbound() {
            debug!("immediate push failed, deferring to worker: {e}");
        }
        Ok(())
    }

    /// Handshake: retransmit connect_req until the server answers.
    /// Every retry is a fresh message so the server-side dedup cache
    /// never swallows it.
    #[instrument(skip_all)]
    pub fn connect(&mut self, host: &str, size: PtySize) -> Result<(), ClientError> {
        if self.state.is_some() {
            return Err(ClientError::Io(String::from("already connected")));
        }

        self.prompt = PromptContext::default();
        self.stream_id = None;
        self.start_sync_worker();

        let result = self.connect_inner(host, size);
        if result.is_err() {
            self.state = None;
            self.stream_id = None;
            self.stop_sync_worker();
        }
        result
    }

    fn connect_inner(&mut self, host: &str, size: PtySize) -> Result<(), ClientError> {
        {
            let mut transport = self.transport.lock().unwrap();
            if let Err(e) = transport.fetch_inbound() {
                warn!("initial fetch failed: {e}");
            }
            self.cursor = transport.snapshot_inbound_cursor();
        }

        let session_id = Uuid::new_v4();
        let mut state = EndpointState::new(session_id);
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut next_send = Instant::now();

        info!("connecting session {session_id} to {host}");
        while Instant::now() < deadline {
            if let Some(flag) = self.interrupt.as_ref() {
                if flag.swap(false, Ordering::SeqCst) {
                    return Err(ClientError::Interrupted);
                }
            }

            let now = Instant::now();
            if now >= next_send {
                let request = build_message(
                    Protocol::StreamV2,
                    Payload::ConnectReq(ConnectReq {
                        host: String::from(host),
                        pty: Some(size.clone()),
                    }),
                    session_id,
                    Endpoint::Client,
                    Endpoint::Server,
                    state.outgoing_seq.next(),
                )
                .map_err(|e| ClientError::Io(e.to_string()))?;
                self.write_message(&request)?;
                next_send = now + self.config.retry_interval;
                debug!("sent connect_req for session {session_id}");
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
                    Payload::DiagPing(ping) => {
                        self.diag_pings_seen += 1;
                        self.last_diag_phase = Some(ping.phase);
                        debug!(
                            "received diag_ping during connect (count={}, seq={})",
                            self.diag_pings_seen, incoming.seq
                        );
                    }
                    Payload::ConnectAck(ack) => {
                        let stream_id = match ack.stream_id {
                            Some(id) => id,
                            None => {
                                return Err(ClientError::Server(String::from(
                                    "connect_ack did not include stream_id",
                                )))
                            }
                        };
                        self.prompt = ack.prompt;
                        self.stream_id = Some(stream_id);
                        self.state = Some(state);
                        info!("connected session {session_id}, stream_id={stream_id}");
                        return Ok(());
                    }
                    Payload::Busy(_) => return Err(ClientError::Busy),
                    Payload::Error(body) => return Err(ClientError::Server(body.error)),
                    _ => {}
                }
            }

            thread::sleep(self.config.poll_interval);
        }

        let suffix = if self.diag_pings_seen > 0 {
            format!(
                " (diag_pings_received={}, last_diag_phase={})",
                self.diag_pings_seen,
                self.last_diag_phase.as_deref().unwrap_or("unknown")
            )
        } else {
            String::new()
        };
        Err(ClientError::Timeout(format!(
            "timed out waiting for server connect_ack{suffix}"
        )))
    }

    fn write_session_payload(&mut self, payload: Payload) -> Result<(), ClientError> {
        let (session_id, seq) = match self.state.as_ref() {
            Some(state) => (state.session_id, state.outgoing_seq.next()),
            None => return Err(ClientError::Io(String::from("not connected"))),
        };

        let message = build_message(
            Protocol::StreamV2,
            payload,
            session_id,
            Endpoint::Client,
            Endpoint::Server,
            seq,
        )
        .map_err(|e| ClientError::Io(e.to_string()))?;
        self.write_message(&message)
    }

    pub fn send_pty_input(&mut self, data: &[u8]) -> Result<(), ClientError> {
        if data.is_empty() {
            return Ok(());
        }
        let stream_id = self.stream_id.ok_or_else(|| {
            ClientError::Io(String::from("pty stream is not established"))
        })?;
        self.write_session_payload(Payload::PtyInput(PtyData {
            stream_id,
            data_b64: BASE64.encode(data),
        }))
    }

    pub fn send_pty_resize(&mut self, cols: u16, rows: u16) -> Result<(), ClientError> {
        let stream_id = self.stream_id.ok_or_else(|| {
            ClientError::Io(String::from("pty stream is not established"))
        })?;
        self.write_session_payload(Payload::PtyResize(PtyResize {
            stream_id,
            cols: cols.max(1),
            rows: rows.max(1),
        }))
    }

    pub fn send_pty_signal(&mut self, signal: SignalName) -> Result<(), ClientError> {
        let stream_id = self.stream_id.ok_or_else(|| {
            ClientError::Io(String::from("pty stream is not established"))
        })?;
        self.write_session_payload(Payload::PtySignal(PtySignal { stream_id, signal }))
    }

    /// Drain inbound messages, feeding pty output to `on_output`.
    /// Returns the remote exit code once pty_closed arrives.
    pub fn pump_messages(
        &mut self,
        on_output: &mut dyn FnMut(&[u8]),
    ) -> Result<Option<i32>, ClientError> {
        let mut exit_code = None;
        for incoming in self.read_messages() {
            if let Some(code) = self.handle_incoming(&incoming, on_output)? {
                exit_code = Some(code);
            }
        }
        Ok(exit_code)
    }

    fn handle_incoming(
        &mut self,
        incoming: &Message,
        on_output: &mut dyn FnMut(&[u8]),
    ) -> Result<Option<i32>, ClientError> {
        let stream_id = match self.stream_id {
            Some(id) => id,
            None => return Ok(None),
        };
        {
            let state = match self.state.as_mut() {
                Some(state) => state,
                None => return Ok(None),
            };
            if incoming.target != Endpoint::Client || incoming.source != Endpoint::Server {
                return Ok(None);
            }
            if incoming.session_id != state.session_id {
                return Ok(None);
            }
            if !state.incoming_seen.mark(incoming.msg_id) {
                return Ok(None);
            }
        }

        match &incoming.payload {
            Payload::PtyOutput(output) => {
                if output.stream_id != stream_id {
                    return Ok(None);
                }
                if let Ok(data) = BASE64.decode(output.data_b64.as_bytes()) {
                    if !data.is_empty() {
                        on_output(&data);
                    }
                }
                Ok(None)
            }
            Payload::PtyClosed(closed) => {
                if closed.stream_id != stream_id {
                    return Ok(None);
                }
                Ok(Some(closed.exit_code))
            }
            Payload::Error(body) => Err(ClientError::Server(body.error.clone())),
            Payload::DiagPing(ping) => {
                self.diag_pings_seen += 1;
                self.last_diag_phase = Some(ping.phase.clone());
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Best-effort teardown: tell the server we are leaving and stop
    /// the sync worker either way.
    pub fn disconnect(&mut self) {
        if let Some(state) = self.state.take() {
            let message = build_message(
                Protocol::StreamV2,
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
        self.stream_id = None;
        self.prompt = PromptContext::default();
        self.stop_sync_worker();
    }

    /// The full interactive session: connect, put the local tty into
    /// raw mode, and bridge until the remote shell exits.
    #[instrument(skip_all)]
    pub fn run_interactive(&mut self, host: &str) -> Result<i32, ClientError> {
        let size = local_tty_size();
        self.connect(host, size)?;

        let result = self.interactive_loop();
        self.disconnect();
        result
    }

    fn interactive_loop(&mut self) -> Result<i32, ClientError> {
        let _raw_guard = if self.config.no_raw {
            None
        } else {
            Some(
                tty::set_attach_flags()
                    .map_err(|e| ClientError::Io(format!("setting raw mode: {e}")))?,
            )
        };

        let resize_pending = Arc::new(AtomicBool::new(true));
        let sigint_pending = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGWINCH, resize_pending.clone())
            .map_err(|e| ClientError::Io(format!("registering SIGWINCH: {e}")))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, sigint_pending.clone())
            .map_err(|e| ClientError::Io(format!("registering SIGINT: {e}")))?;

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut input_buffer: Vec<u8> = Vec::new();
        let mut last_input_flush = Instant::now();
        let mut next_resize_send = Instant::now();
        let mut last_activity = Instant::now();

        let output_seen = std::cell::Cell::new(false);
        let mut emit_output = |data: &[u8]| {
            output_seen.set(true);
            let _ = stdout.write_all(data);
            let _ = stdout.flush();
        };

        loop {
            let now = Instant::now();

            if resize_pending.load(Ordering::SeqCst) && now >= next_resize_send {
                resize_pending.store(false, Ordering::SeqCst);
                let size = local_tty_size();
                self.send_pty_resize(size.cols, size.rows)?;
                next_resize_send = now + self.config.resize_debounce;
            }

            if sigint_pending.swap(false, Ordering::SeqCst) {
                self.send_pty_signal(SignalName::Int)?;
            }

            let diag_before = self.diag_pings_seen;
            if let Some(exit_code) = self.pump_messages(&mut emit_output)? {
                return Ok(exit_code);
            }
            // Anything arriving from the server, including diag
            // heartbeats, resets the idle watchdog.
            if output_seen.replace(false) || self.diag_pings_seen > diag_before {
                last_activity = Instant::now();
            }

            let flush_due = !input_buffer.is_empty()
                && (input_buffer.len() >= self.config.input_chunk_bytes
                    || last_input_flush.elapsed() >= self.config.stdin_batch_interval);
            if flush_due {
                let batch = std::mem::take(&mut input_buffer);
                self.send_pty_input(&batch)?;
                last_input_flush = Instant::now();
                last_activity = Instant::now();
            }

            let timeout_ms =
                self.config.poll_interval.as_millis().min(u128::from(u16::MAX)) as u16;
            let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
            let nready = match poll::poll(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => 0,
                Err(e) => return Err(ClientError::Io(format!("polling stdin: {e}"))),
            };
            if nready > 0 {
                let mut buf = vec![0u8; self.config.input_chunk_bytes.max(1)];
                match nix::unistd::read(&stdin, &mut buf) {
                    Ok(0) => return Ok(0),
                    Ok(n) => {
                        input_buffer.extend_from_slice(&buf[..n]);
                        last_activity = Instant::now();
                        if input_buffer.len() >= self.config.input_chunk_bytes {
                            let batch = std::mem::take(&mut input_buffer);
                            self.send_pty_input(&batch)?;
                            last_input_flush = Instant::now();
                        }
                    }
                    Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => {}
                    Err(e) => return Err(ClientError::Io(format!("reading stdin: {e}"))),
                }
            }

            if last_activity.elapsed() > self.config.session_timeout {
                return Err(ClientError::Timeout(String::from(
                    "timed out waiting for pty stream activity",
                )));
            }
        }
    }
}

fn local_tty_size() -> PtySize {
    match tty::Size::from_fd(0) {
        Ok(size) if size.cols > 0 && size.rows > 0 => {
            PtySize { cols: size.cols, rows: size.rows }
        }
        _ => PtySize { cols: 80, rows: 24 },
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use crate::{
        daemon::server::{StreamServer, StreamServerConfig},
        transport::{shared, testing::message_pipe, TransportBackend},
    };

    use super::*;

    fn fast_config() -> StreamClientConfig {
        StreamClientConfig {
            poll_interval: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(400),
            retry_interval: Duration::from_millis(40),
            fetch_interval: Duration::from_millis(10),
            push_interval: Duration::from_millis(10),
            ..StreamClientConfig::default()
        }
    }

    #[test]
    #[ntest::timeout(60000)]
    fn connect_retries_carry_fresh_ids_and_rising_seqs() {
        let (client_end, _server_end) = message_pipe();
        let written = client_end.written_log();
        let mut client = StreamClient::new(shared(Box::new(client_end)), fast_config());

        let err = client
            .connect("nowhere", PtySize { cols: 80, rows: 24 })
            .expect_err("no server, must time out");
        assert!(matches!(err, ClientError::Timeout(_)));

        let written = written.lock().unwrap();
        let requests: Vec<&Message> = written
            .iter()
            .filter(|m| matches!(m.payload, Payload::ConnectReq(_)))
            .collect();
        assert!(requests.len() >= 2, "expected retries, got {}", requests.len());

        let mut ids = std::collections::HashSet::new();
        let mut last_seq = 0;
        for request in &requests {
            assert!(ids.insert(request.msg_id), "msg_id reused across retries");
            assert!(request.seq > last_seq, "seq not strictly increasing");
            last_seq = request.seq;
        }
    }

    #[test]
    #[ntest::timeout(60000)]
    fn busy_reply_aborts_connect() {
        let (client_end, mut server_end) = message_pipe();
        let mut client = StreamClient::new(shared(Box::new(client_end)), fast_config());

        let responder = thread::spawn(move || loop {
            let (messages, _) = server_end.read_inbound_messages(None).expect("read");
            for message in messages {
                if let Payload::ConnectReq(_) = message.payload {
                    let busy = build_message(
                        Protocol::StreamV2,
                        Payload::Busy(sidessh_protocol::BusyBody {
                            reason: String::from("server has an active session"),
                        }),
                        message.session_id,
                        Endpoint::Server,
                        Endpoint::Client,
                        1,
                    )
                    .expect("build busy");
                    server_end.write_outbound_message(&busy).expect("write");
                    return;
                }
            }
            thread::sleep(Duration::from_millis(2));
        });

        let err = client
            .connect("busyhost", PtySize { cols: 80, rows: 24 })
            .expect_err("busy must abort");
        assert!(matches!(err, ClientError::Busy));
        responder.join().expect("responder");
    }

    #[test]
    #[ntest::timeout(60000)]
    fn interactive_bridge_against_real_server() {
        let (client_end, server_end) = message_pipe();
        let server_transport = shared(Box::new(server_end));
        let stop = Arc::new(AtomicBool::new(false));

        let server_stop = stop.clone();
        let server_handle = thread::spawn(move || {
            let mut server = StreamServer::new(
                server_transport,
                StreamServerConfig {
                    preferred_shell: String::from("sh"),
                    poll_interval: Duration::from_millis(5),
                    io_flush_interval: Duration::from_millis(5),
                    fetch_interval: Duration::from_millis(10),
                    push_interval: Duration::from_millis(10),
                    ..StreamServerConfig::default()
                },
            );
            server.serve_forever(server_stop)
        });

        let mut client = StreamClient::new(
            shared(Box::new(client_end)),
            StreamClientConfig {
                connect_timeout: Duration::from_secs(20),
                ..fast_config()
            },
        );
        client
            .connect("devbox", PtySize { cols: 80, rows: 24 })
            .expect("connect");
        assert!(client.is_connected());

        client.send_pty_input(b"echo bridge-check\n").expect("send input");

        let mut output = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            let mut sink = |data: &[u8]| output.extend_from_slice(data);
            client.pump_messages(&mut sink).expect("pump");
            if String::from_utf8_lossy(&output).contains("bridge-check") {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(String::from_utf8_lossy(&output).contains("bridge-check"));

        client.send_pty_input(b"exit 4\n").expect("send exit");
        let mut exit_code = None;
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline && exit_code.is_none() {
            let mut sink = |_: &[u8]| {};
            exit_code = client.pump_messages(&mut sink).expect("pump");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(exit_code, Some(4));

        client.disconnect();
        stop.store(true, Ordering::SeqCst);
        server_handle.join().expect("server thread").expect("server result");
    }
}
