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

//! USB serial framed transport.
//!
//! Full duplex `USBS` link frames over a nonblocking serial fd, with
//! stop-and-wait retransmission per frame. The rx parser scans for the
//! magic to resynchronize after line noise, and partial writes keep an
//! offset so the next tick resumes mid-frame.

use std::{
    fs::File,
    io::{Read as _, Write as _},
    os::fd::{AsFd, OwnedFd},
    path::PathBuf,
    time::{Duration, Instant},
};

use nix::{
    fcntl,
    fcntl::OFlag,
    poll,
    poll::{PollFd, PollFlags},
    sys::stat::Mode,
    sys::termios,
    sys::termios::{BaudRate, SetArg, SpecialCharacterIndices},
};
use sidessh_protocol::{decode_message, encode_message, Message, Protocol};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{
    link,
    link::{ArqState, Inbound, TxItem},
    TransportBackend, TransportError,
};

const MAGIC: [u8; 4] = *b"USBS";
const RX_CHUNK: usize = 4096;
const MAX_READS_PER_TICK: usize = 32;

#[derive(Debug, Clone)]
pub struct SerialTransportConfig {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub frame_max_bytes: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub seen_seq_window: usize,
    pub configure_tty: bool,
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        SerialTransportConfig {
            baud_rate: 3_000_000,
            read_timeout: Duration::from_millis(5),
            write_timeout: Duration::from_millis(20),
            frame_max_bytes: 65536,
            ack_timeout: Duration::from_millis(150),
            max_retries: 20,
            seen_seq_window: 4096,
            configure_tty: true,
        }
    }
}

pub struct SerialTransportBackend {
    config: SerialTransportConfig,
    label: String,
    file: Option<File>,
    arq: ArqState,
    rx_buffer: Vec<u8>,
    incoming: Vec<Message>,
    inbound_cursor: u64,
    active_tx: Option<TxItem>,
    closed: bool,
}

impl SerialTransportBackend {
    /// Open the given serial device nonblocking and wrap it.
    pub fn open(port: PathBuf, config: SerialTransportConfig) -> Result<Self, TransportError> {
        let raw = fcntl::open(
            &port,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| {
            TransportError::Unavailable(format!("opening serial port {}: {e}", port.display()))
        })?;
        let label = format!("usb-serial:{}", port.display());
        Self::from_owned_fd(raw, label, config)
    }

    /// Wrap an already open duplex fd (tests connect two backends with
    /// a socketpair).
    pub fn from_fd(fd: OwnedFd, config: SerialTransportConfig) -> Result<Self, TransportError> {
        Self::from_owned_fd(fd, String::from("usb-serial:fd"), config)
    }

    fn from_owned_fd(
        fd: OwnedFd,
        label: String,
        config: SerialTransportConfig,
    ) -> Result<Self, TransportError> {
        set_nonblocking(&fd)?;
        if config.configure_tty {
            configure_raw_tty(&fd, config.baud_rate)?;
        }

        let arq = ArqState::new(
            MAGIC,
            config.ack_timeout,
            config.max_retries,
            config.seen_seq_window,
        );
        info!("serial transport ready on {label}");
        Ok(SerialTransportBackend {
            config,
            label,
            file: Some(File::from(fd)),
            arq,
            rx_buffer: Vec::new(),
            incoming: Vec::new(),
            inbound_cursor: 0,
            active_tx: None,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed || self.file.is_none() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<(), TransportError> {
        if self.file.is_none() {
            return Ok(());
        }

        let timeout_ms = self.config.read_timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        if timeout_ms > 0 {
            let nready = {
                let file = match self.file.as_ref() {
                    Some(f) => f,
                    None => return Ok(()),
                };
                let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                poll::poll(&mut fds, timeout_ms)
                    .map_err(|e| TransportError::Medium(format!("polling serial fd: {e}")))?
            };
            if nready == 0 {
                return Ok(());
            }
        }

        // Bound a single drain so heavy streams can't starve the main
        // loop.
        let mut chunk = [0u8; RX_CHUNK];
        for _ in 0..MAX_READS_PER_TICK {
            let read_res = match self.file.as_mut() {
                Some(f) => f.read(&mut chunk),
                None => return Ok(()),
            };
            match read_res {
                Ok(0) => break,
                Ok(n) => {
                    self.rx_buffer.extend_from_slice(&chunk[..n]);
                    self.parse_rx_buffer();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Medium(format!("serial read failed: {e}"))),
            }
        }

        Ok(())
    }

    fn parse_rx_buffer(&mut self) {
        while self.rx_buffer.len() >= link::HEADER_LEN {
            if self.rx_buffer[..4] != MAGIC {
                // Resynchronize on the next magic, keeping a partial
                // magic tail alive for the next read.
                match find_magic(&self.rx_buffer[1..]) {
                    Some(idx) => {
                        self.rx_buffer.drain(..idx + 1);
                    }
                    None => {
                        let keep = self.rx_buffer.len().saturating_sub(3);
                        self.rx_buffer.drain(..keep);
                        return;
                    }
                }
                continue;
            }

            let header = match link::parse_header(&MAGIC, &self.rx_buffer) {
                Some(h) => h,
                None => {
                    // Magic matched but the version did not; shift one
                    // byte and rescan.
                    self.rx_buffer.drain(..1);
                    continue;
                }
            };
            if header.payload_len as usize > self.config.frame_max_bytes.max(1) {
                self.rx_buffer.drain(..1);
                continue;
            }

            let frame_len = link::HEADER_LEN + header.payload_len as usize;
            if self.rx_buffer.len() < frame_len {
                return;
            }

            let payload: Vec<u8> =
                self.rx_buffer[link::HEADER_LEN..frame_len].to_vec();
            self.rx_buffer.drain(..frame_len);

            if let Inbound::Delivered(bytes) = self.arq.handle_frame(header, &payload) {
                let text = match String::from_utf8(bytes) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if let Some(message) = decode_message(&text, Protocol::StreamV2) {
                    trace!("rx seq={} kind={}", header.seq, message.payload.kind());
                    self.incoming.push(message);
                }
            }
        }
    }

    fn drain_tx(&mut self, deadline: Instant) -> Result<(), TransportError> {
        loop {
            if Instant::now() >= deadline {
                return Ok(());
            }

            let mut item = match self.active_tx.take() {
                Some(item) => item,
                None => match self.arq.pop_tx() {
                    Some(item) => item,
                    None => return Ok(()),
                },
            };

            if item.offset >= item.frame.len() {
                self.arq.mark_tx_complete(&item);
                continue;
            }

            let write_res = match self.file.as_mut() {
                Some(f) => f.write(&item.frame[item.offset..]),
                None => return Err(TransportError::Closed),
            };

            match write_res {
                Ok(0) => {
                    self.active_tx = Some(item);
                    return Ok(());
                }
                Ok(n) => {
                    item.offset += n;
                    if item.offset >= item.frame.len() {
                        self.arq.mark_tx_complete(&item);
                    } else {
                        self.active_tx = Some(item);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.active_tx = Some(item);
                        return Ok(());
                    }
                    let timeout_ms = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
                    {
                        let file = match self.file.as_ref() {
                            Some(f) => f,
                            None => return Err(TransportError::Closed),
                        };
                        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLOUT)];
                        poll::poll(&mut fds, timeout_ms.max(1)).map_err(|e| {
                            TransportError::Medium(format!("polling serial fd: {e}"))
                        })?;
                    }
                    self.active_tx = Some(item);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    self.active_tx = Some(item);
                }
                Err(e) => {
                    self.arq.mark_tx_failed(&item);
                    return Err(TransportError::Medium(format!("serial write failed: {e}")));
                }
            }
        }
    }
}

impl TransportBackend for SerialTransportBackend {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn snapshot_inbound_cursor(&mut self) -> Option<String> {
        Some(self.inbound_cursor.to_string())
    }

    fn read_inbound_messages(
        &mut self,
        _cursor: Option<&str>,
    ) -> Result<(Vec<Message>, Option<String>), TransportError> {
        self.ensure_open()?;
        self.read_available()?;

        let messages = std::mem::take(&mut self.incoming);
        self.inbound_cursor += messages.len() as u64;
        Ok((messages, Some(self.inbound_cursor.to_string())))
    }

    fn fetch_inbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.read_available()
    }

    fn write_outbound_message(&mut self, message: &Message) -> Result<Uuid, TransportError> {
        self.ensure_open()?;

        let payload = encode_message(message).into_bytes();
        if payload.len() > self.config.frame_max_bytes {
            return Err(TransportError::EncodeOversize {
                size: payload.len(),
                max: self.config.frame_max_bytes,
            });
        }

        let seq = self.arq.enqueue_data(&payload);
        debug!("queued seq={seq} kind={} ({} bytes)", message.payload.kind(), payload.len());
        Ok(message.msg_id)
    }

    fn push_outbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.read_available()?;

        let now = Instant::now();
        self.arq.schedule_due_frames(now)?;
        self.drain_tx(now + self.config.write_timeout.max(Duration::from_millis(1)))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.file = None;
        info!("closed serial transport {}", self.label);
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), TransportError> {
    let flags = fcntl::fcntl(fd.as_fd(), fcntl::FcntlArg::F_GETFL)
        .map_err(|e| TransportError::Medium(format!("getting serial fd flags: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd.as_fd(), fcntl::FcntlArg::F_SETFL(flags))
        .map_err(|e| TransportError::Medium(format!("setting serial fd nonblocking: {e}")))?;
    Ok(())
}

/// Apply raw 8N1 termios settings with the closest available baud.
/// Quietly skips fds that are not ttys, which is what tests hand us.
fn configure_raw_tty(fd: &OwnedFd, baud_rate: u32) -> Result<(), TransportError> {
    let mut term = match termios::tcgetattr(fd.as_fd()) {
        Ok(t) => t,
        Err(_) => return Ok(()),
    };

    use termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags};
    term.input_flags = InputFlags::empty();
    term.output_flags = OutputFlags::empty();
    term.local_flags = LocalFlags::empty();
    term.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    term.control_flags &=
        !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CSIZE);
    term.control_flags |= ControlFlags::CS8;

    term.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    term.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    if let Some(speed) = closest_baud(baud_rate) {
        let _ = termios::cfsetispeed(&mut term, speed);
        let _ = termios::cfsetospeed(&mut term, speed);
    }

    termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &term)
        .map_err(|e| TransportError::Medium(format!("configuring serial tty: {e}")))?;
    Ok(())
}

/// Requested baud if supported, otherwise the fastest rate from a
/// descending preference ladder.
fn closest_baud(baud_rate: u32) -> Option<BaudRate> {
    let ladder = [
        (3_000_000, BaudRate::B3000000),
        (2_000_000, BaudRate::B2000000),
        (1_000_000, BaudRate::B1000000),
        (921_600, BaudRate::B921600),
        (460_800, BaudRate::B460800),
        (230_400, BaudRate::B230400),
        (115_200, BaudRate::B115200),
    ];

    ladder
        .iter()
        .find(|(rate, _)| *rate == baud_rate)
        .or_else(|| ladder.first())
        .map(|(_, baud)| *baud)
}

#[cfg(test)]
mod test {
    use std::{io::Write as _, thread};

    use assert_matches::assert_matches;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use sidessh_protocol::{build_message, Endpoint, Payload, Protocol};

    use super::*;

    fn test_config() -> SerialTransportConfig {
        SerialTransportConfig {
            read_timeout: Duration::from_millis(1),
            write_timeout: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(20),
            max_retries: 3,
            configure_tty: false,
            ..SerialTransportConfig::default()
        }
    }

    fn pair() -> (SerialTransportBackend, SerialTransportBackend) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .expect("socketpair");
        (
            SerialTransportBackend::from_fd(a, test_config()).expect("backend a"),
            SerialTransportBackend::from_fd(b, test_config()).expect("backend b"),
        )
    }

    fn stream_frame(seq: u64) -> Message {
        build_message(
            Protocol::StreamV2,
            Payload::Disconnect {},
            Uuid::new_v4(),
            Endpoint::Client,
            Endpoint::Server,
            seq,
        )
        .expect("build to succeed")
    }

    #[test]
    fn delivers_exactly_once_under_retransmission() {
        let (mut sender, mut receiver) = pair();
        let message = stream_frame(1);
        sender.write_outbound_message(&message).expect("write");

        let mut received = Vec::new();
        for _ in 0..12 {
            // Sending twice without waiting for acks forces duplicate
            // DATA frames onto the wire.
            let _ = sender.push_outbound();
            let (mut msgs, _) = receiver.read_inbound_messages(None).expect("read");
            received.append(&mut msgs);
            // Let the receiver's acks flow back.
            let _ = receiver.push_outbound();
            let _ = sender.fetch_inbound();
            thread::sleep(Duration::from_millis(25));
            if !received.is_empty() && !sender.arq.has_pending() {
                break;
            }
        }

        assert_eq!(received, vec![message]);

        // Nothing further to deliver.
        let (msgs, _) = receiver.read_inbound_messages(None).expect("read");
        assert!(msgs.is_empty());
    }

    #[test]
    fn suppressed_acks_time_out_but_deliver_once() {
        let (mut sender, mut receiver) = pair();
        let message = stream_frame(1);
        sender.write_outbound_message(&message).expect("write");

        let mut received = Vec::new();
        let mut saw_timeout = None;
        for _ in 0..40 {
            match sender.push_outbound() {
                Ok(()) => {}
                Err(e) => {
                    saw_timeout = Some(e);
                    break;
                }
            }
            // The receiver reads (so it sees the data) but never
            // pushes, so its acks never make it onto the wire.
            let (mut msgs, _) = receiver.read_inbound_messages(None).expect("read");
            received.append(&mut msgs);
            thread::sleep(Duration::from_millis(25));
        }

        assert_matches!(saw_timeout, Some(TransportError::PeerTimeout(_)));
        assert_eq!(received, vec![message]);
    }

    #[test]
    fn oversize_payload_is_rejected_at_enqueue() {
        let (mut sender, _receiver) = pair();
        let mut config_small = test_config();
        config_small.frame_max_bytes = 8;
        sender.config = config_small;

        let err = sender
            .write_outbound_message(&stream_frame(1))
            .expect_err("oversize payload");
        assert!(matches!(err, TransportError::EncodeOversize { .. }));
    }

    #[test]
    fn garbage_on_the_wire_resynchronizes() {
        let (mut sender, mut receiver) = pair();

        // Inject noise directly, then a real frame.
        sender
            .file
            .as_mut()
            .expect("open file")
            .write_all(b"%%%% line noise USB half-magic US")
            .expect("noise write");

        let message = stream_frame(1);
        sender.write_outbound_message(&message).expect("write");

        let mut received = Vec::new();
        for _ in 0..12 {
            let _ = sender.push_outbound();
            let (mut msgs, _) = receiver.read_inbound_messages(None).expect("read");
            received.append(&mut msgs);
            let _ = receiver.push_outbound();
            let _ = sender.fetch_inbound();
            if !received.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        assert_eq!(received, vec![message]);
    }
}
