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

//! Clipboard poll-sync transport.
//!
//! The medium is a single shared text slot that both peers overwrite.
//! Reads poll the slot and decode whatever is there; anything that is
//! not a protocol frame (ordinary copy/paste traffic) is ignored.
//! Because a write can race the peer's poll, senders keep
//! retransmitting request frames until they observe a response, and
//! readers rely on msg_id deduplication instead of a cursor.

use std::{
    collections::VecDeque,
    io::Write as _,
    process,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use sidessh_protocol::{decode_message, encode_message, Message, Protocol};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{find_in_path, TransportBackend, TransportError};

const SLOT_CMD_TIMEOUT: Duration = Duration::from_secs(2);
const SLOT_CMD_POLL: Duration = Duration::from_millis(5);

/// A readable/writable shared text slot. The real implementations
/// shell out to the platform clipboard tools; tests use the in-memory
/// variant.
pub trait ClipboardSlot: Send {
    fn name(&self) -> String;
    fn read_text(&mut self) -> Result<String, TransportError>;
    fn write_text(&mut self, text: &str) -> Result<(), TransportError>;
}

/// Clipboard slot driven by external commands (wl-paste/wl-copy,
/// xclip, xsel).
pub struct CommandClipboard {
    backend_name: String,
    read_cmd: Vec<String>,
    write_cmd: Vec<String>,
}

impl CommandClipboard {
    fn run(cmd: &[String], input: Option<&str>) -> Result<String, TransportError> {
        let mut child = process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdin(if input.is_some() {
                process::Stdio::piped()
            } else {
                process::Stdio::null()
            })
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Unavailable(format!("spawning {}: {e}", cmd[0])))?;

        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(text.as_bytes())
                    .map_err(|e| TransportError::Medium(format!("writing {} stdin: {e}", cmd[0])))?;
            }
        }

        // Clipboard tools occasionally wedge when the display server
        // is unhappy, so bound how long we will wait on them.
        let deadline = Instant::now() + SLOT_CMD_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let output = child
                        .wait_with_output()
                        .map_err(|e| TransportError::Medium(format!("collecting {}: {e}", cmd[0])))?;
                    if !status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        return Err(TransportError::Medium(format!(
                            "{} exited with {status}: {}",
                            cmd[0],
                            stderr.trim()
                        )));
                    }
                    return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(TransportError::Medium(format!("{} timed out", cmd[0])));
                    }
                    thread::sleep(SLOT_CMD_POLL);
                }
                Err(e) => {
                    return Err(TransportError::Medium(format!("waiting on {}: {e}", cmd[0])))
                }
            }
        }
    }
}

impl ClipboardSlot for CommandClipboard {
    fn name(&self) -> String {
        self.backend_name.clone()
    }

    fn read_text(&mut self) -> Result<String, TransportError> {
        Self::run(&self.read_cmd, None)
    }

    fn write_text(&mut self, text: &str) -> Result<(), TransportError> {
        Self::run(&self.write_cmd, Some(text)).map(|_| ())
    }
}

/// In-memory slot shared by cloning; peers (and noise writers) in
/// tests all hold clones of the same slot.
#[derive(Clone, Default)]
pub struct MemoryClipboard {
    slot: Arc<Mutex<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        MemoryClipboard::default()
    }
}

impl ClipboardSlot for MemoryClipboard {
    fn name(&self) -> String {
        String::from("memory")
    }

    fn read_text(&mut self) -> Result<String, TransportError> {
        Ok(self.slot.lock().unwrap().clone())
    }

    fn write_text(&mut self, text: &str) -> Result<(), TransportError> {
        *self.slot.lock().unwrap() = String::from(text);
        Ok(())
    }
}

/// Pick the first clipboard tool pair available on this system.
pub fn detect_slot() -> Result<Box<dyn ClipboardSlot>, TransportError> {
    if find_in_path("wl-copy").is_some() && find_in_path("wl-paste").is_some() {
        return Ok(Box::new(CommandClipboard {
            backend_name: String::from("wayland-wl-clipboard"),
            read_cmd: vec![String::from("wl-paste"), String::from("--no-newline")],
            write_cmd: vec![String::from("wl-copy")],
        }));
    }

    if find_in_path("xclip").is_some() {
        return Ok(Box::new(CommandClipboard {
            backend_name: String::from("xclip"),
            read_cmd: ["xclip", "-selection", "clipboard", "-o"]
                .iter()
                .map(|s| String::from(*s))
                .collect(),
            write_cmd: ["xclip", "-selection", "clipboard"]
                .iter()
                .map(|s| String::from(*s))
                .collect(),
        }));
    }

    if find_in_path("xsel").is_some() {
        return Ok(Box::new(CommandClipboard {
            backend_name: String::from("xsel"),
            read_cmd: ["xsel", "--clipboard", "--output"]
                .iter()
                .map(|s| String::from(*s))
                .collect(),
            write_cmd: ["xsel", "--clipboard", "--input"]
                .iter()
                .map(|s| String::from(*s))
                .collect(),
        }));
    }

    Err(TransportError::Unavailable(String::from(
        "no clipboard tools found, install wl-clipboard, xclip, or xsel",
    )))
}

pub struct ClipboardTransportConfig {
    /// Minimum spacing between slot overwrites so the peer's poll loop
    /// has a chance to observe each frame.
    pub write_gap: Duration,
}

impl Default for ClipboardTransportConfig {
    fn default() -> Self {
        ClipboardTransportConfig { write_gap: Duration::from_millis(200) }
    }
}

/// [`TransportBackend`] over a [`ClipboardSlot`], speaking the
/// `clipssh/1` request/response protocol.
pub struct ClipboardTransportBackend {
    slot: Box<dyn ClipboardSlot>,
    config: ClipboardTransportConfig,
    outbound: VecDeque<String>,
    last_write_at: Option<Instant>,
    /// The last slot contents we decoded, so an unchanged slot is not
    /// handed to the session layer over and over.
    last_read_text: String,
    closed: bool,
}

impl ClipboardTransportBackend {
    pub fn new(slot: Box<dyn ClipboardSlot>, config: ClipboardTransportConfig) -> Self {
        ClipboardTransportBackend {
            slot,
            config,
            outbound: VecDeque::new(),
            last_write_at: None,
            last_read_text: String::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn write_due(&self) -> bool {
        match self.last_write_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.write_gap,
        }
    }
}

impl TransportBackend for ClipboardTransportBackend {
    fn name(&self) -> String {
        format!("clipboard:{}", self.slot.name())
    }

    fn snapshot_inbound_cursor(&mut self) -> Option<String> {
        // A clipboard has no history to skip; readers dedup on msg_id.
        None
    }

    fn read_inbound_messages(
        &mut self,
        _cursor: Option<&str>,
    ) -> Result<(Vec<Message>, Option<String>), TransportError> {
        self.ensure_open()?;

        let text = self.slot.read_text()?;
        if text == self.last_read_text {
            return Ok((Vec::new(), None));
        }
        self.last_read_text = text.clone();

        match decode_message(&text, Protocol::ClipV1) {
            Some(message) => Ok((vec![message], None)),
            None => {
                // Ordinary copy/paste traffic, not ours.
                debug!("ignoring non-protocol slot contents ({} bytes)", text.len());
                Ok((Vec::new(), None))
            }
        }
    }

    fn fetch_inbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()
    }

    fn write_outbound_message(&mut self, message: &Message) -> Result<Uuid, TransportError> {
        self.ensure_open()?;
        self.outbound.push_back(encode_message(message));
        Ok(message.msg_id)
    }

    fn push_outbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;

        if !self.write_due() {
            return Ok(());
        }
        let payload = match self.outbound.pop_front() {
            Some(p) => p,
            None => return Ok(()),
        };

        if let Err(e) = self.slot.write_text(&payload) {
            // Overwriting a clipboard is cheap, so keep the frame and
            // retry on the next tick rather than failing the session.
            warn!("clipboard write failed, will retry: {e}");
            self.outbound.push_front(payload);
            return Err(e);
        }
        // Our own write is now the slot contents. Remember it so the
        // reader does not hand our frame back to us.
        self.last_read_text = payload;
        self.last_write_at = Some(Instant::now());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            info!("closing clipboard transport");
            self.closed = true;
        }
    }
}
