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

//! The pluggable transport layer.
//!
//! Every side-channel medium gets wrapped in a [`TransportBackend`]
//! that turns it into a reliable, ordered, deduplicated message pipe.
//! The session layer is written purely against the trait; it never
//! sees a clipboard, a git repo, or a sound card.

use std::{
    env,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use sidessh_protocol::Message;
use thiserror::Error;
use uuid::Uuid;

pub mod audio_modem;
pub mod clipboard;
pub mod drive;
pub mod git;
pub mod link;
pub mod serial;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The medium is missing outright: no clipboard tool, no git
    /// binary, no serial device, no audio path.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The encoded message does not fit in a single frame.
    #[error("encoded message is {size} bytes, above the frame cap of {max}")]
    EncodeOversize { size: usize, max: usize },

    /// Retransmissions or a handshake deadline ran out without the
    /// peer responding.
    #[error("peer timed out: {0}")]
    PeerTimeout(String),

    /// Frame integrity checks kept failing for the same data.
    #[error("frame integrity failure: {0}")]
    IntegrityFailure(String),

    /// The backend was already closed.
    #[error("transport is closed")]
    Closed,

    /// A non-retriable medium failure (I/O error, subprocess death,
    /// rejected API call). Retriable conditions are absorbed inside
    /// the backend and never surface here.
    #[error("transport failure: {0}")]
    Medium(String),
}

/// The capability every transport provides.
///
/// `fetch_inbound`/`push_outbound` advance the backend's view of the
/// medium and are what the background sync worker drives;
/// `read_inbound_messages` hands decoded messages to the session layer
/// exactly once per message, advancing an opaque cursor.
pub trait TransportBackend: Send {
    /// Human readable identifier for diagnostics.
    fn name(&self) -> String;

    /// An opaque marker for the current inbound position, used by
    /// clients to skip over history present before connect.
    fn snapshot_inbound_cursor(&mut self) -> Option<String>;

    /// Return every message observed since `cursor` along with the new
    /// cursor. Never blocks beyond a bounded poll slice and never
    /// re-returns a message it already handed out.
    fn read_inbound_messages(
        &mut self,
        cursor: Option<&str>,
    ) -> Result<(Vec<Message>, Option<String>), TransportError>;

    /// Advance the local view of the medium (git fetch, drive
    /// download, serial read, PCM drain).
    fn fetch_inbound(&mut self) -> Result<(), TransportError>;

    /// Enqueue a message for delivery, returning its msg_id.
    fn write_outbound_message(&mut self, message: &Message) -> Result<Uuid, TransportError>;

    /// Attempt to flush enqueued frames to the medium.
    fn push_outbound(&mut self) -> Result<(), TransportError>;

    /// Release all resources. Idempotent.
    fn close(&mut self);
}

/// A transport shared between the session thread and its sync worker.
/// The mutex is the single lock that serializes all access to the
/// backend's queues and reliability state.
pub type SharedTransport = Arc<Mutex<Box<dyn TransportBackend>>>;

pub fn shared(backend: Box<dyn TransportBackend>) -> SharedTransport {
    Arc::new(Mutex::new(backend))
}

/// Resolve a binary on $PATH, the way `which` would.
pub(crate) fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path).map(|dir| dir.join(bin)).find(|p| p.is_file())
}

/// In-memory message-pipe transport used by session-layer tests. Not
/// compiled into release builds.
#[cfg(test)]
pub mod testing {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use sidessh_protocol::Message;
    use uuid::Uuid;

    use super::{TransportBackend, TransportError};

    type MessageQueue = Arc<Mutex<VecDeque<Message>>>;

    /// One end of an in-memory bidirectional message pipe.
    pub struct PipeTransport {
        rx: MessageQueue,
        tx: MessageQueue,
        written: Arc<Mutex<Vec<Message>>>,
        cursor: u64,
        closed: bool,
    }

    impl PipeTransport {
        /// Handle onto everything this end has ever written, usable
        /// after the transport has been boxed away.
        pub fn written_log(&self) -> Arc<Mutex<Vec<Message>>> {
            self.written.clone()
        }
    }

    /// A connected transport pair: what one end writes, the other
    /// reads.
    pub fn message_pipe() -> (PipeTransport, PipeTransport) {
        let a_to_b: MessageQueue = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a: MessageQueue = Arc::new(Mutex::new(VecDeque::new()));
        (
            PipeTransport {
                rx: b_to_a.clone(),
                tx: a_to_b.clone(),
                written: Arc::new(Mutex::new(Vec::new())),
                cursor: 0,
                closed: false,
            },
            PipeTransport {
                rx: a_to_b,
                tx: b_to_a,
                written: Arc::new(Mutex::new(Vec::new())),
                cursor: 0,
                closed: false,
            },
        )
    }

    impl TransportBackend for PipeTransport {
        fn name(&self) -> String {
            String::from("test-pipe")
        }

        fn snapshot_inbound_cursor(&mut self) -> Option<String> {
            Some(self.cursor.to_string())
        }

        fn read_inbound_messages(
            &mut self,
            _cursor: Option<&str>,
        ) -> Result<(Vec<Message>, Option<String>), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            let messages: Vec<Message> = self.rx.lock().unwrap().drain(..).collect();
            self.cursor += messages.len() as u64;
            Ok((messages, Some(self.cursor.to_string())))
        }

        fn fetch_inbound(&mut self) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            Ok(())
        }

        fn write_outbound_message(
            &mut self,
            message: &Message,
        ) -> Result<Uuid, TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.written.lock().unwrap().push(message.clone());
            self.tx.lock().unwrap().push_back(message.clone());
            Ok(message.msg_id)
        }

        fn push_outbound(&mut self) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }
}
