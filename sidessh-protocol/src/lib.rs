// Copyright 2024 Google LLC
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

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The wire protocol variant a transport speaks.
///
/// The clipboard transport uses a request/response protocol where whole
/// commands are shipped back and forth, while every other transport uses
/// a streaming protocol that bridges raw PTY bytes. The two variants
/// share the same envelope but accept different message kinds and use
/// different wire prefixes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// `clipssh/1`: request/response command execution over a single
    /// shared clipboard slot.
    ClipV1,
    /// `gitssh/2`: streaming PTY bridge over git, drive, serial and
    /// audio transports.
    StreamV2,
}

impl Protocol {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Protocol::ClipV1 => "clipssh/1",
            Protocol::StreamV2 => "gitssh/2",
        }
    }

    /// The literal prefix prepended to every encoded frame. Clipboard
    /// slots are shared with arbitrary copy/paste traffic, so frames
    /// carry a recognizable marker there. Framed transports deliver
    /// whole payloads and don't need one.
    pub fn wire_prefix(&self) -> &'static str {
        match self {
            Protocol::ClipV1 => "CLIPSSH/1 ",
            Protocol::StreamV2 => "",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Protocol> {
        match name {
            "clipssh/1" => Some(Protocol::ClipV1),
            "gitssh/2" => Some(Protocol::StreamV2),
            _ => None,
        }
    }

    /// Is this payload kind part of this protocol's valid set?
    pub fn allows(&self, payload: &Payload) -> bool {
        use Payload::*;
        match self {
            Protocol::ClipV1 => matches!(
                payload,
                ConnectReq(_)
                    | ConnectAck(_)
                    | Cmd(_)
                    | Stdout(_)
                    | Stderr(_)
                    | Exit(_)
                    | Heartbeat {}
                    | Disconnect {}
                    | Error(_)
                    | Busy(_)
            ),
            Protocol::StreamV2 => matches!(
                payload,
                ConnectReq(_)
                    | ConnectAck(_)
                    | PtyInput(_)
                    | PtyOutput(_)
                    | PtyResize(_)
                    | PtySignal(_)
                    | PtyClosed(_)
                    | Disconnect {}
                    | Error(_)
                    | Busy(_)
                    | DiagPing(_)
            ),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// One side of a session. Messages carry both a source and a target so
/// that a reader sharing a bidirectional medium with its peer can drop
/// its own reflections.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Client,
    Server,
}

impl Endpoint {
    pub fn peer(&self) -> Endpoint {
        match self {
            Endpoint::Client => Endpoint::Server,
            Endpoint::Server => Endpoint::Client,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Client => write!(f, "client"),
            Endpoint::Server => write!(f, "server"),
        }
    }
}

/// The size of a tty, sent along with connect requests and resizes so
/// the remote pty can be kept in sync (important so curses applications
/// look right).
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

/// Context the server shares so the client can render an ssh-style
/// prompt line.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PromptContext {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectReq {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pty: Option<PtySize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    #[serde(default)]
    pub shell: Option<String>,
    pub backend: String,
    /// Identifies the pty byte stream. Absent in the request/response
    /// variant, which has no stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<Uuid>,
    pub prompt: PromptContext,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CmdReq {
    pub command: String,
    pub cmd_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CmdData {
    pub cmd_id: String,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CmdExit {
    pub cmd_id: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptContext>,
}

/// Raw bytes crossing the pty bridge, base64 encoded (standard
/// alphabet) since the envelope is JSON text.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PtyData {
    pub stream_id: Uuid,
    pub data_b64: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PtyResize {
    pub stream_id: Uuid,
    pub cols: u16,
    pub rows: u16,
}

/// The signals a client may ask the server to deliver to the shell's
/// foreground process group.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalName {
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "TERM")]
    Term,
    #[serde(rename = "HUP")]
    Hup,
    #[serde(rename = "QUIT")]
    Quit,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PtySignal {
    pub stream_id: Uuid,
    pub signal: SignalName,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PtyClosed {
    pub stream_id: Uuid,
    pub exit_code: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BusyBody {
    pub reason: String,
}

/// Periodic server heartbeat used to debug transports where the
/// handshake itself is flaky. Clients count these but otherwise
/// ignore them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiagPing {
    pub phase: String,
    pub diag_counter: u64,
    pub active_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<Uuid>,
}

/// A message kind together with its kind-specific body.
///
/// Tagging the enum on the wire `kind` field with the body as the
/// sibling `body` field means decoding validates body shapes up front;
/// handlers never need to re-check field types.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    ConnectReq(ConnectReq),
    ConnectAck(ConnectAck),
    Cmd(CmdReq),
    Stdout(CmdData),
    Stderr(CmdData),
    Exit(CmdExit),
    Heartbeat {},
    PtyInput(PtyData),
    PtyOutput(PtyData),
    PtyResize(PtyResize),
    PtySignal(PtySignal),
    PtyClosed(PtyClosed),
    Disconnect {},
    Error(ErrorBody),
    Busy(BusyBody),
    DiagPing(DiagPing),
}

impl Payload {
    /// The wire name of this kind, mostly for logs and git commit
    /// subjects.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::ConnectReq(_) => "connect_req",
            Payload::ConnectAck(_) => "connect_ack",
            Payload::Cmd(_) => "cmd",
            Payload::Stdout(_) => "stdout",
            Payload::Stderr(_) => "stderr",
            Payload::Exit(_) => "exit",
            Payload::Heartbeat {} => "heartbeat",
            Payload::PtyInput(_) => "pty_input",
            Payload::PtyOutput(_) => "pty_output",
            Payload::PtyResize(_) => "pty_resize",
            Payload::PtySignal(_) => "pty_signal",
            Payload::PtyClosed(_) => "pty_closed",
            Payload::Disconnect {} => "disconnect",
            Payload::Error(_) => "error",
            Payload::Busy(_) => "busy",
            Payload::DiagPing(_) => "diag_ping",
        }
    }
}

/// One framed protocol message.
///
/// Everything on the wire is a JSON object with exactly the fields
/// below (`kind` and `body` come from the flattened [`Payload`]).
/// `msg_id` is globally unique and drives deduplication; `seq` is
/// strictly increasing within a single endpoint's outgoing stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub protocol: String,
    #[serde(flatten)]
    pub payload: Payload,
    pub session_id: Uuid,
    pub msg_id: Uuid,
    pub ts: String,
    pub source: Endpoint,
    pub target: Endpoint,
    pub seq: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidMessage {
    #[error("message kind {kind} is not part of protocol {protocol}")]
    KindNotAllowed { kind: &'static str, protocol: &'static str },
    #[error("seq must be >= 1")]
    ZeroSeq,
}

/// A UTC ISO-8601 timestamp with a `Z` suffix. Informational only;
/// nothing orders on it.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Construct a validated message, stamping a fresh `msg_id` and `ts`.
pub fn build_message(
    protocol: Protocol,
    payload: Payload,
    session_id: Uuid,
    source: Endpoint,
    target: Endpoint,
    seq: u64,
) -> Result<Message, InvalidMessage> {
    build_message_full(protocol, payload, session_id, source, target, seq, None, None)
}

/// [`build_message`] with explicit `msg_id`/`ts` overrides, used when
/// replaying a frame must preserve its identity.
#[allow(clippy::too_many_arguments)]
pub fn build_message_full(
    protocol: Protocol,
    payload: Payload,
    session_id: Uuid,
    source: Endpoint,
    target: Endpoint,
    seq: u64,
    msg_id: Option<Uuid>,
    ts: Option<String>,
) -> Result<Message, InvalidMessage> {
    if !protocol.allows(&payload) {
        return Err(InvalidMessage::KindNotAllowed {
            kind: payload.kind(),
            protocol: protocol.wire_name(),
        });
    }
    if seq < 1 {
        return Err(InvalidMessage::ZeroSeq);
    }

    Ok(Message {
        protocol: String::from(protocol.wire_name()),
        payload,
        session_id,
        msg_id: msg_id.unwrap_or_else(Uuid::new_v4),
        ts: ts.unwrap_or_else(utc_timestamp),
        source,
        target,
        seq,
    })
}

/// Serialize a message to its wire form: protocol prefix followed by
/// compact JSON.
pub fn encode_message(message: &Message) -> String {
    let prefix = Protocol::from_wire_name(&message.protocol)
        .map(|p| p.wire_prefix())
        .unwrap_or("");
    // Compact JSON of a struct of serializable fields cannot fail.
    let json = serde_json::to_string(message).unwrap_or_default();
    format!("{prefix}{json}")
}

/// Parse a wire frame for the given protocol.
///
/// Decoding is total: lossy media routinely hand readers unrelated or
/// mangled text, so anything that is not a well formed frame for this
/// protocol comes back as `None` rather than an error. That covers a
/// missing prefix, broken JSON, missing fields, unparseable UUIDs,
/// kinds outside the protocol's valid set, and `seq < 1`.
pub fn decode_message(text: &str, protocol: Protocol) -> Option<Message> {
    let prefix = protocol.wire_prefix();
    let raw = text.strip_prefix(prefix)?;
    if raw.is_empty() {
        return None;
    }

    let message: Message = serde_json::from_str(raw).ok()?;
    if message.protocol != protocol.wire_name() {
        return None;
    }
    if !protocol.allows(&message.payload) {
        return None;
    }
    if message.seq < 1 {
        return None;
    }

    Some(message)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_payloads() -> Vec<(Protocol, Payload)> {
        let stream_id = Uuid::new_v4();
        vec![
            (
                Protocol::StreamV2,
                Payload::ConnectReq(ConnectReq {
                    host: String::from("devbox"),
                    pty: Some(PtySize { cols: 120, rows: 40 }),
                }),
            ),
            (
                Protocol::StreamV2,
                Payload::ConnectAck(ConnectAck {
                    shell: Some(String::from("/bin/sh")),
                    backend: String::from("git:/tmp/mirror.git"),
                    stream_id: Some(stream_id),
                    prompt: PromptContext {
                        user: Some(String::from("user")),
                        cwd: None,
                        host: Some(String::from("devbox")),
                    },
                }),
            ),
            (
                Protocol::StreamV2,
                Payload::PtyInput(PtyData {
                    stream_id,
                    data_b64: String::from("bHMgLWwK"),
                }),
            ),
            (
                Protocol::StreamV2,
                Payload::PtyOutput(PtyData { stream_id, data_b64: String::from("aGkK") }),
            ),
            (
                Protocol::StreamV2,
                Payload::PtyResize(PtyResize { stream_id, cols: 81, rows: 25 }),
            ),
            (
                Protocol::StreamV2,
                Payload::PtySignal(PtySignal { stream_id, signal: SignalName::Int }),
            ),
            (
                Protocol::StreamV2,
                Payload::PtyClosed(PtyClosed { stream_id, exit_code: 3 }),
            ),
            (Protocol::StreamV2, Payload::Disconnect {}),
            (
                Protocol::StreamV2,
                Payload::Busy(BusyBody { reason: String::from("server has an active session") }),
            ),
            (
                Protocol::StreamV2,
                Payload::DiagPing(DiagPing {
                    phase: String::from("idle"),
                    diag_counter: 7,
                    active_session: false,
                    stream_id: None,
                }),
            ),
            (
                Protocol::ClipV1,
                Payload::Cmd(CmdReq {
                    command: String::from("echo hello"),
                    cmd_id: String::from("cmd-1"),
                }),
            ),
            (
                Protocol::ClipV1,
                Payload::Stdout(CmdData {
                    cmd_id: String::from("cmd-1"),
                    data: String::from("hello\n"),
                }),
            ),
            (
                Protocol::ClipV1,
                Payload::Exit(CmdExit {
                    cmd_id: String::from("cmd-1"),
                    exit_code: 0,
                    prompt: Some(PromptContext::default()),
                }),
            ),
            (Protocol::ClipV1, Payload::Heartbeat {}),
            (
                Protocol::ClipV1,
                Payload::Error(ErrorBody { error: String::from("boom") }),
            ),
        ]
    }

    #[test]
    fn round_trip_all_kinds() {
        for (protocol, payload) in sample_payloads() {
            let message = build_message(
                protocol,
                payload,
                Uuid::new_v4(),
                Endpoint::Client,
                Endpoint::Server,
                1,
            )
            .expect("build to succeed");

            let wire = encode_message(&message);
            assert!(wire.starts_with(protocol.wire_prefix()));

            let decoded = decode_message(&wire, protocol)
                .unwrap_or_else(|| panic!("decode failed for kind {}", message.payload.kind()));
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn decode_rejects_missing_prefix() {
        let message = build_message(
            Protocol::ClipV1,
            Payload::Heartbeat {},
            Uuid::new_v4(),
            Endpoint::Server,
            Endpoint::Client,
            1,
        )
        .expect("build to succeed");
        let wire = encode_message(&message);

        let bare_json = wire.strip_prefix("CLIPSSH/1 ").expect("prefix present");
        assert_eq!(decode_message(bare_json, Protocol::ClipV1), None);
    }

    #[test]
    fn decode_is_total_on_noise() {
        let cases = [
            "",
            "this is normal copy/paste data",
            "CLIPSSH/1 ",
            "CLIPSSH/1 not json",
            "CLIPSSH/1 {}",
            "CLIPSSH/1 {\"protocol\":\"clipssh/1\"}",
            "{\"kind\":\"pty_input\"}",
            "{malformed",
            "\u{0}\u{1}\u{2}",
        ];
        for case in cases {
            assert_eq!(decode_message(case, Protocol::ClipV1), None, "case: {case:?}");
            assert_eq!(decode_message(case, Protocol::StreamV2), None, "case: {case:?}");
        }
    }

    #[test]
    fn decode_rejects_cross_protocol_kinds() {
        let message = build_message(
            Protocol::ClipV1,
            Payload::Cmd(CmdReq { command: String::from("ls"), cmd_id: String::from("c") }),
            Uuid::new_v4(),
            Endpoint::Client,
            Endpoint::Server,
            1,
        )
        .expect("build to succeed");

        // Force the frame to claim the streaming protocol. The kind is
        // not in gitssh/2's valid set, so decode must drop it.
        let mut forged = message;
        forged.protocol = String::from(Protocol::StreamV2.wire_name());
        let wire = encode_message(&forged);
        assert_eq!(decode_message(&wire, Protocol::StreamV2), None);
    }

    #[test]
    fn decode_rejects_bad_uuid_and_seq() {
        let good = encode_message(
            &build_message(
                Protocol::StreamV2,
                Payload::Disconnect {},
                Uuid::new_v4(),
                Endpoint::Client,
                Endpoint::Server,
                4,
            )
            .expect("build to succeed"),
        );

        let parsed: serde_json::Value = serde_json::from_str(&good).expect("valid json");

        let mut bad_uuid = parsed.clone();
        bad_uuid["session_id"] = serde_json::Value::String(String::from("not-a-uuid"));
        assert_eq!(decode_message(&bad_uuid.to_string(), Protocol::StreamV2), None);

        let mut zero_seq = parsed;
        zero_seq["seq"] = serde_json::Value::from(0);
        assert_eq!(decode_message(&zero_seq.to_string(), Protocol::StreamV2), None);
    }

    #[test]
    fn build_rejects_cross_protocol_kinds() {
        let err = build_message(
            Protocol::StreamV2,
            Payload::Cmd(CmdReq { command: String::from("ls"), cmd_id: String::from("c") }),
            Uuid::new_v4(),
            Endpoint::Client,
            Endpoint::Server,
            1,
        )
        .expect_err("cmd is not a streaming kind");
        assert_eq!(
            err,
            InvalidMessage::KindNotAllowed { kind: "cmd", protocol: "gitssh/2" }
        );

        let err = build_message(
            Protocol::ClipV1,
            Payload::Heartbeat {},
            Uuid::new_v4(),
            Endpoint::Client,
            Endpoint::Server,
            0,
        )
        .expect_err("zero seq");
        assert_eq!(err, InvalidMessage::ZeroSeq);
    }

    #[test]
    fn signal_names_use_wire_spelling() {
        let json = serde_json::to_string(&SignalName::Int).expect("serialize");
        assert_eq!(json, "\"INT\"");
        let back: SignalName = serde_json::from_str("\"QUIT\"").expect("deserialize");
        assert_eq!(back, SignalName::Quit);
    }
}
