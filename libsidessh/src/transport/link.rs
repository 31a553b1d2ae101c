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

//! Stop-and-wait ARQ framing shared by the serial and audio-modem
//! transports.
//!
//! Frame layout (big endian):
//!
//! ```text
//! magic(4) | version(u8) | type(u8) | seq(u32) | payload_len(u32) | payload_crc(u32)
//! ```
//!
//! followed by `payload_len` payload bytes. DATA frames carry a CRC32
//! over the payload; ACK frames carry an empty payload and a zero crc.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use super::TransportError;

pub const LINK_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 18;

pub const TYPE_DATA: u8 = 1;
pub const TYPE_ACK: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: u8,
    pub seq: u32,
    pub payload_len: u32,
    pub payload_crc: u32,
}

/// Serialize a link frame. DATA frames get a payload CRC, ACK frames
/// carry zero.
pub fn build_frame(magic: &[u8; 4], frame_type: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
    let payload_crc = if frame_type == TYPE_DATA { crc32fast::hash(payload) } else { 0 };

    let mut frame = vec![0u8; HEADER_LEN + payload.len()];
    frame[..4].copy_from_slice(magic);
    frame[4] = LINK_VERSION;
    frame[5] = frame_type;
    BigEndian::write_u32(&mut frame[6..10], seq);
    BigEndian::write_u32(&mut frame[10..14], payload.len() as u32);
    BigEndian::write_u32(&mut frame[14..18], payload_crc);
    frame[HEADER_LEN..].copy_from_slice(payload);
    frame
}

/// Parse a header, returning `None` unless the magic and version both
/// match. Callers that scan byte streams use this to resynchronize.
pub fn parse_header(magic: &[u8; 4], buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < HEADER_LEN || &buf[..4] != magic || buf[4] != LINK_VERSION {
        return None;
    }

    Some(FrameHeader {
        frame_type: buf[5],
        seq: BigEndian::read_u32(&buf[6..10]),
        payload_len: BigEndian::read_u32(&buf[10..14]),
        payload_crc: BigEndian::read_u32(&buf[14..18]),
    })
}

/// Bounded FIFO set of recently received sequence numbers, used to
/// drop retransmitted DATA frames whose ACK got lost.
#[derive(Debug)]
pub struct SeenSeqWindow {
    capacity: usize,
    seen: HashSet<u32>,
    order: VecDeque<u32>,
}

impl SeenSeqWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SeenSeqWindow { capacity, seen: HashSet::new(), order: VecDeque::new() }
    }

    /// Record a seq, returning true if it was already present.
    pub fn check_and_insert(&mut self, seq: u32) -> bool {
        if self.seen.contains(&seq) {
            return true;
        }

        self.seen.insert(seq);
        self.order.push_back(seq);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        false
    }
}

#[derive(Debug)]
struct PendingFrame {
    frame: Vec<u8>,
    /// Currently sitting in the tx queue, so the scheduler must not
    /// queue it a second time.
    queued: bool,
    attempts: u32,
    next_retry_at: Option<Instant>,
}

/// One item waiting to be written to the medium. `seq` is `None` for
/// ACK frames, which are fire-and-forget. `offset` tracks partial
/// writes so a nonblocking writer can resume mid-frame.
#[derive(Debug)]
pub struct TxItem {
    pub seq: Option<u32>,
    pub frame: Vec<u8>,
    pub offset: usize,
}

/// The reliability state machine: pending DATA frames keyed by seq,
/// the ACK priority queue, the transmit queue, and the inbound dedup
/// window. Owners hold their transport lock while touching this.
#[derive(Debug)]
pub struct ArqState {
    magic: [u8; 4],
    ack_timeout: Duration,
    max_retries: u32,
    next_out_seq: u32,
    pending: BTreeMap<u32, PendingFrame>,
    ack_frames: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<TxItem>,
    seen_inbound: SeenSeqWindow,
}

/// What [`ArqState::handle_frame`] decided about an inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A fresh DATA frame; deliver its payload.
    Delivered(Vec<u8>),
    /// An ACK, a duplicate, or a frame that failed its checks.
    Consumed,
}

impl ArqState {
    pub fn new(
        magic: [u8; 4],
        ack_timeout: Duration,
        max_retries: u32,
        seen_seq_window: usize,
    ) -> Self {
        ArqState {
            magic,
            ack_timeout: ack_timeout.max(Duration::from_millis(10)),
            max_retries: max_retries.max(1),
            next_out_seq: 1,
            pending: BTreeMap::new(),
            ack_frames: VecDeque::new(),
            tx_queue: VecDeque::new(),
            seen_inbound: SeenSeqWindow::new(seen_seq_window),
        }
    }

    pub fn magic(&self) -> &[u8; 4] {
        &self.magic
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.ack_frames.is_empty() || !self.tx_queue.is_empty()
    }

    /// Register an outbound DATA payload, assigning it the next seq.
    /// The frame stays pending until an ACK for its seq arrives.
    pub fn enqueue_data(&mut self, payload: &[u8]) -> u32 {
        let seq = self.next_out_seq;
        self.next_out_seq = self.next_out_seq.wrapping_add(1);
        let frame = build_frame(&self.magic, TYPE_DATA, seq, payload);
        self.pending.insert(
            seq,
            PendingFrame { frame, queued: false, attempts: 0, next_retry_at: None },
        );
        seq
    }

    /// Move due frames into the transmit queue: queued ACKs first,
    /// then every pending DATA frame whose retry deadline has passed.
    /// A frame that has burned through `max_retries` retransmissions
    /// fails the transport with `PeerTimeout`.
    pub fn schedule_due_frames(&mut self, now: Instant) -> Result<(), TransportError> {
        while let Some(frame) = self.ack_frames.pop_front() {
            self.tx_queue.push_back(TxItem { seq: None, frame, offset: 0 });
        }

        let seqs: Vec<u32> = self.pending.keys().copied().collect();
        for seq in seqs {
            let pending = match self.pending.get_mut(&seq) {
                Some(p) => p,
                None => continue,
            };
            if pending.queued {
                continue;
            }
            match pending.next_retry_at {
                Some(at) if now < at => continue,
                Some(_) => {
                    // Not the first send, so this is a retransmission.
                    pending.attempts += 1;
                    if pending.attempts > self.max_retries {
                        let attempts = pending.attempts;
                        self.pending.remove(&seq);
                        return Err(TransportError::PeerTimeout(format!(
                            "frame seq={seq} was not acknowledged after {attempts} retransmissions"
                        )));
                    }
                }
                None => {}
            }

            pending.queued = true;
            pending.next_retry_at = Some(now + self.ack_timeout);
            let frame = pending.frame.clone();
            self.tx_queue.push_back(TxItem { seq: Some(seq), frame, offset: 0 });
        }

        Ok(())
    }

    pub fn pop_tx(&mut self) -> Option<TxItem> {
        self.tx_queue.pop_front()
    }

    /// Put a partially written item back at the head of the queue.
    pub fn requeue_tx_front(&mut self, item: TxItem) {
        self.tx_queue.push_front(item);
    }

    /// A tx item made it onto the wire in full; pending DATA frames
    /// become eligible for retransmission scheduling again.
    pub fn mark_tx_complete(&mut self, item: &TxItem) {
        if let Some(seq) = item.seq {
            if let Some(pending) = self.pending.get_mut(&seq) {
                pending.queued = false;
            }
        }
    }

    /// A tx item failed to write; allow DATA retransmission later
    /// instead of leaving the frame stuck in the queued state.
    pub fn mark_tx_failed(&mut self, item: &TxItem) {
        if let Some(seq) = item.seq {
            if let Some(pending) = self.pending.get_mut(&seq) {
                pending.queued = false;
            }
        }
    }

    /// Run one parsed inbound frame through the state machine:
    /// ACKs retire their pending DATA frame; DATA frames are CRC
    /// checked, acknowledged, and delivered once.
    pub fn handle_frame(&mut self, header: FrameHeader, payload: &[u8]) -> Inbound {
        if header.frame_type == TYPE_ACK {
            trace!("ack for seq={}", header.seq);
            self.pending.remove(&header.seq);
            return Inbound::Consumed;
        }

        if header.frame_type != TYPE_DATA {
            return Inbound::Consumed;
        }

        if crc32fast::hash(payload) != header.payload_crc {
            trace!("dropping seq={} with bad payload crc", header.seq);
            return Inbound::Consumed;
        }

        // Duplicates still get acked, otherwise a lost ACK would make
        // the sender retransmit forever.
        self.ack_frames.push_back(build_frame(&self.magic, TYPE_ACK, header.seq, &[]));

        if self.seen_inbound.check_and_insert(header.seq) {
            trace!("dropping duplicate seq={}", header.seq);
            return Inbound::Consumed;
        }

        Inbound::Delivered(payload.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MAGIC: [u8; 4] = *b"TEST";

    fn arq() -> ArqState {
        ArqState::new(MAGIC, Duration::from_millis(20), 3, 16)
    }

    #[test]
    fn frame_header_round_trip() {
        let frame = build_frame(&MAGIC, TYPE_DATA, 42, b"hello");
        let header = parse_header(&MAGIC, &frame).expect("header parses");
        assert_eq!(header.frame_type, TYPE_DATA);
        assert_eq!(header.seq, 42);
        assert_eq!(header.payload_len, 5);
        assert_eq!(header.payload_crc, crc32fast::hash(b"hello"));
        assert_eq!(&frame[HEADER_LEN..], b"hello");
    }

    #[test]
    fn parse_rejects_wrong_magic_and_version() {
        let mut frame = build_frame(&MAGIC, TYPE_ACK, 1, &[]);
        assert!(parse_header(b"NOPE", &frame).is_none());
        frame[4] = 9;
        assert!(parse_header(&MAGIC, &frame).is_none());
    }

    #[test]
    fn data_is_delivered_once_and_acked_each_time() {
        let mut state = arq();
        let frame = build_frame(&MAGIC, TYPE_DATA, 7, b"payload");
        let header = parse_header(&MAGIC, &frame).expect("header parses");

        assert_eq!(
            state.handle_frame(header, b"payload"),
            Inbound::Delivered(b"payload".to_vec())
        );
        // A retransmission is acked again but not delivered again.
        assert_eq!(state.handle_frame(header, b"payload"), Inbound::Consumed);
        assert_eq!(state.ack_frames.len(), 2);
    }

    #[test]
    fn corrupt_payload_is_dropped_without_ack() {
        let mut state = arq();
        let frame = build_frame(&MAGIC, TYPE_DATA, 7, b"payload");
        let header = parse_header(&MAGIC, &frame).expect("header parses");

        assert_eq!(state.handle_frame(header, b"payloaX"), Inbound::Consumed);
        assert!(state.ack_frames.is_empty());
    }

    #[test]
    fn ack_retires_pending_frame() {
        let mut state = arq();
        let seq = state.enqueue_data(b"data");
        assert!(state.has_pending());

        let ack = build_frame(&MAGIC, TYPE_ACK, seq, &[]);
        let header = parse_header(&MAGIC, &ack).expect("header parses");
        assert_eq!(state.handle_frame(header, &[]), Inbound::Consumed);
        assert!(!state.has_pending());
    }

    #[test]
    fn unacked_frame_times_out_after_max_retries() {
        let mut state = arq();
        state.enqueue_data(b"data");

        let mut now = Instant::now();
        // First send plus max_retries retransmissions succeed.
        for _ in 0..4 {
            state.schedule_due_frames(now).expect("still retrying");
            while let Some(item) = state.pop_tx() {
                state.mark_tx_complete(&item);
            }
            now += Duration::from_millis(500);
        }

        let err = state.schedule_due_frames(now).expect_err("retries exhausted");
        assert!(matches!(err, TransportError::PeerTimeout(_)));
    }

    #[test]
    fn acks_have_priority_over_data() {
        let mut state = arq();
        state.enqueue_data(b"data");
        let data = build_frame(&MAGIC, TYPE_DATA, 9, b"incoming");
        let header = parse_header(&MAGIC, &data).expect("header parses");
        state.handle_frame(header, b"incoming");

        state.schedule_due_frames(Instant::now()).expect("schedules");
        let first = state.pop_tx().expect("ack first");
        assert_eq!(first.seq, None);
        let second = state.pop_tx().expect("data second");
        assert_eq!(second.seq, Some(1));
    }

    #[test]
    fn seen_window_evicts_fifo() {
        let mut window = SeenSeqWindow::new(2);
        assert!(!window.check_and_insert(1));
        assert!(!window.check_and_insert(2));
        assert!(window.check_and_insert(1));
        assert!(!window.check_and_insert(3));
        // 1 was evicted by inserting 3.
        assert!(!window.check_and_insert(1));
    }
}
