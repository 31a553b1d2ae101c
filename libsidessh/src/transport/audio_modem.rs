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

//! Audio-modem transport: `AUDM` link frames modulated to PCM.
//!
//! The same stop-and-wait ARQ as the serial transport, but every link
//! frame passes through the audio codec on its way to a speaker and
//! back in from a microphone. Transmissions are paced by the frame's
//! own play-out duration so the sink never overruns.

use std::time::{Duration, Instant};

use sidessh_protocol::{decode_message, encode_message, Message, Protocol};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{
    link,
    link::{ArqState, Inbound},
    TransportBackend, TransportError,
};
use crate::audio::{
    create_codec,
    io::AudioDuplexIo,
    AudioFrameCodec, AudioModulation,
};

const MAGIC: [u8; 4] = *b"AUDM";
const PCM_READ_CHUNK: usize = 4096;
const MAX_READS_PER_TICK: usize = 32;
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AudioModemTransportConfig {
    pub sample_rate: u32,
    pub frame_max_bytes: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub seen_seq_window: usize,
    pub byte_repeat: usize,
    pub marker_run: usize,
    pub modulation: AudioModulation,
}

impl Default for AudioModemTransportConfig {
    fn default() -> Self {
        AudioModemTransportConfig {
            sample_rate: 48000,
            frame_max_bytes: 65536,
            ack_timeout: Duration::from_millis(200),
            max_retries: 32,
            seen_seq_window: 4096,
            byte_repeat: 3,
            marker_run: 16,
            modulation: AudioModulation::Auto,
        }
    }
}

pub struct AudioModemTransportBackend {
    config: AudioModemTransportConfig,
    label: String,
    io: Option<Box<dyn AudioDuplexIo>>,
    codec: AudioFrameCodec,
    arq: ArqState,
    incoming: Vec<Message>,
    inbound_cursor: u64,
    /// Earliest instant the next PCM write may start.
    next_tx_at: Instant,
    last_stats_log: Instant,
    closed: bool,
}

impl AudioModemTransportBackend {
    pub fn new(
        io: Box<dyn AudioDuplexIo>,
        input_device: &str,
        output_device: &str,
        config: AudioModemTransportConfig,
    ) -> Self {
        let modulation = config.modulation.effective();
        let codec = create_codec(modulation, config.byte_repeat, config.marker_run);
        let arq = ArqState::new(
            MAGIC,
            config.ack_timeout,
            config.max_retries,
            config.seen_seq_window,
        );
        let label = format!("audio-modem:{modulation}:in={input_device},out={output_device}");
        info!("audio modem transport ready ({label})");

        AudioModemTransportBackend {
            config,
            label,
            io: Some(io),
            codec,
            arq,
            incoming: Vec::new(),
            inbound_cursor: 0,
            next_tx_at: Instant::now(),
            last_stats_log: Instant::now(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed || self.io.is_none() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<(), TransportError> {
        // Bounded drain keeps the session loop responsive even when
        // audio arrives faster than we parse it.
        for _ in 0..MAX_READS_PER_TICK {
            let pcm = match self.io.as_mut() {
                Some(io) => io
                    .read(PCM_READ_CHUNK)
                    .map_err(|e| TransportError::Medium(format!("audio read failed: {e}")))?,
                None => return Ok(()),
            };
            if pcm.is_empty() {
                break;
            }

            let frames = self.codec.feed_pcm(&pcm);
            for raw in frames {
                self.handle_link_frame(&raw);
            }
        }

        self.maybe_log_codec_stats();
        Ok(())
    }

    fn handle_link_frame(&mut self, frame: &[u8]) {
        let header = match link::parse_header(&MAGIC, frame) {
            Some(h) => h,
            None => return,
        };
        if header.payload_len as usize > self.config.frame_max_bytes {
            return;
        }
        if frame.len() != link::HEADER_LEN + header.payload_len as usize {
            return;
        }
        let payload = &frame[link::HEADER_LEN..];

        if header.frame_type == link::TYPE_DATA
            && crc32fast::hash(payload) != header.payload_crc
        {
            // The codec has no checksum of its own; the link CRC is
            // the only integrity signal in the audio path.
            self.codec.note_crc_failure();
        }

        if let Inbound::Delivered(bytes) = self.arq.handle_frame(header, payload) {
            let text = String::from_utf8_lossy(&bytes);
            if let Some(message) = decode_message(&text, Protocol::StreamV2) {
                trace!("rx seq={} kind={}", header.seq, message.payload.kind());
                self.incoming.push(message);
            }
        }
    }

    fn write_due_frames(&mut self) -> Result<(), TransportError> {
        loop {
            let now = Instant::now();
            if now < self.next_tx_at {
                return Ok(());
            }

            let item = match self.arq.pop_tx() {
                Some(item) => item,
                None => return Ok(()),
            };

            let pcm = self.codec.encode_frame(&item.frame);
            let write_res = match self.io.as_mut() {
                Some(io) => io.write(&pcm),
                None => return Err(TransportError::Closed),
            };

            match write_res {
                Ok(()) => {
                    // Pace the next write by this frame's play-out
                    // time so the sink buffer never overruns.
                    let samples = (pcm.len() / 2) as f64;
                    self.next_tx_at = now
                        + Duration::from_secs_f64(
                            samples / f64::from(self.config.sample_rate.max(8000)),
                        );
                    self.arq.mark_tx_complete(&item);
                }
                Err(e) => {
                    if item.seq.is_none() {
                        // Keep ACK frames queued so a transient sink
                        // stall does not lose them.
                        self.arq.requeue_tx_front(item);
                    } else {
                        self.arq.mark_tx_failed(&item);
                    }
                    return Err(TransportError::Medium(format!("audio write failed: {e}")));
                }
            }
        }
    }

    fn maybe_log_codec_stats(&mut self) {
        if self.last_stats_log.elapsed() < STATS_LOG_INTERVAL {
            return;
        }
        self.last_stats_log = Instant::now();
        let stats = self.codec.stats();
        debug!(
            "{}: frames_decoded={} sync_hits={} crc_failures={} decode_failures={}",
            self.label,
            stats.frames_decoded,
            stats.sync_hits,
            stats.crc_failures,
            stats.decode_failures
        );
    }
}

impl TransportBackend for AudioModemTransportBackend {
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

        self.arq.schedule_due_frames(Instant::now())?;
        self.write_due_frames()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut io) = self.io.take() {
            io.close();
        }
        info!("closed audio modem transport {}", self.label);
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use assert_matches::assert_matches;
    use sidessh_protocol::{build_message, Endpoint, Payload, Protocol};

    use crate::audio::io::QueueDuplexIo;

    use super::*;

    fn test_config() -> AudioModemTransportConfig {
        AudioModemTransportConfig {
            ack_timeout: Duration::from_millis(30),
            max_retries: 4,
            byte_repeat: 1,
            marker_run: 4,
            modulation: AudioModulation::Legacy,
            ..AudioModemTransportConfig::default()
        }
    }

    fn pair() -> (AudioModemTransportBackend, AudioModemTransportBackend) {
        let (a, b) = QueueDuplexIo::linked_pair();
        (
            AudioModemTransportBackend::new(Box::new(a), "mic-a", "spk-a", test_config()),
            AudioModemTransportBackend::new(Box::new(b), "mic-b", "spk-b", test_config()),
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
    #[ntest::timeout(60000)]
    fn delivers_exactly_once_over_pcm() {
        let (mut sender, mut receiver) = pair();
        let message = stream_frame(1);
        sender.write_outbound_message(&message).expect("write");

        let mut received = Vec::new();
        for _ in 0..40 {
            let _ = sender.push_outbound();
            let (mut msgs, _) = receiver.read_inbound_messages(None).expect("read");
            received.append(&mut msgs);
            let _ = receiver.push_outbound();
            let _ = sender.fetch_inbound();
            if !received.is_empty() && !sender.arq.has_pending() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(received, vec![message]);
        let (msgs, _) = receiver.read_inbound_messages(None).expect("read");
        assert!(msgs.is_empty());
    }

    #[test]
    #[ntest::timeout(60000)]
    fn withheld_acks_raise_peer_timeout() {
        let (mut sender, mut receiver) = pair();
        let message = stream_frame(1);
        sender.write_outbound_message(&message).expect("write");

        let mut received = Vec::new();
        let mut failure = None;
        for _ in 0..60 {
            match sender.push_outbound() {
                Ok(()) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            let (mut msgs, _) = receiver.read_inbound_messages(None).expect("read");
            received.append(&mut msgs);
            thread::sleep(Duration::from_millis(10));
        }

        assert_matches!(failure, Some(TransportError::PeerTimeout(_)));
        assert_eq!(received, vec![message]);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let (mut sender, _receiver) = pair();
        sender.config.frame_max_bytes = 4;
        let err = sender
            .write_outbound_message(&stream_frame(1))
            .expect_err("oversize");
        assert!(matches!(err, TransportError::EncodeOversize { .. }));
    }

    #[test]
    #[ntest::timeout(60000)]
    fn lossy_pcm_still_converges() {
        let (mut sender, mut receiver) = pair();
        let message = stream_frame(1);
        sender.write_outbound_message(&message).expect("write");

        // Drop the first transmission on the floor by draining the
        // receiver's queue without decoding, then let the ARQ
        // retransmit.
        let _ = sender.push_outbound();
        if let Some(io) = receiver.io.as_mut() {
            let _ = io.read(1 << 20).expect("drain");
        }

        let mut received = Vec::new();
        for _ in 0..40 {
            thread::sleep(Duration::from_millis(35));
            let _ = sender.push_outbound();
            let (mut msgs, _) = receiver.read_inbound_messages(None).expect("read");
            received.append(&mut msgs);
            let _ = receiver.push_outbound();
            let _ = sender.fetch_inbound();
            if !received.is_empty() && !sender.arq.has_pending() {
                break;
            }
        }

        assert_eq!(received, vec![message]);
    }
}
