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

//! Byte-frame codec over mono 16-bit little-endian PCM.
//!
//! Encoding: COBS-stuff the frame (plus a 0x00 delimiter), repeat each
//! byte `byte_repeat` times as cheap forward error correction, map
//! every byte to one sample at amplitude `(b - 128) * 256`, and bracket
//! the result in runs of start/end marker samples. Decoding scans for
//! marker runs, quantizes samples back to bytes, majority-votes each
//! repetition group, and COBS-decodes up to the delimiter. Marker runs
//! survive capture latency jitter, and the 256-level quantization is
//! insensitive to the amplitude scaling common across sound stacks.

use byteorder::{ByteOrder, LittleEndian};

const START_MARKER: i16 = 30000;
const END_MARKER: i16 = -30000;
const MARKER_TOLERANCE: i16 = 2000;

/// Running decode counters, exposed for transport diagnostics.
/// `crc_failures` is fed back by the link layer, which owns the only
/// checksum in the audio path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodecStats {
    pub frames_decoded: u64,
    pub sync_hits: u64,
    pub crc_failures: u64,
    pub decode_failures: u64,
}

pub struct AudioFrameCodec {
    byte_repeat: usize,
    marker_run: usize,
    samples: Vec<i16>,
    /// An odd trailing PCM byte held over to pair with the next feed.
    pending_byte: Option<u8>,
    stats: CodecStats,
}

impl AudioFrameCodec {
    pub fn new(byte_repeat: usize, marker_run: usize) -> Self {
        AudioFrameCodec {
            byte_repeat: byte_repeat.max(1),
            marker_run: marker_run.max(4),
            samples: Vec::new(),
            pending_byte: None,
            stats: CodecStats::default(),
        }
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    pub fn note_crc_failure(&mut self) {
        self.stats.crc_failures += 1;
    }

    /// Encode one frame into PCM bytes.
    pub fn encode_frame(&self, frame: &[u8]) -> Vec<u8> {
        let mut payload = cobs_encode(frame);
        payload.push(0);

        let sample_count = self.marker_run * 2 + payload.len() * self.byte_repeat;
        let mut samples = Vec::with_capacity(sample_count);
        samples.resize(self.marker_run, START_MARKER);
        for byte in payload {
            let value = (i32::from(byte) - 128) * 256;
            for _ in 0..self.byte_repeat {
                samples.push(value as i16);
            }
        }
        samples.extend(std::iter::repeat(END_MARKER).take(self.marker_run));

        let mut pcm = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(&samples, &mut pcm);
        pcm
    }

    /// Feed captured PCM, returning every complete frame it finishes.
    /// Partial frames are buffered until later feeds complete them.
    pub fn feed_pcm(&mut self, pcm: &[u8]) -> Vec<Vec<u8>> {
        if pcm.is_empty() {
            return Vec::new();
        }
        self.append_samples(pcm);

        let mut frames = Vec::new();
        while let Some(frame) = self.extract_one_frame() {
            if !frame.is_empty() {
                frames.push(frame);
            }
        }
        frames
    }

    fn append_samples(&mut self, pcm: &[u8]) {
        let mut bytes: Vec<u8>;
        let data: &[u8] = match self.pending_byte.take() {
            Some(first) => {
                bytes = Vec::with_capacity(pcm.len() + 1);
                bytes.push(first);
                bytes.extend_from_slice(pcm);
                &bytes
            }
            None => pcm,
        };

        let pairs = data.len() / 2;
        if data.len() % 2 != 0 {
            self.pending_byte = Some(data[data.len() - 1]);
        }

        self.samples.reserve(pairs);
        for chunk in data[..pairs * 2].chunks_exact(2) {
            self.samples.push(LittleEndian::read_i16(chunk));
        }
    }

    /// Pull the next complete frame out of the sample buffer. Returns
    /// `Some(vec![])` when a marker-delimited region failed to decode,
    /// so the caller keeps scanning, and `None` when more audio is
    /// needed.
    fn extract_one_frame(&mut self) -> Option<Vec<u8>> {
        if self.samples.len() < self.marker_run * 2 {
            return None;
        }

        let start_idx = match self.find_marker(START_MARKER, 0) {
            Some(idx) => idx,
            None => {
                // Keep enough tail that a marker run spanning this
                // feed boundary can still match next time.
                let keep = (self.marker_run * 2).max(8);
                if self.samples.len() > keep {
                    self.samples.drain(..self.samples.len() - keep);
                }
                return None;
            }
        };

        let payload_start = start_idx + self.marker_run;
        let end_idx = match self.find_marker(END_MARKER, payload_start) {
            Some(idx) => idx,
            None => {
                if start_idx > 0 {
                    self.samples.drain(..start_idx);
                }
                return None;
            }
        };

        self.stats.sync_hits += 1;
        let payload: Vec<i16> = self.samples[payload_start..end_idx].to_vec();
        self.samples.drain(..end_idx + self.marker_run);

        match self.decode_payload_samples(&payload) {
            Some(frame) => {
                self.stats.frames_decoded += 1;
                Some(frame)
            }
            None => {
                self.stats.decode_failures += 1;
                Some(Vec::new())
            }
        }
    }

    /// First index of a run of at least `marker_run` samples within
    /// tolerance of `marker`, starting the scan at `start`.
    fn find_marker(&self, marker: i16, start: usize) -> Option<usize> {
        let mut run = 0usize;
        let mut first_idx = 0usize;
        for idx in start..self.samples.len() {
            let delta = i32::from(self.samples[idx]) - i32::from(marker);
            if delta.unsigned_abs() <= MARKER_TOLERANCE as u32 {
                if run == 0 {
                    first_idx = idx;
                }
                run += 1;
                if run >= self.marker_run {
                    return Some(first_idx);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn decode_payload_samples(&self, payload: &[i16]) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return None;
        }

        let mut raw: Vec<u8> = Vec::with_capacity(payload.len());
        for &sample in payload {
            let value = ((f64::from(sample) / 256.0).round() as i32 + 128).clamp(0, 255);
            raw.push(value as u8);
        }

        if self.byte_repeat > 1 {
            let mut voted = Vec::with_capacity(raw.len() / self.byte_repeat);
            for group in raw.chunks_exact(self.byte_repeat) {
                voted.push(majority_vote(group));
            }
            raw = voted;
        }

        let terminator = raw.iter().position(|&b| b == 0)?;
        let encoded = &raw[..terminator];
        if encoded.is_empty() {
            return None;
        }
        cobs_decode(encoded)
    }
}

/// The most common byte in a repetition group; first seen wins ties.
fn majority_vote(group: &[u8]) -> u8 {
    let mut best = group[0];
    let mut best_count = 0usize;
    for &candidate in group {
        let count = group.iter().filter(|&&b| b == candidate).count();
        // Equal counts keep the earlier candidate.
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Consistent Overhead Byte Stuffing: removes 0x00 from the payload so
/// a single zero byte can delimit frames. Blocks cap at 254 data
/// bytes.
fn cobs_encode(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return vec![0x01];
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 1);
    let mut idx = 0usize;
    while idx < data.len() {
        let block_start = idx;
        while idx < data.len() && data[idx] != 0 && (idx - block_start) < 254 {
            idx += 1;
        }
        out.push((idx - block_start + 1) as u8);
        out.extend_from_slice(&data[block_start..idx]);
        if idx < data.len() && data[idx] == 0 {
            idx += 1;
        }
    }
    out
}

fn cobs_decode(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(data.len());
    let mut idx = 0usize;
    while idx < data.len() {
        let code = data[idx];
        idx += 1;
        if code == 0 {
            return None;
        }
        let count = (code - 1) as usize;
        if idx + count > data.len() {
            return None;
        }
        out.extend_from_slice(&data[idx..idx + count]);
        idx += count;
        if code < 0xFF && idx < data.len() {
            out.push(0);
        }
    }
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cobs_round_trip() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            vec![0, 0],
            vec![1, 2, 3],
            vec![1, 0, 2, 0, 3],
            (0..=255u8).collect(),
            vec![7; 600],
        ];
        for case in cases {
            let encoded = cobs_encode(&case);
            assert!(!encoded.contains(&0), "no zeros in {case:?} encoding");
            let decoded = cobs_decode(&encoded).expect("decode");
            assert_eq!(decoded, case);
        }
    }

    #[test]
    fn pcm_round_trip_across_parameters() {
        let frames: Vec<Vec<u8>> = vec![
            vec![0x42],
            b"hello world".to_vec(),
            vec![0, 1, 2, 0, 255, 0],
            (0..=255u8).collect(),
        ];

        for byte_repeat in [1usize, 2, 3, 5] {
            for marker_run in [4usize, 8, 16] {
                let mut codec = AudioFrameCodec::new(byte_repeat, marker_run);
                for frame in &frames {
                    let pcm = codec.encode_frame(frame);
                    let decoded = codec.feed_pcm(&pcm);
                    assert_eq!(
                        decoded,
                        vec![frame.clone()],
                        "byte_repeat={byte_repeat} marker_run={marker_run}"
                    );
                }
            }
        }
    }

    #[test]
    fn single_sample_corruption_is_recovered() {
        let mut codec = AudioFrameCodec::new(3, 16);
        let frame = b"corruption test".to_vec();
        let mut pcm = codec.encode_frame(&frame);

        // Flip one sample in each of the first three payload groups.
        // The majority vote across the remaining two repeats recovers
        // every byte.
        let payload_offset = 16 * 2; // skip the start marker samples
        for group in 0..3 {
            let sample_idx = payload_offset + (group * 3 + group % 3) * 2;
            pcm[sample_idx] ^= 0xff;
        }

        let decoded = codec.feed_pcm(&pcm);
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut codec = AudioFrameCodec::new(3, 16);
        let frame = b"after noise".to_vec();

        let mut noise = vec![0u8; 2048];
        for (idx, byte) in noise.iter_mut().enumerate() {
            *byte = (idx * 31 % 200) as u8;
        }
        assert!(codec.feed_pcm(&noise).is_empty());

        let pcm = codec.encode_frame(&frame);
        assert_eq!(codec.feed_pcm(&pcm), vec![frame]);
    }

    #[test]
    fn frame_split_across_feeds_is_reassembled() {
        let mut codec = AudioFrameCodec::new(3, 16);
        let frame = b"split delivery".to_vec();
        let pcm = codec.encode_frame(&frame);

        let mut decoded = Vec::new();
        for chunk in pcm.chunks(7) {
            decoded.extend(codec.feed_pcm(chunk));
        }
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn back_to_back_frames_both_decode() {
        let mut codec = AudioFrameCodec::new(2, 8);
        let first = b"first".to_vec();
        let second = b"second".to_vec();

        let mut pcm = codec.encode_frame(&first);
        pcm.extend(codec.encode_frame(&second));

        assert_eq!(codec.feed_pcm(&pcm), vec![first, second]);
    }

    #[test]
    fn stats_track_decodes_and_failures() {
        let mut codec = AudioFrameCodec::new(3, 16);
        let frame = b"stats".to_vec();
        let pcm = codec.encode_frame(&frame);
        codec.feed_pcm(&pcm);

        let stats = codec.stats();
        assert_eq!(stats.frames_decoded, 1);
        assert_eq!(stats.sync_hits, 1);
        assert_eq!(stats.decode_failures, 0);

        codec.note_crc_failure();
        assert_eq!(codec.stats().crc_failures, 1);
    }
}
