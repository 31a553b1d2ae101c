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

//! Automatic audio device-pair discovery.
//!
//! Each peer opens a writer channel per local output and a listener
//! channel per local input, then floods `ping` frames. Hearing a
//! `pong` that echoes one of our nonces pins down a working
//! `(input, output)` pair; `found`/`found_ack` confirm the choice with
//! the peer before either side commits. Channels whose I/O dies are
//! dropped from the probe; losing all of them fails the discovery.

use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    create_codec,
    io::{AudioDuplexIo, AudioIoError},
    AudioFrameCodec, AudioModulation,
};

const KIND_PING: &str = "ping";
const KIND_PONG: &str = "pong";
const KIND_FOUND: &str = "found";
const KIND_FOUND_ACK: &str = "found_ack";

/// Reads per listener per tick, bounding time spent on one channel.
const READS_PER_LISTENER: usize = 8;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct AudioDiscoveryConfig {
    pub sample_rate: u32,
    pub ping_interval: Duration,
    pub found_interval: Duration,
    pub timeout: Duration,
    pub candidate_grace: Duration,
    /// Pending pings older than this are swept, freeing the per-output
    /// backpressure budget.
    pub max_silent: Duration,
    pub progress_log_interval: Duration,
    pub idle_sleep: Duration,
    pub max_pending_pings_per_output: usize,
    pub byte_repeat: usize,
    pub marker_run: usize,
    pub modulation: AudioModulation,
}

impl Default for AudioDiscoveryConfig {
    fn default() -> Self {
        AudioDiscoveryConfig {
            sample_rate: 48000,
            ping_interval: Duration::from_millis(120),
            found_interval: Duration::from_millis(120),
            timeout: Duration::from_secs(90),
            candidate_grace: Duration::from_secs(20),
            max_silent: Duration::from_secs(10),
            progress_log_interval: Duration::from_secs(2),
            idle_sleep: Duration::from_millis(10),
            max_pending_pings_per_output: 2,
            byte_repeat: 3,
            marker_run: 16,
            modulation: AudioModulation::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAudioDevices {
    pub input_device: String,
    pub output_device: String,
    pub modulation: AudioModulation,
    pub peer_id: String,
}

/// Opens a duplex channel for an `(input, output)` device pair.
pub type IoFactory<'a> =
    dyn FnMut(&str, &str) -> Result<Box<dyn AudioDuplexIo>, AudioIoError> + 'a;

#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryFrame {
    kind: String,
    sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    echo_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modulation: Option<String>,
}

struct WriterChannel {
    output_device: String,
    io: Box<dyn AudioDuplexIo>,
    codec: AudioFrameCodec,
    next_ping_at: Instant,
    /// Frame-duration backpressure: no transmission before this point.
    next_tx_at: Instant,
}

struct ListenerChannel {
    input_device: String,
    io: Box<dyn AudioDuplexIo>,
    codec: AudioFrameCodec,
}

#[derive(Debug, Default)]
struct DiscoveryStats {
    pings_sent: u64,
    pongs_rx: u64,
    found_sent: u64,
    found_rx: u64,
    found_ack_rx: u64,
    frames_rx: u64,
}

/// Probe all local device pairs and return the first confirmed
/// bidirectional pair. With `auto` modulation, robust-v1 gets 70% of
/// the timeout before the legacy profile gets the remainder.
pub fn discover_audio_devices(
    config: &AudioDiscoveryConfig,
    input_devices: &[String],
    output_devices: &[String],
    io_factory: &mut IoFactory<'_>,
) -> Result<DiscoveredAudioDevices, AudioIoError> {
    let inputs = dedupe(input_devices);
    let outputs = dedupe(output_devices);
    if inputs.is_empty() {
        return Err(AudioIoError(String::from("audio discovery found no input devices")));
    }
    if outputs.is_empty() {
        return Err(AudioIoError(String::from("audio discovery found no output devices")));
    }

    match config.modulation {
        AudioModulation::Auto => {
            let total = config.timeout.max(Duration::from_secs(1));
            let robust_timeout = total.mul_f64(0.7).max(Duration::from_secs(1));
            let legacy_timeout =
                total.saturating_sub(robust_timeout).max(Duration::from_secs(1));

            info!(
                "audio discovery auto modulation: trying robust-v1 for {:.1}s, then legacy for {:.1}s if needed",
                robust_timeout.as_secs_f64(),
                legacy_timeout.as_secs_f64()
            );

            let mut robust_config = config.clone();
            robust_config.timeout = robust_timeout;
            let robust_err = match discover_once(
                &robust_config,
                AudioModulation::RobustV1,
                &inputs,
                &outputs,
                io_factory,
            ) {
                Ok(found) => return Ok(found),
                Err(e) => e,
            };
            warn!("audio discovery robust-v1 failed, falling back to legacy: {robust_err}");

            let mut legacy_config = config.clone();
            legacy_config.timeout = legacy_timeout;
            match discover_once(
                &legacy_config,
                AudioModulation::Legacy,
                &inputs,
                &outputs,
                io_factory,
            ) {
                Ok(found) => Ok(found),
                Err(legacy_err) => Err(AudioIoError(format!(
                    "audio discovery failed in both modulation modes.\n- robust-v1: {robust_err}\n- legacy: {legacy_err}"
                ))),
            }
        }
        modulation => discover_once(config, modulation, &inputs, &outputs, io_factory),
    }
}

fn discover_once(
    config: &AudioDiscoveryConfig,
    modulation: AudioModulation,
    inputs: &[String],
    outputs: &[String],
    io_factory: &mut IoFactory<'_>,
) -> Result<DiscoveredAudioDevices, AudioIoError> {
    info!(
        "audio discovery starting with {} input(s), {} output(s), modulation={modulation} (timeout={:.1}s)",
        inputs.len(),
        outputs.len(),
        config.timeout.as_secs_f64()
    );

    let mut open_errors: Vec<String> = Vec::new();
    let mut writers: Vec<WriterChannel> = Vec::new();
    for output in outputs {
        // Any input works as the anchor for a writer channel; we only
        // ever transmit on it.
        match open_channel(inputs, std::slice::from_ref(output), io_factory, &mut open_errors)
        {
            Some((_, output_device, io)) => writers.push(WriterChannel {
                output_device,
                io,
                codec: create_codec(modulation, config.byte_repeat, config.marker_run),
                next_ping_at: Instant::now(),
                next_tx_at: Instant::now(),
            }),
            None => {}
        }
    }
    let mut listeners: Vec<ListenerChannel> = Vec::new();
    for input in inputs {
        match open_channel(std::slice::from_ref(input), outputs, io_factory, &mut open_errors)
        {
            Some((input_device, _, io)) => listeners.push(ListenerChannel {
                input_device,
                io,
                codec: create_codec(modulation, config.byte_repeat, config.marker_run),
            }),
            None => {}
        }
    }

    info!(
        "audio discovery channels opened: writer_channels={}/{}, listener_channels={}/{}",
        writers.len(),
        outputs.len(),
        listeners.len(),
        inputs.len()
    );
    if writers.is_empty() {
        return Err(AudioIoError(format!(
            "audio discovery could not open any writer channel:\n{}",
            open_errors.join("\n")
        )));
    }
    if listeners.is_empty() {
        return Err(AudioIoError(format!(
            "audio discovery could not open any listener channel:\n{}",
            open_errors.join("\n")
        )));
    }

    let local_id = short_id();
    // nonce -> (output device it was pinged on, when)
    let mut pending_pings: HashMap<String, (String, Instant)> = HashMap::new();
    let mut stats = DiscoveryStats::default();
    let mut selected: Option<DiscoveredAudioDevices> = None;
    let mut next_found_at = Instant::now();
    let mut last_progress_log = Instant::now();

    let deadline = Instant::now() + config.timeout.max(Duration::from_secs(1));
    let mut candidate_deadline = deadline;

    loop {
        let now = Instant::now();
        let effective_deadline =
            if selected.is_some() { candidate_deadline } else { deadline };
        if now >= effective_deadline {
            return Err(AudioIoError(format!(
                "audio discovery timed out (modulation={modulation}, pings_sent={}, pongs_rx={}, \
                 found_rx={}, found_ack_rx={}, frames_rx={}, candidate={})",
                stats.pings_sent,
                stats.pongs_rx,
                stats.found_rx,
                stats.found_ack_rx,
                stats.frames_rx,
                selected.is_some()
            )));
        }

        if selected.is_none() {
            send_due_pings(
                config,
                modulation,
                &local_id,
                &mut writers,
                &mut pending_pings,
                &mut stats,
                now,
            );
        }
        if writers.is_empty() {
            return Err(AudioIoError(String::from(
                "audio discovery lost all usable output devices while probing",
            )));
        }

        if let Some(found) = selected.as_ref() {
            if now >= next_found_at {
                let frame = DiscoveryFrame {
                    kind: String::from(KIND_FOUND),
                    sender: local_id.clone(),
                    nonce: None,
                    target: Some(found.peer_id.clone()),
                    echo_nonce: None,
                    modulation: Some(modulation.to_string()),
                };
                let sent = broadcast(&mut writers, &frame, now, config.sample_rate, true);
                stats.found_sent += sent;
                next_found_at = now + config.found_interval.max(Duration::from_millis(10));
            }
        }

        let mut confirmed = false;
        let mut li = 0;
        while li < listeners.len() {
            let input_device = listeners[li].input_device.clone();
            let frames = match drain_listener(&mut listeners[li]) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("listener channel in='{input_device}' disabled: {e}");
                    listeners.remove(li);
                    continue;
                }
            };

            for raw in frames {
                stats.frames_rx += 1;
                let frame: DiscoveryFrame = match serde_json::from_slice(&raw) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if frame.sender == local_id {
                    continue;
                }
                if !modulation_matches(&frame, modulation) {
                    continue;
                }

                match frame.kind.as_str() {
                    KIND_PING => {
                        let nonce = match frame.nonce.as_deref() {
                            Some(n) if !n.is_empty() => n,
                            _ => continue,
                        };
                        let pong = DiscoveryFrame {
                            kind: String::from(KIND_PONG),
                            sender: local_id.clone(),
                            nonce: None,
                            target: Some(frame.sender.clone()),
                            echo_nonce: Some(String::from(nonce)),
                            modulation: Some(modulation.to_string()),
                        };
                        broadcast(&mut writers, &pong, now, config.sample_rate, false);
                    }
                    KIND_PONG => {
                        stats.pongs_rx += 1;
                        if frame.target.as_deref() != Some(local_id.as_str()) {
                            continue;
                        }
                        let echo = match frame.echo_nonce.as_deref() {
                            Some(n) if !n.is_empty() => n,
                            _ => continue,
                        };
                        let (output_device, _) = match pending_pings.remove(echo) {
                            Some(entry) => entry,
                            None => continue,
                        };

                        if selected.is_none() {
                            let candidate = DiscoveredAudioDevices {
                                input_device: input_device.clone(),
                                output_device,
                                modulation,
                                peer_id: frame.sender.clone(),
                            };
                            info!(
                                "audio discovery candidate selected: in={}, out={}, modulation={}, peer={}",
                                candidate.input_device,
                                candidate.output_device,
                                candidate.modulation,
                                candidate.peer_id
                            );
                            candidate_deadline = deadline
                                .max(now + config.candidate_grace);
                            next_found_at = now;
                            selected = Some(candidate);
                        }
                    }
                    KIND_FOUND => {
                        stats.found_rx += 1;
                        if frame.target.as_deref() != Some(local_id.as_str()) {
                            continue;
                        }
                        let peer = match selected.as_ref() {
                            Some(found) if found.peer_id == frame.sender => {
                                found.peer_id.clone()
                            }
                            _ => continue,
                        };
                        let ack = DiscoveryFrame {
                            kind: String::from(KIND_FOUND_ACK),
                            sender: local_id.clone(),
                            nonce: None,
                            target: Some(peer),
                            echo_nonce: None,
                            modulation: Some(modulation.to_string()),
                        };
                        broadcast(&mut writers, &ack, now, config.sample_rate, false);
                    }
                    KIND_FOUND_ACK => {
                        stats.found_ack_rx += 1;
                        if frame.target.as_deref() != Some(local_id.as_str()) {
                            continue;
                        }
                        if let Some(found) = selected.as_ref() {
                            if found.peer_id == frame.sender {
                                info!("audio discovery confirmed by peer acknowledgement");
                                confirmed = true;
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }

            if confirmed {
                break;
            }
            li += 1;
        }

        if confirmed {
            if let Some(found) = selected.take() {
                return Ok(found);
            }
        }
        if listeners.is_empty() {
            return Err(AudioIoError(String::from(
                "audio discovery lost all usable input devices while probing",
            )));
        }

        let ttl = config.max_silent.max(Duration::from_secs(1));
        pending_pings.retain(|_, (_, at)| now.duration_since(*at) < ttl);

        if now.duration_since(last_progress_log)
            >= config.progress_log_interval.max(Duration::from_millis(500))
        {
            last_progress_log = now;
            debug!(
                "audio discovery progress: listeners={} writers={} pings_sent={} pongs_rx={} \
                 found_sent={} found_ack_rx={} pending_pings={}",
                listeners.len(),
                writers.len(),
                stats.pings_sent,
                stats.pongs_rx,
                stats.found_sent,
                stats.found_ack_rx,
                pending_pings.len()
            );
        }

        thread::sleep(config.idle_sleep);
    }
}

fn send_due_pings(
    config: &AudioDiscoveryConfig,
    modulation: AudioModulation,
    local_id: &str,
    writers: &mut Vec<WriterChannel>,
    pending_pings: &mut HashMap<String, (String, Instant)>,
    stats: &mut DiscoveryStats,
    now: Instant,
) {
    let cap = config.max_pending_pings_per_output.max(1);

    let mut idx = 0;
    while idx < writers.len() {
        let due = {
            let writer = &writers[idx];
            now >= writer.next_ping_at
                && now >= writer.next_tx_at
                && pending_for_output(pending_pings, &writer.output_device) < cap
        };
        if !due {
            idx += 1;
            continue;
        }

        let nonce = short_nonce();
        let ping = DiscoveryFrame {
            kind: String::from(KIND_PING),
            sender: String::from(local_id),
            nonce: Some(nonce.clone()),
            target: None,
            echo_nonce: None,
            modulation: Some(modulation.to_string()),
        };

        match send_frame(&mut writers[idx], &ping, now, config.sample_rate, true) {
            Ok(true) => {
                let output = writers[idx].output_device.clone();
                pending_pings.insert(nonce, (output, now));
                stats.pings_sent += 1;
                writers[idx].next_ping_at =
                    now + config.ping_interval.max(Duration::from_millis(10));
                idx += 1;
            }
            Ok(false) => {
                idx += 1;
            }
            Err(e) => {
                warn!(
                    "writer channel out='{}' disabled: {e}",
                    writers[idx].output_device
                );
                writers.remove(idx);
            }
        }
    }
}

/// Send to every writer, dropping any whose I/O fails. Returns how
/// many writers actually transmitted.
fn broadcast(
    writers: &mut Vec<WriterChannel>,
    frame: &DiscoveryFrame,
    now: Instant,
    sample_rate: u32,
    respect_backpressure: bool,
) -> u64 {
    let mut sent = 0;
    let mut idx = 0;
    while idx < writers.len() {
        match send_frame(&mut writers[idx], frame, now, sample_rate, respect_backpressure) {
            Ok(true) => {
                sent += 1;
                idx += 1;
            }
            Ok(false) => idx += 1,
            Err(e) => {
                warn!(
                    "writer channel out='{}' disabled: {e}",
                    writers[idx].output_device
                );
                writers.remove(idx);
            }
        }
    }
    sent
}

/// Encode and transmit one discovery frame on a writer. Returns
/// Ok(false) when backpressure deferred the send.
fn send_frame(
    writer: &mut WriterChannel,
    frame: &DiscoveryFrame,
    now: Instant,
    sample_rate: u32,
    respect_backpressure: bool,
) -> Result<bool, AudioIoError> {
    if respect_backpressure && now < writer.next_tx_at {
        return Ok(false);
    }

    let json = serde_json::to_vec(frame)
        .map_err(|e| AudioIoError(format!("encoding discovery frame: {e}")))?;
    let pcm = writer.codec.encode_frame(&json);
    writer.io.write(&pcm)?;

    // Give the sink time to play the frame out before the next one.
    let samples = (pcm.len() / 2) as f64;
    writer.next_tx_at =
        now + Duration::from_secs_f64(samples / f64::from(sample_rate.max(8000)));
    Ok(true)
}

fn drain_listener(listener: &mut ListenerChannel) -> Result<Vec<Vec<u8>>, AudioIoError> {
    let mut frames = Vec::new();
    for _ in 0..READS_PER_LISTENER {
        let pcm = listener.io.read(READ_CHUNK)?;
        if pcm.is_empty() {
            break;
        }
        frames.extend(listener.codec.feed_pcm(&pcm));
    }
    Ok(frames)
}

/// Open one channel from the given candidate inputs and outputs,
/// trying combinations until the factory produces a working duplex.
fn open_channel(
    inputs: &[String],
    outputs: &[String],
    io_factory: &mut IoFactory<'_>,
    open_errors: &mut Vec<String>,
) -> Option<(String, String, Box<dyn AudioDuplexIo>)> {
    for input in inputs {
        for output in outputs {
            match io_factory(input, output) {
                Ok(io) => return Some((input.clone(), output.clone(), io)),
                Err(e) => {
                    open_errors.push(format!("in='{input}' out='{output}': {e}"));
                }
            }
        }
    }
    None
}

fn modulation_matches(frame: &DiscoveryFrame, modulation: AudioModulation) -> bool {
    match frame.modulation.as_deref() {
        Some(peer) => peer == modulation.to_string(),
        // Frames without a modulation tag predate the profiles; only
        // the legacy profile accepts them.
        None => modulation == AudioModulation::Legacy,
    }
}

fn pending_for_output(pending: &HashMap<String, (String, Instant)>, output: &str) -> usize {
    pending.values().filter(|(dev, _)| dev == output).count()
}

fn dedupe(devices: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for device in devices {
        if !device.is_empty() && !out.iter().any(|d| d == device) {
            out.push(device.clone());
        }
    }
    out
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn short_nonce() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod test {
    use std::collections::HashMap as Map;

    use crate::audio::io::{shared_queue, QueueDuplexIo, SharedPcmQueue};

    use super::*;

    /// A fake audio fabric where exactly one (input, output) pair on
    /// each peer forms a working loop with the other peer; every
    /// other device leads nowhere.
    struct Fabric {
        /// input device -> queue it hears
        taps: Map<String, SharedPcmQueue>,
        /// output device -> queue it plays into
        sinks: Map<String, SharedPcmQueue>,
    }

    impl Fabric {
        fn factory(
            &self,
        ) -> impl FnMut(&str, &str) -> Result<Box<dyn AudioDuplexIo>, AudioIoError> + '_
        {
            move |input, output| {
                let rx = self
                    .taps
                    .get(input)
                    .cloned()
                    .ok_or_else(|| AudioIoError(format!("no such input {input}")))?;
                let tx = self
                    .sinks
                    .get(output)
                    .cloned()
                    .ok_or_else(|| AudioIoError(format!("no such output {output}")))?;
                Ok(Box::new(QueueDuplexIo::new(rx, tx)) as Box<dyn AudioDuplexIo>)
            }
        }
    }

    fn test_config() -> AudioDiscoveryConfig {
        AudioDiscoveryConfig {
            ping_interval: Duration::from_millis(20),
            found_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(10),
            candidate_grace: Duration::from_secs(5),
            idle_sleep: Duration::from_millis(1),
            modulation: AudioModulation::Legacy,
            ..AudioDiscoveryConfig::default()
        }
    }

    #[test]
    #[ntest::timeout(60000)]
    fn both_peers_find_the_single_working_pair() {
        let c2s = shared_queue();
        let s2c = shared_queue();

        let mut client_taps = Map::new();
        client_taps.insert(String::from("c_in_bad"), shared_queue());
        client_taps.insert(String::from("c_in_good"), s2c.clone());
        let mut client_sinks = Map::new();
        client_sinks.insert(String::from("c_out_bad"), shared_queue());
        client_sinks.insert(String::from("c_out_good"), c2s.clone());
        let client_fabric = Fabric { taps: client_taps, sinks: client_sinks };

        let mut server_taps = Map::new();
        server_taps.insert(String::from("s_in_bad"), shared_queue());
        server_taps.insert(String::from("s_in_good"), c2s);
        let mut server_sinks = Map::new();
        server_sinks.insert(String::from("s_out_bad"), shared_queue());
        server_sinks.insert(String::from("s_out_good"), s2c);
        let server_fabric = Fabric { taps: server_taps, sinks: server_sinks };

        let client_handle = std::thread::spawn(move || {
            let mut factory = client_fabric.factory();
            discover_audio_devices(
                &test_config(),
                &[String::from("c_in_bad"), String::from("c_in_good")],
                &[String::from("c_out_bad"), String::from("c_out_good")],
                &mut factory,
            )
        });
        let server_handle = std::thread::spawn(move || {
            let mut factory = server_fabric.factory();
            discover_audio_devices(
                &test_config(),
                &[String::from("s_in_bad"), String::from("s_in_good")],
                &[String::from("s_out_bad"), String::from("s_out_good")],
                &mut factory,
            )
        });

        let client = client_handle.join().expect("client thread").expect("client discovery");
        let server = server_handle.join().expect("server thread").expect("server discovery");

        assert_eq!(client.input_device, "c_in_good");
        assert_eq!(client.output_device, "c_out_good");
        assert_eq!(server.input_device, "s_in_good");
        assert_eq!(server.output_device, "s_out_good");
        assert_eq!(client.modulation, AudioModulation::Legacy);
        assert_eq!(server.modulation, AudioModulation::Legacy);
        assert!(!client.peer_id.is_empty());
        assert_ne!(client.peer_id, server.peer_id);
    }

    #[test]
    fn dead_fabric_times_out() {
        let mut taps = Map::new();
        taps.insert(String::from("in"), shared_queue());
        let mut sinks = Map::new();
        sinks.insert(String::from("out"), shared_queue());
        let fabric = Fabric { taps, sinks };

        let config = AudioDiscoveryConfig {
            timeout: Duration::from_secs(1),
            ..test_config()
        };
        let mut factory = fabric.factory();
        let result = discover_audio_devices(
            &config,
            &[String::from("in")],
            &[String::from("out")],
            &mut factory,
        );
        assert!(result.is_err());
    }

    #[test]
    fn no_devices_is_an_error() {
        let mut factory = |_: &str, _: &str| -> Result<Box<dyn AudioDuplexIo>, AudioIoError> {
            Err(AudioIoError(String::from("unused")))
        };
        let result =
            discover_audio_devices(&test_config(), &[], &[String::from("out")], &mut factory);
        assert!(result.is_err());
    }
}
