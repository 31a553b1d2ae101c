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

//! Duplex PCM audio I/O.
//!
//! The transports and discovery only ever talk to [`AudioDuplexIo`];
//! the concrete implementation shells out to `pacat`, and tests wire
//! up in-memory queues. PulseAudio/PipeWire device setup itself lives
//! outside this crate.

use std::{
    collections::VecDeque,
    io::{Read as _, Write as _},
    os::fd::AsFd,
    process,
    sync::{Arc, Mutex},
};

use nix::fcntl;
use nix::fcntl::OFlag;
use thiserror::Error;
use tracing::{info, warn};

use crate::transport::find_in_path;

#[derive(Debug, Error)]
#[error("audio io error: {0}")]
pub struct AudioIoError(pub String);

/// A full duplex PCM byte pipe: mono 16-bit little-endian samples in
/// both directions. Reads are nonblocking and return an empty buffer
/// when no audio has been captured yet.
pub trait AudioDuplexIo: Send {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, AudioIoError>;
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioIoError>;
    fn close(&mut self);
}

/// Duplex audio through two `pacat` subprocesses, one recording from
/// the input device and one playing into the output device.
pub struct PulseCliAudioDuplexIo {
    reader: Option<process::Child>,
    writer: Option<process::Child>,
    input_device: String,
    output_device: String,
}

impl PulseCliAudioDuplexIo {
    pub fn new(
        input_device: &str,
        output_device: &str,
        sample_rate: u32,
    ) -> Result<Self, AudioIoError> {
        if find_in_path("pacat").is_none() {
            return Err(AudioIoError(String::from(
                "pacat is not available in PATH; install pulseaudio-utils",
            )));
        }

        let rate = format!("--rate={}", sample_rate.max(8000));
        let reader = process::Command::new("pacat")
            .arg("--record")
            .arg("-d")
            .arg(input_device)
            .arg(&rate)
            .arg("--format=s16le")
            .arg("--channels=1")
            .arg("--raw")
            .arg("--latency-msec=20")
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::null())
            .spawn()
            .map_err(|e| AudioIoError(format!("spawning pacat --record: {e}")))?;

        if let Some(stdout) = reader.stdout.as_ref() {
            set_nonblocking(stdout.as_fd())
                .map_err(|e| AudioIoError(format!("marking capture pipe nonblocking: {e}")))?;
        }

        let writer = process::Command::new("pacat")
            .arg("--playback")
            .arg("-d")
            .arg(output_device)
            .arg(&rate)
            .arg("--format=s16le")
            .arg("--channels=1")
            .arg("--raw")
            .arg("--latency-msec=20")
            .stdin(process::Stdio::piped())
            .stderr(process::Stdio::null())
            .spawn()
            .map_err(|e| AudioIoError(format!("spawning pacat --playback: {e}")))?;

        info!("audio duplex io open (in={input_device}, out={output_device})");
        Ok(PulseCliAudioDuplexIo {
            reader: Some(reader),
            writer: Some(writer),
            input_device: String::from(input_device),
            output_device: String::from(output_device),
        })
    }
}

impl AudioDuplexIo for PulseCliAudioDuplexIo {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, AudioIoError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| AudioIoError(String::from("audio capture is closed")))?;
        let stdout = reader
            .stdout
            .as_mut()
            .ok_or_else(|| AudioIoError(String::from("audio capture has no pipe")))?;

        let mut buf = vec![0u8; max_bytes.max(2)];
        match stdout.read(&mut buf) {
            Ok(0) => Err(AudioIoError(format!(
                "pacat capture for {} exited",
                self.input_device
            ))),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(AudioIoError(format!("audio read failed: {e}"))),
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioIoError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AudioIoError(String::from("audio playback is closed")))?;
        let stdin = writer
            .stdin
            .as_mut()
            .ok_or_else(|| AudioIoError(String::from("audio playback has no pipe")))?;

        stdin.write_all(pcm).map_err(|e| {
            AudioIoError(format!("audio write to {} failed: {e}", self.output_device))
        })
    }

    fn close(&mut self) {
        for child in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            reap(child);
        }
    }
}

impl Drop for PulseCliAudioDuplexIo {
    fn drop(&mut self) {
        self.close();
    }
}

fn reap(mut child: process::Child) {
    if let Err(e) = child.kill() {
        warn!("killing pacat child: {e}");
    }
    let _ = child.wait();
}

fn set_nonblocking(fd: std::os::fd::BorrowedFd<'_>) -> nix::Result<()> {
    let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// List Pulse/PipeWire capture sources and playback sinks by shelling
/// out to `pactl list short`.
pub fn list_pulse_devices() -> Result<(Vec<String>, Vec<String>), AudioIoError> {
    Ok((pactl_names("sources")?, pactl_names("sinks")?))
}

fn pactl_names(kind: &str) -> Result<Vec<String>, AudioIoError> {
    let output = process::Command::new("pactl")
        .arg("list")
        .arg("short")
        .arg(kind)
        .output()
        .map_err(|e| AudioIoError(format!("running pactl list short {kind}: {e}")))?;
    if !output.status.success() {
        return Err(AudioIoError(format!(
            "pactl list short {kind} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let mut names = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Some(name) = line.split_whitespace().nth(1) {
            if !names.iter().any(|n| n == name) {
                names.push(String::from(name));
            }
        }
    }
    Ok(names)
}

/// Shared byte queue used to stitch fake audio fabrics together in
/// tests.
pub type SharedPcmQueue = Arc<Mutex<VecDeque<u8>>>;

pub fn shared_queue() -> SharedPcmQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// In-memory duplex endpoint reading from one queue and writing to
/// another. Two endpoints built with crossed queues form a loopback
/// link; fabrics with broken directions just use dead-end queues.
pub struct QueueDuplexIo {
    rx: SharedPcmQueue,
    tx: SharedPcmQueue,
    closed: bool,
}

impl QueueDuplexIo {
    pub fn new(rx: SharedPcmQueue, tx: SharedPcmQueue) -> Self {
        QueueDuplexIo { rx, tx, closed: false }
    }

    /// A connected pair of endpoints, each hearing what the other
    /// plays.
    pub fn linked_pair() -> (QueueDuplexIo, QueueDuplexIo) {
        let a_to_b = shared_queue();
        let b_to_a = shared_queue();
        (
            QueueDuplexIo::new(b_to_a.clone(), a_to_b.clone()),
            QueueDuplexIo::new(a_to_b, b_to_a),
        )
    }
}

impl AudioDuplexIo for QueueDuplexIo {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, AudioIoError> {
        if self.closed {
            return Err(AudioIoError(String::from("queue io is closed")));
        }
        let mut queue = self.rx.lock().unwrap();
        let take = max_bytes.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioIoError> {
        if self.closed {
            return Err(AudioIoError(String::from("queue io is closed")));
        }
        self.tx.lock().unwrap().extend(pcm.iter().copied());
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_pair_round_trips() {
        let (mut a, mut b) = QueueDuplexIo::linked_pair();
        a.write(&[1, 2, 3, 4]).expect("write");
        assert_eq!(b.read(16).expect("read"), vec![1, 2, 3, 4]);
        assert!(b.read(16).expect("read").is_empty());

        b.write(&[9]).expect("write");
        assert_eq!(a.read(16).expect("read"), vec![9]);
    }

    #[test]
    fn closed_queue_io_errors() {
        let (mut a, _b) = QueueDuplexIo::linked_pair();
        a.close();
        assert!(a.read(4).is_err());
        assert!(a.write(&[0]).is_err());
    }
}
