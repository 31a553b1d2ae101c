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

//! Acoustic-modem plumbing: the PCM frame codec, duplex audio I/O,
//! and automatic device-pair discovery.

use std::{fmt, str::FromStr};

pub mod codec;
pub mod discovery;
pub mod io;

pub use codec::AudioFrameCodec;

/// Which symbol profile to modulate with.
///
/// `legacy` uses the configured repetition and marker parameters
/// as-is. `robust-v1` widens both, trading throughput for sync
/// robustness on flaky speaker/microphone paths. `auto` lets the
/// caller resolve: transports pick robust-v1, discovery probes
/// robust-v1 first and falls back to legacy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioModulation {
    #[default]
    Auto,
    Legacy,
    RobustV1,
}

impl AudioModulation {
    /// Resolve `auto` to the profile transports should run with.
    pub fn effective(&self) -> AudioModulation {
        match self {
            AudioModulation::Auto => AudioModulation::RobustV1,
            other => *other,
        }
    }
}

impl fmt::Display for AudioModulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioModulation::Auto => "auto",
            AudioModulation::Legacy => "legacy",
            AudioModulation::RobustV1 => "robust-v1",
        };
        write!(f, "{name}")
    }
}

impl FromStr for AudioModulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(AudioModulation::Auto),
            "legacy" => Ok(AudioModulation::Legacy),
            "robust-v1" => Ok(AudioModulation::RobustV1),
            other => Err(format!("unknown audio modulation: {other}")),
        }
    }
}

/// Build the frame codec for a resolved (non-auto) modulation profile.
pub fn create_codec(
    modulation: AudioModulation,
    byte_repeat: usize,
    marker_run: usize,
) -> AudioFrameCodec {
    match modulation.effective() {
        AudioModulation::RobustV1 => {
            AudioFrameCodec::new(byte_repeat.max(5), (marker_run * 2).max(32))
        }
        _ => AudioFrameCodec::new(byte_repeat.max(1), marker_run.max(4)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modulation_parses_cli_spellings() {
        assert_eq!("auto".parse::<AudioModulation>(), Ok(AudioModulation::Auto));
        assert_eq!("legacy".parse::<AudioModulation>(), Ok(AudioModulation::Legacy));
        assert_eq!("robust-v1".parse::<AudioModulation>(), Ok(AudioModulation::RobustV1));
        assert!("warble".parse::<AudioModulation>().is_err());
    }

    #[test]
    fn auto_resolves_to_robust() {
        assert_eq!(AudioModulation::Auto.effective(), AudioModulation::RobustV1);
        assert_eq!(AudioModulation::Legacy.effective(), AudioModulation::Legacy);
    }

    #[test]
    fn profiles_interoperate_with_themselves() {
        for modulation in [AudioModulation::Legacy, AudioModulation::RobustV1] {
            let tx = create_codec(modulation, 3, 16);
            let mut rx = create_codec(modulation, 3, 16);
            let frame = b"profile check".to_vec();
            let pcm = tx.encode_frame(&frame);
            assert_eq!(rx.feed_pcm(&pcm), vec![frame.clone()]);
        }
    }
}
