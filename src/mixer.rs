//! Mixing of local and remote audio into one recording stream
//!
//! Frames from both call legs are aligned by stream timestamp and averaged
//! into mono PCM. Averaging keeps the result clip-safe for voice.

use std::collections::BTreeMap;

use crate::media::AudioFrame;

/// Which leg of the call a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Outgoing audio captured locally
    Local,
    /// Incoming audio from the peer
    Remote,
}

/// Accumulates frames from both legs and produces the mixed mono stream
pub struct CallMixer {
    sample_rate: u32,
    // Keyed by timestamp so the mix comes out in stream order even when
    // frames arrive interleaved or late
    frames: BTreeMap<u32, (Vec<i16>, Vec<i16>)>,
}

impl CallMixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames: BTreeMap::new(),
        }
    }

    /// Add one frame from the given leg
    pub fn push(&mut self, leg: Leg, frame: AudioFrame) {
        if frame.samples.is_empty() {
            return;
        }
        let entry = self
            .frames
            .entry(frame.timestamp)
            .or_insert_with(|| (Vec::new(), Vec::new()));
        match leg {
            Leg::Local => entry.0.extend_from_slice(&frame.samples),
            Leg::Remote => entry.1.extend_from_slice(&frame.samples),
        }
    }

    /// Mix everything accumulated so far into mono PCM.
    ///
    /// A missing side at any timestamp is treated as silence.
    pub fn mixed(&self) -> Vec<i16> {
        let mut mixed = Vec::new();

        for (local, remote) in self.frames.values() {
            let len = local.len().max(remote.len());
            for i in 0..len {
                let l = local.get(i).copied().unwrap_or(0) as i32;
                let r = remote.get(i).copied().unwrap_or(0) as i32;
                mixed.push(((l + r) / 2).clamp(-32768, 32767) as i16);
            }
        }

        mixed
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
