//! Call recording capture and finalization
//!
//! A recorder collects frames from both call legs while the call runs, then
//! finalizes the mix into a single WAV artifact. Persistence happens at the
//! store boundary and is always best-effort: a recording problem must never
//! fail the call it belongs to.

use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::media::AudioFrame;
use crate::mixer::{CallMixer, Leg};
use crate::{PhoneError, PhoneResult};

/// Sample rate recordings are mixed at when tracks do not say otherwise
pub const DEFAULT_RECORDING_SAMPLE_RATE: u32 = 8000;

/// One finalized call recording
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub id: Uuid,
    /// The call this recording was captured from
    pub call_id: Uuid,
    pub data: Bytes,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl RecordingArtifact {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Accumulates call audio and produces the final artifact
pub struct CallRecorder {
    call_id: Uuid,
    mixer: CallMixer,
}

impl CallRecorder {
    pub fn new(call_id: Uuid, sample_rate: u32) -> Self {
        Self {
            call_id,
            mixer: CallMixer::new(sample_rate),
        }
    }

    pub fn push_local(&mut self, frame: AudioFrame) {
        self.mixer.push(Leg::Local, frame);
    }

    pub fn push_remote(&mut self, frame: AudioFrame) {
        self.mixer.push(Leg::Remote, frame);
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Finalize whatever was captured into one WAV artifact.
    ///
    /// A recording that never saw audio still finalizes (header-only WAV);
    /// the call may have ended before any frame arrived.
    pub fn finalize(self) -> PhoneResult<RecordingArtifact> {
        let samples = self.mixer.mixed();
        if samples.is_empty() {
            tracing::debug!(call_id = %self.call_id, "finalizing recording with no captured audio");
        }

        let data = pcm_to_wav(&samples, self.mixer.sample_rate())?;

        Ok(RecordingArtifact {
            id: Uuid::new_v4(),
            call_id: self.call_id,
            data: Bytes::from(data),
            mime_type: "audio/wav".to_string(),
            created_at: Utc::now(),
        })
    }
}

/// Encode mono PCM samples as an in-memory WAV file
fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> PhoneResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| PhoneError::Recording(format!("failed to create WAV writer: {e}")))?;

    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| PhoneError::Recording(format!("failed to write sample: {e}")))?;
    }

    writer
        .finalize()
        .map_err(|e| PhoneError::Recording(format!("failed to finalize WAV: {e}")))?;

    Ok(cursor.into_inner())
}
