//! Media capture boundary and codec preference handling
//!
//! Local capture and remote playback are platform facilities the core drives
//! through traits. Tracks hand out their PCM frames once, to the recording
//! pipeline; mute and detach act directly on the underlying device.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::policy::{AudioConstraints, CallPolicy};
use crate::transport::SignalingSession;
use crate::PhoneResult;

/// One block of 16-bit PCM audio with its stream timestamp
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    /// Timestamp in sample units since stream start
    pub timestamp: u32,
}

/// Platform media device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire local audio capture.
    ///
    /// Permission denial or a missing device surfaces as
    /// [`PhoneError::Media`](crate::PhoneError::Media); the caller aborts the
    /// call attempt before any signaling becomes visible to the peer.
    async fn capture_audio(
        &self,
        constraints: &AudioConstraints,
    ) -> PhoneResult<std::sync::Arc<dyn LocalAudioTrack>>;
}

/// The locally captured outgoing audio track
pub trait LocalAudioTrack: Send + Sync {
    /// Enable or disable the track (mute affects only this direction)
    fn set_enabled(&self, enabled: bool);

    /// Stop capture and release the device
    fn stop(&self);

    /// Take the frame stream; `None` when already taken or unsupported
    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>>;
}

/// The remote incoming audio track attached to the playback sink
pub trait RemoteAudioTrack: Send + Sync {
    /// Mute or unmute playback (speaker mute)
    fn set_muted(&self, muted: bool);

    /// Detach from the playback sink
    fn detach(&self);

    /// Take the frame stream; `None` when already taken or unsupported
    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>>;
}

/// One audio codec in a capability list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    /// Codec identifier, matched case-insensitively against policy entries
    pub name: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl CodecInfo {
    pub fn new(name: impl Into<String>, clock_rate: u32, channels: u16) -> Self {
        Self {
            name: name.into(),
            clock_rate,
            channels,
        }
    }
}

/// Reorder a platform capability list by policy preference.
///
/// Preferred codecs come first in the policy's order; everything else follows
/// in its original order so negotiation can still fall back to codecs the
/// user did not rank.
pub fn reorder_codecs(available: Vec<CodecInfo>, preferred: &[String]) -> Vec<CodecInfo> {
    let mut ranked: Vec<(usize, CodecInfo)> = Vec::new();
    let mut rest: Vec<CodecInfo> = Vec::new();

    for codec in available {
        match preferred
            .iter()
            .position(|p| p.eq_ignore_ascii_case(&codec.name))
        {
            Some(rank) => ranked.push((rank, codec)),
            None => rest.push(codec),
        }
    }

    ranked.sort_by_key(|(rank, _)| *rank);

    let mut ordered: Vec<CodecInfo> = ranked.into_iter().map(|(_, codec)| codec).collect();
    ordered.extend(rest);
    ordered
}

/// Apply the policy's codec preferences to a session, best-effort.
///
/// Missing capabilities (negotiation not far enough, or no programmatic
/// facility) and application failures are logged and skipped; they are never
/// an error for the call.
pub(crate) fn apply_codec_preferences(session: &dyn SignalingSession, policy: &CallPolicy) {
    if policy.enabled_codecs.is_empty() {
        return;
    }

    let Some(available) = session.audio_codec_capabilities() else {
        tracing::debug!(
            session_id = %session.id(),
            "codec capabilities not available yet, skipping preference application"
        );
        return;
    };

    if available.is_empty() {
        tracing::debug!(session_id = %session.id(), "no audio media line yet, skipping");
        return;
    }

    let order = reorder_codecs(available, &policy.enabled_codecs);
    if let Err(e) = session.set_codec_preferences(order) {
        tracing::warn!(session_id = %session.id(), "failed to apply codec preferences: {e}");
    } else {
        tracing::debug!(session_id = %session.id(), "applied codec preferences");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Vec<CodecInfo> {
        vec![
            CodecInfo::new("PCMU", 8000, 1),
            CodecInfo::new("PCMA", 8000, 1),
            CodecInfo::new("opus", 48000, 2),
            CodecInfo::new("G722", 8000, 1),
            CodecInfo::new("CN", 8000, 1),
        ]
    }

    #[test]
    fn test_reorder_puts_preferred_first() {
        let preferred = vec!["opus".to_string(), "g722".to_string(), "pcmu".to_string()];
        let ordered = reorder_codecs(caps(), &preferred);

        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["opus", "G722", "PCMU", "PCMA", "CN"]);
    }

    #[test]
    fn test_reorder_keeps_unranked_for_interop() {
        let preferred = vec!["opus".to_string()];
        let ordered = reorder_codecs(caps(), &preferred);

        // Unranked codecs survive in their original order
        assert_eq!(ordered.len(), 5);
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["opus", "PCMU", "PCMA", "G722", "CN"]);
    }

    #[test]
    fn test_reorder_no_matches() {
        let preferred = vec!["g729".to_string()];
        let ordered = reorder_codecs(caps(), &preferred);
        assert_eq!(ordered, caps());
    }

    #[test]
    fn test_reorder_empty_capabilities() {
        let ordered = reorder_codecs(Vec::new(), &["opus".to_string()]);
        assert!(ordered.is_empty());
    }
}
