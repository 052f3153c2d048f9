//! Softphone call-control core
//!
//! The orchestration layer of a SIP/WebRTC softphone, sitting above an
//! injected signaling/media transport:
//! - SIP account registration lifecycle with generation-tagged invalidation
//! - Single-active-call session state machine (dial, answer, reject, hangup,
//!   mute, hold, DTMF)
//! - Auto-answer and do-not-disturb policy
//! - Codec preference application during negotiation
//! - Bidirectional call recording (mix, WAV encode, persist)
//!
//! The wire protocol, the UI and durable storage are collaborators reached
//! through the traits in [`transport`], [`media`], [`store`] and [`alerts`].
//! All state lives in a single owning task created by [`Softphone::spawn`];
//! callers drive it through a [`PhoneHandle`] and observe it through
//! [`PhoneSnapshot`] / [`PhoneEvent`].

mod account;
mod alerts;
mod events;
mod media;
mod mixer;
mod policy;
mod recorder;
mod registration;
mod session;
mod softphone;
mod store;
mod transport;

#[cfg(test)]
mod call_flow_tests;

pub use account::Account;
pub use alerts::{dtmf_feedback_tone, AlertSink, NullAlerts};
pub use events::{
    CallDirection, CallSnapshot, CallStatus, PhoneEvent, PhoneSnapshot, RefuseReason,
    RegistrationStatus,
};
pub use media::{
    reorder_codecs, AudioFrame, CodecInfo, LocalAudioTrack, MediaDevices, RemoteAudioTrack,
};
pub use mixer::{CallMixer, Leg};
pub use policy::{AudioConstraints, AutoAnswer, CallPolicy, DtmfMethod, IceServer};
pub use recorder::{CallRecorder, RecordingArtifact};
pub use registration::RegistrationController;
pub use softphone::{PhoneHandle, Softphone, SoftphoneDeps};
pub use store::{FileRecordingStore, MemoryRecordingStore, RecordingStore};
pub use transport::{
    SessionEvent, SignalingSession, SignalingTransport, TransportEvent, TransportHandle,
};

use thiserror::Error;

/// Errors surfaced by the call-control core
#[derive(Error, Debug)]
pub enum PhoneError {
    /// Invalid or missing account fields; rejected before any network effect
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket or registration failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Busy, rejected or remote failure; terminates the session
    #[error("Call failed: {0}")]
    Call(String),

    /// Capture permission denied or device unavailable
    #[error("Media error: {0}")]
    Media(String),

    /// Encode or persistence failure; never fails the call
    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not registered")]
    NotRegistered,
}

impl PhoneError {
    /// Human-readable cause string for the UI status field
    pub fn cause(&self) -> String {
        self.to_string()
    }
}

/// Result type for core operations
pub type PhoneResult<T> = Result<T, PhoneError>;
