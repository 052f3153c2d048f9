//! State snapshots and events emitted to subscribers
//!
//! The UI layer consumes these; the core never calls back into it directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account registration lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// No binding with the registrar
    #[default]
    Unregistered,
    /// Transport opened, registration in flight
    Registering,
    /// Binding active, calls possible
    Registered,
    /// Registration rejected or never established
    Failed,
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationStatus::Unregistered => write!(f, "unregistered"),
            RegistrationStatus::Registering => write!(f, "registering"),
            RegistrationStatus::Registered => write!(f, "registered"),
            RegistrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Call session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallStatus {
    /// No session
    #[default]
    Idle,
    /// Outgoing invite sent, no answer from the peer yet
    Connecting,
    /// Ringing locally (incoming) or at the peer (outgoing)
    Ringing,
    /// Connected with media flowing
    InCall,
    /// Held locally or by the peer
    OnHold,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Idle => write!(f, "idle"),
            CallStatus::Connecting => write!(f, "connecting"),
            CallStatus::Ringing => write!(f, "ringing"),
            CallStatus::InCall => write!(f, "in_call"),
            CallStatus::OnHold => write!(f, "on_hold"),
        }
    }
}

/// Who initiated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallDirection::Outgoing => write!(f, "outgoing"),
            CallDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Why an incoming session was refused at the door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefuseReason {
    /// Another session was already active
    Busy,
    /// Do-not-disturb policy was on
    DoNotDisturb,
}

/// Observable state of the active call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub call_id: Uuid,
    pub direction: CallDirection,
    pub remote_number: String,
    pub status: CallStatus,
    pub muted: bool,
    pub on_hold: bool,
    pub speaker_muted: bool,
    pub recording: bool,
}

/// Observable state of the whole core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneSnapshot {
    pub registration: RegistrationStatus,
    pub call: Option<CallSnapshot>,
    /// Cause string of the most recent transport/call error
    pub last_error: Option<String>,
}

impl PhoneSnapshot {
    pub fn is_registered(&self) -> bool {
        self.registration == RegistrationStatus::Registered
    }

    /// Status of the active call, `Idle` when there is none
    pub fn call_status(&self) -> CallStatus {
        self.call.as_ref().map(|c| c.status).unwrap_or_default()
    }

    pub fn is_in_call(&self) -> bool {
        self.call.is_some()
    }
}

/// Discrete lifecycle notifications
#[derive(Debug, Clone)]
pub enum PhoneEvent {
    /// Registration status changed
    RegistrationChanged(RegistrationStatus),
    /// Active call state changed (created, transitioned, or flags flipped)
    CallChanged(CallSnapshot),
    /// An incoming call started ringing
    IncomingCall { call_id: Uuid, remote_number: String },
    /// An incoming session was refused without ringing
    CallRefused {
        remote_number: String,
        reason: RefuseReason,
    },
    /// The active call ended; `cause` is set for failures
    CallEnded {
        call_id: Uuid,
        remote_number: String,
        cause: Option<String>,
    },
    /// A finalized recording artifact was persisted
    RecordingSaved { artifact_id: Uuid, call_id: Uuid },
    /// An operation failed; also mirrored in the snapshot's `last_error`
    Error(String),
}
