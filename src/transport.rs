//! Signaling transport boundary
//!
//! The core drives a SIP-over-WebSocket stack through these traits but never
//! implements the wire protocol itself. A transport instance is opened per
//! `connect()` and reports back through a plain event channel; the core tags
//! every received event with the generation the instance was opened under and
//! discards stale ones.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::account::Account;
use crate::media::{CodecInfo, LocalAudioTrack, RemoteAudioTrack};
use crate::policy::{CallPolicy, DtmfMethod};
use crate::PhoneResult;

/// Events raised by a transport instance
pub enum TransportEvent {
    /// Registrar accepted the binding
    Registered,
    /// Binding removed without error
    Unregistered,
    /// Registrar rejected the registration
    RegistrationFailed { cause: String },
    /// Socket closed; `cause` set when it was not caller-initiated
    Disconnected { cause: Option<String> },
    /// The peer opened a session toward us
    IncomingSession(Box<dyn SignalingSession>),
    /// Lifecycle event for a session created on this transport
    Session {
        session_id: Uuid,
        event: SessionEvent,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Registered => write!(f, "Registered"),
            TransportEvent::Unregistered => write!(f, "Unregistered"),
            TransportEvent::RegistrationFailed { cause } => {
                write!(f, "RegistrationFailed({cause})")
            }
            TransportEvent::Disconnected { cause } => write!(f, "Disconnected({cause:?})"),
            TransportEvent::IncomingSession(s) => {
                write!(f, "IncomingSession({})", s.remote_number())
            }
            TransportEvent::Session { session_id, event } => {
                write!(f, "Session({session_id}, {event:?})")
            }
        }
    }
}

/// Events raised for one signaling session
pub enum SessionEvent {
    /// Peer sent a ringing indication
    Progress,
    /// Call was accepted end-to-end
    Accepted,
    /// Remote media arrived
    RemoteTrack(Arc<dyn RemoteAudioTrack>),
    /// Peer put us on hold
    PeerHold,
    /// Peer resumed the call
    PeerUnhold,
    /// Media negotiation restarted; codec preferences may be re-applied
    NegotiationNeeded,
    /// Session terminated normally; `cause` describes a remote-initiated end
    Ended { cause: Option<String> },
    /// Session failed
    Failed { cause: String },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Progress => write!(f, "Progress"),
            SessionEvent::Accepted => write!(f, "Accepted"),
            SessionEvent::RemoteTrack(_) => write!(f, "RemoteTrack"),
            SessionEvent::PeerHold => write!(f, "PeerHold"),
            SessionEvent::PeerUnhold => write!(f, "PeerUnhold"),
            SessionEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            SessionEvent::Ended { cause } => write!(f, "Ended({cause:?})"),
            SessionEvent::Failed { cause } => write!(f, "Failed({cause})"),
        }
    }
}

/// Factory for transport instances, injected once per application session
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a transport for `account` and start registering.
    ///
    /// Must return quickly; connection progress and the registration outcome
    /// are reported through `events`. An immediate `Err` means no instance
    /// was created at all.
    async fn connect(
        &self,
        account: &Account,
        events: mpsc::Sender<TransportEvent>,
    ) -> PhoneResult<Box<dyn TransportHandle>>;
}

/// One live transport instance
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send an invite to `target`, attaching the already-acquired local track
    async fn invite(
        &self,
        target: &str,
        local: Arc<dyn LocalAudioTrack>,
        policy: &CallPolicy,
    ) -> PhoneResult<Box<dyn SignalingSession>>;

    /// Tear the instance down; no further events are expected after this
    async fn shutdown(&self);
}

/// One signaling session (a single call leg)
#[async_trait]
pub trait SignalingSession: Send + Sync {
    fn id(&self) -> Uuid;

    /// Remote party identifier (user part of the remote URI)
    fn remote_number(&self) -> String;

    /// Accept an incoming session, attaching the local track
    async fn accept(
        &self,
        local: Arc<dyn LocalAudioTrack>,
        policy: &CallPolicy,
    ) -> PhoneResult<()>;

    /// Decline an unanswered incoming session with a busy signal
    async fn decline_busy(&self) -> PhoneResult<()>;

    /// Terminate the session in any state
    async fn terminate(&self) -> PhoneResult<()>;

    async fn hold(&self) -> PhoneResult<()>;

    async fn unhold(&self) -> PhoneResult<()>;

    async fn send_dtmf(&self, tone: char, method: DtmfMethod) -> PhoneResult<()>;

    /// Audio codec capabilities, once the platform exposes them.
    ///
    /// `None` while negotiation has not progressed far enough, or when the
    /// platform has no programmatic codec facility at all.
    fn audio_codec_capabilities(&self) -> Option<Vec<CodecInfo>>;

    /// Apply a full, reordered capability list to the negotiation
    fn set_codec_preferences(&self, order: Vec<CodecInfo>) -> PhoneResult<()>;
}
