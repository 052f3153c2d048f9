//! Account registration lifecycle
//!
//! Owns the binding with the registrar and the generation counter that
//! invalidates callbacks from superseded transport instances. A transport
//! drop before the first successful registration lands in `Failed` so bad
//! configuration cannot trigger a reconnect storm; a drop after a successful
//! registration lands in `Unregistered` so the caller can retry a transient
//! network blip.

use tokio::sync::mpsc;

use crate::account::Account;
use crate::events::RegistrationStatus;
use crate::transport::{SignalingTransport, TransportEvent, TransportHandle};
use crate::PhoneResult;

use std::sync::Arc;

/// Pure transition outcome for one transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub status: RegistrationStatus,
    pub cause: Option<String>,
    pub now_registered: bool,
}

/// Apply one transport event to the registration state machine.
///
/// Independent of any transport so the table can be tested directly.
pub(crate) fn transition(
    status: RegistrationStatus,
    was_registered: bool,
    event: &TransportEvent,
) -> Option<Transition> {
    match event {
        TransportEvent::Registered => Some(Transition {
            status: RegistrationStatus::Registered,
            cause: None,
            now_registered: true,
        }),
        TransportEvent::Unregistered => Some(Transition {
            status: RegistrationStatus::Unregistered,
            cause: None,
            now_registered: was_registered,
        }),
        TransportEvent::RegistrationFailed { cause } => Some(Transition {
            status: RegistrationStatus::Failed,
            cause: Some(cause.clone()),
            now_registered: was_registered,
        }),
        TransportEvent::Disconnected { cause } => {
            if was_registered {
                Some(Transition {
                    status: RegistrationStatus::Unregistered,
                    cause: cause.clone(),
                    now_registered: was_registered,
                })
            } else {
                Some(Transition {
                    status: RegistrationStatus::Failed,
                    cause: Some(cause.clone().unwrap_or_else(|| {
                        "connection failed - check server address and port".to_string()
                    })),
                    now_registered: was_registered,
                })
            }
        }
        // Session traffic does not touch registration state
        TransportEvent::IncomingSession(_) | TransportEvent::Session { .. } => {
            let _ = status;
            None
        }
    }
}

/// Owns the transport handle and registration state
pub struct RegistrationController {
    transport: Arc<dyn SignalingTransport>,
    handle: Option<Box<dyn TransportHandle>>,
    status: RegistrationStatus,
    generation: u64,
    /// Latched per transport instance; decides Failed vs Unregistered on drop
    was_registered: bool,
    cause: Option<String>,
}

impl RegistrationController {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            handle: None,
            status: RegistrationStatus::Unregistered,
            generation: 0,
            was_registered: false,
            cause: None,
        }
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.status == RegistrationStatus::Registered
    }

    /// The live transport handle, if a transport is open
    pub fn handle(&self) -> Option<&dyn TransportHandle> {
        self.handle.as_deref()
    }

    /// Validate the account and open a fresh transport.
    ///
    /// A validation failure changes nothing and creates no transport. Any
    /// existing transport is torn down and superseded by bumping the
    /// generation before the new one opens.
    pub async fn connect(
        &mut self,
        account: &Account,
        events: mpsc::Sender<TransportEvent>,
    ) -> PhoneResult<()> {
        account.validate()?;

        if let Some(old) = self.handle.take() {
            old.shutdown().await;
        }
        self.generation += 1;
        self.was_registered = false;
        self.cause = None;

        tracing::info!(
            generation = self.generation,
            uri = %account.uri(),
            "opening transport"
        );

        match self.transport.connect(account, events).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.status = RegistrationStatus::Registering;
                Ok(())
            }
            Err(e) => {
                self.status = RegistrationStatus::Failed;
                self.cause = Some(e.cause());
                Err(e)
            }
        }
    }

    /// Supersede in-flight callbacks from the current transport.
    ///
    /// Called first on disconnect, before the active call is torn down, so a
    /// racing transport event cannot resurrect state mid-teardown.
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    /// Tear down the transport and return to `Unregistered`
    pub async fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
        self.status = RegistrationStatus::Unregistered;
        self.was_registered = false;
        self.cause = None;
        tracing::info!(generation = self.generation, "transport torn down");
    }

    /// Apply one (already generation-checked) transport event.
    ///
    /// Returns `true` when the status changed.
    pub fn handle_event(&mut self, event: &TransportEvent) -> bool {
        let Some(next) = transition(self.status, self.was_registered, event) else {
            return false;
        };

        let changed = next.status != self.status;
        if changed {
            tracing::info!(from = %self.status, to = %next.status, "registration transition");
        }
        self.status = next.status;
        self.was_registered = next.now_registered;
        self.cause = next.cause;
        changed
    }

    /// True when the transport can no longer sustain signaling for a call
    pub fn event_kills_calls(event: &TransportEvent) -> bool {
        matches!(event, TransportEvent::Disconnected { .. })
    }
}
