//! The owning task and its public handle
//!
//! All phone state lives inside one task spawned by [`Softphone::spawn`].
//! Commands, transport events, timer expiries and recorder completions all
//! arrive through a single inbox, so every mutation is serialized without
//! locks. Transport events are tagged with the generation their transport was
//! opened under; events from a superseded transport are dropped at the inbox.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::account::Account;
use crate::alerts::AlertSink;
use crate::events::{PhoneEvent, PhoneSnapshot};
use crate::media::MediaDevices;
use crate::policy::CallPolicy;
use crate::recorder::RecordingArtifact;
use crate::registration::RegistrationController;
use crate::session::CallSessionController;
use crate::store::RecordingStore;
use crate::transport::{SignalingTransport, TransportEvent};
use crate::{PhoneError, PhoneResult};

/// Inbox capacity for both the command and the notification channel
const CHANNEL_CAPACITY: usize = 100;

/// Everything that can arrive at the owning task
pub(crate) enum Event {
    Command(Command),
    /// An event from the transport opened under `generation`
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    /// The auto-answer timer for `session_id` expired
    AutoAnswerFired { session_id: Uuid },
    /// A recorder pump finished and produced its artifact
    RecordingFinalized { artifact: RecordingArtifact },
}

/// Caller requests
pub(crate) enum Command {
    Connect(Account),
    Disconnect,
    Call(String),
    Answer,
    Reject,
    Hangup,
    ToggleMute,
    ToggleSpeaker,
    ToggleHold,
    SendDtmf(char),
    StartRecording,
    StopRecording,
    SetPolicy(CallPolicy),
    Shutdown,
}

/// Collaborators injected into the core
pub struct SoftphoneDeps {
    pub transport: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaDevices>,
    pub store: Arc<dyn RecordingStore>,
    pub alerts: Arc<dyn AlertSink>,
}

/// Cloneable handle for driving the core and observing its state
#[derive(Clone)]
pub struct PhoneHandle {
    commands: mpsc::Sender<Event>,
    state: watch::Receiver<PhoneSnapshot>,
}

impl PhoneHandle {
    async fn send(&self, command: Command) -> PhoneResult<()> {
        self.commands
            .send(Event::Command(command))
            .await
            .map_err(|_| PhoneError::InvalidState("softphone core has stopped".into()))
    }

    /// Validate the account and start registering
    pub async fn connect(&self, account: Account) -> PhoneResult<()> {
        self.send(Command::Connect(account)).await
    }

    /// Tear down the active call (if any) and unregister
    pub async fn disconnect(&self) -> PhoneResult<()> {
        self.send(Command::Disconnect).await
    }

    /// Place an outgoing call
    pub async fn call(&self, number: impl Into<String>) -> PhoneResult<()> {
        self.send(Command::Call(number.into())).await
    }

    /// Answer the ringing incoming call
    pub async fn answer(&self) -> PhoneResult<()> {
        self.send(Command::Answer).await
    }

    /// Decline the ringing incoming call
    pub async fn reject(&self) -> PhoneResult<()> {
        self.send(Command::Reject).await
    }

    /// Terminate the active call
    pub async fn hangup(&self) -> PhoneResult<()> {
        self.send(Command::Hangup).await
    }

    pub async fn toggle_mute(&self) -> PhoneResult<()> {
        self.send(Command::ToggleMute).await
    }

    pub async fn toggle_speaker(&self) -> PhoneResult<()> {
        self.send(Command::ToggleSpeaker).await
    }

    pub async fn toggle_hold(&self) -> PhoneResult<()> {
        self.send(Command::ToggleHold).await
    }

    pub async fn send_dtmf(&self, tone: char) -> PhoneResult<()> {
        self.send(Command::SendDtmf(tone)).await
    }

    pub async fn start_recording(&self) -> PhoneResult<()> {
        self.send(Command::StartRecording).await
    }

    pub async fn stop_recording(&self) -> PhoneResult<()> {
        self.send(Command::StopRecording).await
    }

    /// Replace the policy used for subsequent operations; the active call
    /// keeps the snapshot it started with
    pub async fn set_policy(&self, policy: CallPolicy) -> PhoneResult<()> {
        self.send(Command::SetPolicy(policy)).await
    }

    /// Stop the owning task after tearing everything down
    pub async fn shutdown(&self) -> PhoneResult<()> {
        self.send(Command::Shutdown).await
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> PhoneSnapshot {
        self.state.borrow().clone()
    }

    /// Watch channel for state snapshots
    pub fn watch(&self) -> watch::Receiver<PhoneSnapshot> {
        self.state.clone()
    }
}

/// The call-control core
pub struct Softphone {
    registration: RegistrationController,
    session: CallSessionController,
    policy: CallPolicy,
    events: mpsc::Sender<PhoneEvent>,
    /// Weak: only `PhoneHandle`s hold the inbox open, so dropping the last
    /// one stops the task
    internal: mpsc::WeakSender<Event>,
    state: watch::Sender<PhoneSnapshot>,
    last_error: Option<String>,
}

impl Softphone {
    /// Spawn the owning task.
    ///
    /// Returns the handle for driving it and the receiver for discrete
    /// lifecycle notifications. The task stops when [`PhoneHandle::shutdown`]
    /// is called or every handle is dropped; both paths tear down the active
    /// call and the transport.
    pub fn spawn(deps: SoftphoneDeps, policy: CallPolicy) -> (PhoneHandle, mpsc::Receiver<PhoneEvent>) {
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(PhoneSnapshot::default());

        let phone = Softphone {
            registration: RegistrationController::new(deps.transport),
            session: CallSessionController::new(
                deps.media,
                deps.store,
                deps.alerts,
                events_tx.clone(),
                internal_tx.downgrade(),
            ),
            policy,
            events: events_tx,
            internal: internal_tx.downgrade(),
            state: state_tx,
            last_error: None,
        };

        tokio::spawn(phone.run(internal_rx));

        (
            PhoneHandle {
                commands: internal_tx,
                state: state_rx,
            },
            events_rx,
        )
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Event>) {
        tracing::info!("softphone core started");
        while let Some(event) = inbox.recv().await {
            match event {
                Event::Command(Command::Shutdown) => break,
                Event::Command(command) => self.handle_command(command).await,
                Event::Transport { generation, event } => {
                    if generation != self.registration.generation() {
                        tracing::debug!(
                            generation,
                            current = self.registration.generation(),
                            ?event,
                            "stale transport event dropped"
                        );
                        continue;
                    }
                    self.handle_transport_event(event).await;
                }
                Event::AutoAnswerFired { session_id } => {
                    let result = self.session.handle_auto_answer(session_id).await;
                    self.report(result).await;
                }
                Event::RecordingFinalized { artifact } => {
                    self.session.handle_recording_finalized(artifact).await;
                    self.publish();
                }
            }
        }
        // Reached via Shutdown or when the last handle was dropped
        self.shutdown().await;
        tracing::info!("softphone core stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(account) => self.connect(account).await,
            Command::Disconnect => {
                self.registration.invalidate();
                if self.session.has_session() {
                    self.session
                        .terminate_and_cleanup(Some("disconnected".into()))
                        .await;
                }
                self.registration.teardown().await;
                let _ = self
                    .events
                    .send(PhoneEvent::RegistrationChanged(self.registration.status()))
                    .await;
                self.publish();
            }
            Command::Call(number) => {
                let result = self.place_call(&number).await;
                self.report(result).await;
            }
            Command::Answer => {
                let result = self.session.answer().await;
                self.report(result).await;
            }
            Command::Reject => {
                let result = self.session.reject().await;
                self.report(result).await;
            }
            Command::Hangup => {
                let result = self.session.hangup().await;
                self.report(result).await;
            }
            Command::ToggleMute => {
                let result = self.session.toggle_mute().await;
                self.report(result).await;
            }
            Command::ToggleSpeaker => {
                let result = self.session.toggle_speaker().await;
                self.report(result).await;
            }
            Command::ToggleHold => {
                let result = self.session.toggle_hold().await;
                self.report(result).await;
            }
            Command::SendDtmf(tone) => {
                let result = self.session.send_dtmf(tone).await;
                self.report(result).await;
            }
            Command::StartRecording => {
                let result = self.session.start_recording().await;
                self.report(result).await;
            }
            Command::StopRecording => {
                let result = self.session.stop_recording().await;
                self.report(result).await;
            }
            Command::SetPolicy(policy) => {
                self.policy = policy;
            }
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self, account: Account) {
        let (transport_tx, mut transport_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let result = self.registration.connect(&account, transport_tx).await;

        if result.is_ok() {
            // Forward this transport's events into the inbox, tagged with the
            // generation it was opened under
            let generation = self.registration.generation();
            let internal = self.internal.clone();
            tokio::spawn(async move {
                while let Some(event) = transport_rx.recv().await {
                    let Some(inbox) = internal.upgrade() else {
                        break;
                    };
                    if inbox
                        .send(Event::Transport { generation, event })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let _ = self
            .events
            .send(PhoneEvent::RegistrationChanged(self.registration.status()))
            .await;
        self.report(result).await;
    }

    async fn place_call(&mut self, number: &str) -> PhoneResult<()> {
        if !self.registration.is_registered() {
            return Err(PhoneError::NotRegistered);
        }
        let handle = self
            .registration
            .handle()
            .ok_or_else(|| PhoneError::InvalidState("no transport open".into()))?;
        self.session
            .place_call(number, handle, self.policy.clone())
            .await
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingSession(session) => {
                let result = self.session.handle_incoming(session, self.policy.clone()).await;
                self.report(result).await;
            }
            TransportEvent::Session { session_id, event } => {
                let result = self.session.handle_session_event(session_id, event).await;
                self.report(result).await;
            }
            other => {
                // The transport is gone; nothing can be signaled anymore, so
                // the active call is released without a terminate
                if RegistrationController::event_kills_calls(&other) && self.session.has_session() {
                    self.session.cleanup(Some("connection lost".into())).await;
                }

                let changed = self.registration.handle_event(&other);
                if changed {
                    self.last_error = self.registration.cause().map(|s| s.to_string());
                    let _ = self
                        .events
                        .send(PhoneEvent::RegistrationChanged(self.registration.status()))
                        .await;
                }
                self.publish();
            }
        }
    }

    async fn shutdown(&mut self) {
        self.registration.invalidate();
        if self.session.has_session() {
            self.session
                .terminate_and_cleanup(Some("shutting down".into()))
                .await;
        }
        self.registration.teardown().await;
        self.publish();
    }

    /// Surface a command failure as an event and in the snapshot
    async fn report(&mut self, result: PhoneResult<()>) {
        if let Err(e) = result {
            let cause = e.cause();
            tracing::warn!("operation failed: {cause}");
            self.last_error = Some(cause.clone());
            let _ = self.events.send(PhoneEvent::Error(cause)).await;
        }
        self.publish();
    }

    fn publish(&self) {
        let _ = self.state.send(PhoneSnapshot {
            registration: self.registration.status(),
            call: self.session.snapshot(),
            last_error: self.last_error.clone(),
        });
    }
}
