//! Call session lifecycle
//!
//! Owns the single active call: its state machine, media wiring, hold/mute/
//! DTMF actions, auto-answer policy and the recording hooks. At most one
//! non-terminal session exists at any instant; a second inbound attempt is
//! busy-declined at the door instead of queued.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alerts::{dtmf_feedback_tone, is_dtmf_digit, AlertSink};
use crate::events::{CallDirection, CallSnapshot, CallStatus, PhoneEvent, RefuseReason};
use crate::media::{apply_codec_preferences, AudioFrame, MediaDevices, LocalAudioTrack, RemoteAudioTrack};
use crate::policy::CallPolicy;
use crate::recorder::{CallRecorder, RecordingArtifact, DEFAULT_RECORDING_SAMPLE_RATE};
use crate::softphone::Event;
use crate::store::RecordingStore;
use crate::transport::{SessionEvent, SignalingSession, TransportHandle};
use crate::{PhoneError, PhoneResult};

/// The one live call
struct ActiveCall {
    id: Uuid,
    direction: CallDirection,
    remote_number: String,
    status: CallStatus,
    muted: bool,
    on_hold: bool,
    speaker_muted: bool,
    /// Set once accept was signaled (or the outbound leg was accepted)
    answered: bool,
    session: Box<dyn SignalingSession>,
    local: Option<Arc<dyn LocalAudioTrack>>,
    remote: Option<Arc<dyn RemoteAudioTrack>>,
    /// Policy snapshot taken when the session was created
    policy: CallPolicy,
    auto_answer: Option<CancellationToken>,
    recording: Option<CancellationToken>,
}

/// Controller for the single active call session
pub(crate) struct CallSessionController {
    media: Arc<dyn MediaDevices>,
    store: Arc<dyn RecordingStore>,
    alerts: Arc<dyn AlertSink>,
    events: mpsc::Sender<PhoneEvent>,
    /// Feeds timer and recorder completions back into the owning task; weak
    /// so helper tasks cannot keep the core alive after every handle is gone
    internal: mpsc::WeakSender<Event>,
    active: Option<ActiveCall>,
}

impl CallSessionController {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        store: Arc<dyn RecordingStore>,
        alerts: Arc<dyn AlertSink>,
        events: mpsc::Sender<PhoneEvent>,
        internal: mpsc::WeakSender<Event>,
    ) -> Self {
        Self {
            media,
            store,
            alerts,
            events,
            internal,
            active: None,
        }
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.active.as_ref().map(|call| CallSnapshot {
            call_id: call.id,
            direction: call.direction,
            remote_number: call.remote_number.clone(),
            status: call.status,
            muted: call.muted,
            on_hold: call.on_hold,
            speaker_muted: call.speaker_muted,
            recording: call.recording.is_some(),
        })
    }

    pub fn has_session(&self) -> bool {
        self.active.is_some()
    }

    /// Place an outgoing call.
    ///
    /// Local capture is acquired before the invite so a permission failure
    /// aborts the attempt with nothing visible to the peer.
    pub async fn place_call(
        &mut self,
        number: &str,
        handle: &dyn TransportHandle,
        policy: CallPolicy,
    ) -> PhoneResult<()> {
        if self.active.is_some() {
            return Err(PhoneError::InvalidState("already in a call".into()));
        }
        let number = number.trim();
        if number.is_empty() {
            return Err(PhoneError::Call("no number to dial".into()));
        }

        let local = self.media.capture_audio(&policy.audio_constraints).await?;

        let session = match handle.invite(number, local.clone(), &policy).await {
            Ok(session) => session,
            Err(e) => {
                local.stop();
                return Err(e);
            }
        };

        apply_codec_preferences(session.as_ref(), &policy);

        tracing::info!(call_id = %session.id(), %number, "outgoing call placed");
        self.active = Some(ActiveCall {
            id: session.id(),
            direction: CallDirection::Outgoing,
            remote_number: number.to_string(),
            status: CallStatus::Connecting,
            muted: false,
            on_hold: false,
            speaker_muted: false,
            answered: false,
            session,
            local: Some(local),
            remote: None,
            policy,
            auto_answer: None,
            recording: None,
        });
        self.emit_call_changed().await;
        Ok(())
    }

    /// Handle a session the peer opened toward us
    pub async fn handle_incoming(
        &mut self,
        session: Box<dyn SignalingSession>,
        policy: CallPolicy,
    ) -> PhoneResult<()> {
        let remote_number = session.remote_number();

        if self.active.is_some() {
            tracing::info!(%remote_number, "second inbound session, declining busy");
            if let Err(e) = session.decline_busy().await {
                tracing::warn!("busy decline failed: {e}");
            }
            let _ = self
                .events
                .send(PhoneEvent::CallRefused {
                    remote_number,
                    reason: RefuseReason::Busy,
                })
                .await;
            return Ok(());
        }

        if policy.do_not_disturb {
            tracing::info!(%remote_number, "do-not-disturb active, declining inbound session");
            if let Err(e) = session.decline_busy().await {
                tracing::warn!("DND decline failed: {e}");
            }
            let _ = self
                .events
                .send(PhoneEvent::CallRefused {
                    remote_number,
                    reason: RefuseReason::DoNotDisturb,
                })
                .await;
            return Ok(());
        }

        apply_codec_preferences(session.as_ref(), &policy);

        let call_id = session.id();
        tracing::info!(%call_id, %remote_number, "incoming call");

        let mut call = ActiveCall {
            id: call_id,
            direction: CallDirection::Incoming,
            remote_number: remote_number.clone(),
            status: CallStatus::Ringing,
            muted: false,
            on_hold: false,
            speaker_muted: false,
            answered: false,
            session,
            local: None,
            remote: None,
            policy,
            auto_answer: None,
            recording: None,
        };

        self.arm_auto_answer(&mut call);

        if call.policy.notifications {
            self.alerts.notify_incoming(&remote_number);
        }
        if call.policy.sound_events {
            self.alerts.ring_start();
        }

        self.active = Some(call);
        let _ = self
            .events
            .send(PhoneEvent::IncomingCall {
                call_id,
                remote_number,
            })
            .await;
        self.emit_call_changed().await;
        Ok(())
    }

    /// Answer the ringing incoming call
    pub async fn answer(&mut self) -> PhoneResult<()> {
        let policy = {
            let Some(call) = self.active.as_mut() else {
                return Err(PhoneError::InvalidState("no call to answer".into()));
            };
            if call.direction != CallDirection::Incoming
                || call.status != CallStatus::Ringing
                || call.answered
            {
                return Err(PhoneError::InvalidState(format!(
                    "cannot answer {} call in state {}",
                    call.direction, call.status
                )));
            }
            if let Some(token) = call.auto_answer.take() {
                token.cancel();
            }
            call.policy.clone()
        };

        let local = match self.media.capture_audio(&policy.audio_constraints).await {
            Ok(track) => track,
            Err(e) => {
                self.terminate_and_cleanup(Some(e.cause())).await;
                return Err(e);
            }
        };

        match self.active.as_mut() {
            Some(call) => call.local = Some(local.clone()),
            None => {
                local.stop();
                return Ok(());
            }
        }

        let accepted = match self.active.as_ref() {
            Some(call) => call.session.accept(local, &policy).await,
            None => return Ok(()),
        };

        match accepted {
            Ok(()) => {
                if let Some(call) = self.active.as_mut() {
                    call.answered = true;
                }
                self.alerts.ring_stop();
                tracing::info!("call answered");
                Ok(())
            }
            Err(e) => {
                self.terminate_and_cleanup(Some(e.cause())).await;
                Err(e)
            }
        }
    }

    /// Decline the ringing incoming call; local media is never touched
    pub async fn reject(&mut self) -> PhoneResult<()> {
        {
            let Some(call) = self.active.as_ref() else {
                return Err(PhoneError::InvalidState("no call to reject".into()));
            };
            if call.direction != CallDirection::Incoming || call.answered {
                return Err(PhoneError::InvalidState("call cannot be rejected".into()));
            }
            if let Err(e) = call.session.decline_busy().await {
                tracing::warn!("decline failed: {e}");
            }
        }
        self.cleanup(None).await;
        Ok(())
    }

    /// Terminate the active call in any state; no-op when idle
    pub async fn hangup(&mut self) -> PhoneResult<()> {
        if self.active.is_none() {
            tracing::debug!("hangup with no active call");
            return Ok(());
        }
        self.terminate_and_cleanup(None).await;
        Ok(())
    }

    pub async fn toggle_mute(&mut self) -> PhoneResult<()> {
        let muted = {
            let Some(call) = self.active.as_mut() else {
                tracing::debug!("mute toggle with no active call");
                return Ok(());
            };
            call.muted = !call.muted;
            if let Some(local) = call.local.as_ref() {
                local.set_enabled(!call.muted);
            }
            call.muted
        };
        tracing::debug!(muted, "microphone mute toggled");
        self.emit_call_changed().await;
        Ok(())
    }

    pub async fn toggle_speaker(&mut self) -> PhoneResult<()> {
        {
            let Some(call) = self.active.as_mut() else {
                tracing::debug!("speaker toggle with no active call");
                return Ok(());
            };
            call.speaker_muted = !call.speaker_muted;
            if let Some(remote) = call.remote.as_ref() {
                remote.set_muted(call.speaker_muted);
            }
        }
        self.emit_call_changed().await;
        Ok(())
    }

    /// Hold or resume; peer-initiated hold arrives as a session event instead
    pub async fn toggle_hold(&mut self) -> PhoneResult<()> {
        let status = match self.active.as_ref() {
            Some(call) => call.status,
            None => {
                tracing::debug!("hold toggle with no active call");
                return Ok(());
            }
        };

        match status {
            CallStatus::InCall => {
                if let Some(call) = self.active.as_ref() {
                    call.session.hold().await?;
                }
                if let Some(call) = self.active.as_mut() {
                    call.on_hold = true;
                    call.status = CallStatus::OnHold;
                }
            }
            CallStatus::OnHold => {
                if let Some(call) = self.active.as_ref() {
                    call.session.unhold().await?;
                }
                if let Some(call) = self.active.as_mut() {
                    call.on_hold = false;
                    call.status = CallStatus::InCall;
                }
            }
            other => {
                tracing::debug!(status = %other, "hold toggle ignored");
                return Ok(());
            }
        }
        self.emit_call_changed().await;
        Ok(())
    }

    /// Send a DTMF tone; no-op unless connected
    pub async fn send_dtmf(&mut self, tone: char) -> PhoneResult<()> {
        let (status, method, sound_events) = match self.active.as_ref() {
            Some(call) => (call.status, call.policy.dtmf_method, call.policy.sound_events),
            None => {
                tracing::debug!("DTMF with no active call");
                return Ok(());
            }
        };
        if status != CallStatus::InCall {
            tracing::debug!(status = %status, "DTMF ignored outside InCall");
            return Ok(());
        }
        if !is_dtmf_digit(tone) {
            return Err(PhoneError::InvalidState(format!("not a DTMF tone: {tone}")));
        }

        if let Some(call) = self.active.as_ref() {
            call.session.send_dtmf(tone, method).await?;
        }
        if sound_events {
            self.alerts
                .play_tone(&dtmf_feedback_tone(tone, DEFAULT_RECORDING_SAMPLE_RATE));
        }
        Ok(())
    }

    /// Start recording the active call; no-op when idle or already recording
    pub async fn start_recording(&mut self) -> PhoneResult<()> {
        let Some(call) = self.active.as_mut() else {
            tracing::debug!("start recording with no active call");
            return Ok(());
        };
        if call.recording.is_some() {
            tracing::debug!("recording already active");
            return Ok(());
        }

        let local_rx = call.local.as_ref().and_then(|t| t.take_frames());
        let remote_rx = call.remote.as_ref().and_then(|t| t.take_frames());
        if local_rx.is_none() && remote_rx.is_none() {
            // Recording is best-effort; a track without a frame stream just
            // means no recording for this call
            tracing::warn!(call_id = %call.id, "no audio frame streams, recording unavailable");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let recorder = CallRecorder::new(call.id, DEFAULT_RECORDING_SAMPLE_RATE);
        spawn_recorder_pump(
            recorder,
            local_rx,
            remote_rx,
            cancel.clone(),
            self.internal.clone(),
        );
        call.recording = Some(cancel);
        tracing::info!(call_id = %call.id, "recording started");
        self.emit_call_changed().await;
        Ok(())
    }

    /// Stop the active recording; the artifact arrives asynchronously
    pub async fn stop_recording(&mut self) -> PhoneResult<()> {
        let stopped = {
            let Some(call) = self.active.as_mut() else {
                tracing::debug!("stop recording with no active call");
                return Ok(());
            };
            match call.recording.take() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            }
        };
        if stopped {
            tracing::info!("recording stopped");
            self.emit_call_changed().await;
        }
        Ok(())
    }

    /// Apply one (already generation-checked) event for a session
    pub async fn handle_session_event(
        &mut self,
        session_id: Uuid,
        event: SessionEvent,
    ) -> PhoneResult<()> {
        let is_active = self
            .active
            .as_ref()
            .map(|c| c.id == session_id)
            .unwrap_or(false);
        if !is_active {
            tracing::trace!(%session_id, ?event, "event for inactive session dropped");
            return Ok(());
        }

        match event {
            SessionEvent::Progress => {
                if let Some(call) = self.active.as_mut() {
                    if call.status == CallStatus::Connecting {
                        call.status = CallStatus::Ringing;
                    }
                }
                self.emit_call_changed().await;
                Ok(())
            }
            SessionEvent::Accepted => {
                let should_record = {
                    let Some(call) = self.active.as_mut() else {
                        return Ok(());
                    };
                    call.status = CallStatus::InCall;
                    call.answered = true;
                    call.policy.call_recording && call.recording.is_none()
                };
                self.alerts.ring_stop();
                self.emit_call_changed().await;
                if should_record {
                    self.start_recording().await?;
                }
                Ok(())
            }
            SessionEvent::RemoteTrack(track) => {
                if let Some(call) = self.active.as_mut() {
                    track.set_muted(call.speaker_muted);
                    call.remote = Some(track);
                }
                Ok(())
            }
            SessionEvent::PeerHold => {
                if let Some(call) = self.active.as_mut() {
                    call.on_hold = true;
                    call.status = CallStatus::OnHold;
                }
                tracing::info!("peer put the call on hold");
                self.emit_call_changed().await;
                Ok(())
            }
            SessionEvent::PeerUnhold => {
                if let Some(call) = self.active.as_mut() {
                    call.on_hold = false;
                    call.status = CallStatus::InCall;
                }
                tracing::info!("peer resumed the call");
                self.emit_call_changed().await;
                Ok(())
            }
            SessionEvent::NegotiationNeeded => {
                if let Some(call) = self.active.as_ref() {
                    apply_codec_preferences(call.session.as_ref(), &call.policy);
                }
                Ok(())
            }
            SessionEvent::Ended { cause } => {
                self.cleanup(cause).await;
                Ok(())
            }
            SessionEvent::Failed { cause } => {
                self.cleanup(Some(cause.clone())).await;
                Err(PhoneError::Call(cause))
            }
        }
    }

    /// Auto-answer timer expiry; takes the same path as a manual answer
    pub async fn handle_auto_answer(&mut self, session_id: Uuid) -> PhoneResult<()> {
        let eligible = self
            .active
            .as_ref()
            .map(|c| {
                c.id == session_id
                    && c.direction == CallDirection::Incoming
                    && c.status == CallStatus::Ringing
                    && !c.answered
            })
            .unwrap_or(false);
        if !eligible {
            tracing::debug!(%session_id, "auto-answer timer fired for a settled call");
            return Ok(());
        }
        tracing::info!(%session_id, "auto-answering incoming call");
        self.answer().await
    }

    /// A recorder finished; persist the artifact, swallowing any failure
    pub async fn handle_recording_finalized(&mut self, artifact: RecordingArtifact) {
        let artifact_id = artifact.id;
        let call_id = artifact.call_id;
        match self.store.put(&artifact).await {
            Ok(()) => {
                tracing::info!(%artifact_id, %call_id, size = artifact.size(), "recording persisted");
                let _ = self
                    .events
                    .send(PhoneEvent::RecordingSaved {
                        artifact_id,
                        call_id,
                    })
                    .await;
            }
            Err(e) => {
                tracing::warn!(%artifact_id, %call_id, "failed to persist recording: {e}");
            }
        }
    }

    /// Terminate signaling, then run the shared cleanup
    pub async fn terminate_and_cleanup(&mut self, cause: Option<String>) {
        if let Some(call) = self.active.as_ref() {
            if let Err(e) = call.session.terminate().await {
                tracing::warn!("terminate failed: {e}");
            }
        }
        self.cleanup(cause).await;
    }

    /// Release everything the call held. Idempotent: racing triggers find the
    /// session already taken and return without effect.
    pub async fn cleanup(&mut self, cause: Option<String>) {
        let Some(mut call) = self.active.take() else {
            return;
        };

        if let Some(token) = call.auto_answer.take() {
            token.cancel();
        }
        if let Some(token) = call.recording.take() {
            token.cancel();
        }
        if let Some(local) = call.local.take() {
            local.stop();
        }
        if let Some(remote) = call.remote.take() {
            remote.detach();
        }
        self.alerts.ring_stop();

        tracing::info!(call_id = %call.id, ?cause, "call session cleaned up");
        let _ = self
            .events
            .send(PhoneEvent::CallEnded {
                call_id: call.id,
                remote_number: call.remote_number,
                cause,
            })
            .await;
    }

    fn arm_auto_answer(&self, call: &mut ActiveCall) {
        let Some(delay) = call.policy.auto_answer.delay() else {
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let session_id = call.id;
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(internal) = internal.upgrade() {
                        let _ = internal.send(Event::AutoAnswerFired { session_id }).await;
                    }
                }
            }
        });
        call.auto_answer = Some(token);
        tracing::debug!(%session_id, ?delay, "auto-answer timer armed");
    }

    async fn emit_call_changed(&self) {
        if let Some(snapshot) = self.snapshot() {
            let _ = self.events.send(PhoneEvent::CallChanged(snapshot)).await;
        }
    }
}

/// Pump track frames into a recorder until cancelled, then finalize
fn spawn_recorder_pump(
    mut recorder: CallRecorder,
    mut local_rx: Option<mpsc::Receiver<AudioFrame>>,
    mut remote_rx: Option<mpsc::Receiver<AudioFrame>>,
    cancel: CancellationToken,
    internal: mpsc::WeakSender<Event>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = recv_opt(&mut local_rx) => match frame {
                    Some(frame) => recorder.push_local(frame),
                    None => local_rx = None,
                },
                frame = recv_opt(&mut remote_rx) => match frame {
                    Some(frame) => recorder.push_remote(frame),
                    None => remote_rx = None,
                },
            }
        }

        // Drain anything delivered before the stop landed
        if let Some(rx) = local_rx.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                recorder.push_local(frame);
            }
        }
        if let Some(rx) = remote_rx.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                recorder.push_remote(frame);
            }
        }

        let call_id = recorder.call_id();
        match recorder.finalize() {
            Ok(artifact) => match internal.upgrade() {
                Some(internal) => {
                    let _ = internal.send(Event::RecordingFinalized { artifact }).await;
                }
                None => {
                    tracing::debug!(%call_id, "core stopped before the recording could be handed off");
                }
            },
            Err(e) => tracing::warn!(%call_id, "recording finalize failed: {e}"),
        }
    });
}

/// Receive from an optional channel; a missing channel never yields
async fn recv_opt(rx: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
