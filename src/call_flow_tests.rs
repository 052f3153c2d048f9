//! End-to-end call flow tests against mock transport, media and alert sinks

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{
    Account, AlertSink, AudioConstraints, AudioFrame, AutoAnswer, CallDirection, CallPolicy,
    CallStatus, CodecInfo, DtmfMethod, LocalAudioTrack, MediaDevices, MemoryRecordingStore,
    PhoneError, PhoneEvent, PhoneHandle, PhoneResult, PhoneSnapshot, RecordingStore, RefuseReason,
    RegistrationStatus, RemoteAudioTrack, SessionEvent, SignalingSession, SignalingTransport,
    Softphone, SoftphoneDeps, TransportEvent, TransportHandle,
};

// ---------------------------------------------------------------------------
// Mocks

#[derive(Default)]
struct TransportProbe {
    fail_connect: AtomicBool,
    senders: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    shutdowns: AtomicUsize,
    sessions: Mutex<Vec<Arc<SessionProbe>>>,
    /// Capability list copied onto every session this transport creates
    session_caps: Mutex<Option<Vec<CodecInfo>>>,
}

struct MockTransport {
    probe: Arc<TransportProbe>,
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn connect(
        &self,
        _account: &Account,
        events: mpsc::Sender<TransportEvent>,
    ) -> PhoneResult<Box<dyn TransportHandle>> {
        if self.probe.fail_connect.load(Ordering::SeqCst) {
            return Err(PhoneError::Transport("connect refused".into()));
        }
        self.probe.senders.lock().unwrap().push(events);
        Ok(Box::new(MockHandle {
            probe: self.probe.clone(),
        }))
    }
}

struct MockHandle {
    probe: Arc<TransportProbe>,
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn invite(
        &self,
        target: &str,
        _local: Arc<dyn LocalAudioTrack>,
        _policy: &CallPolicy,
    ) -> PhoneResult<Box<dyn SignalingSession>> {
        let probe = Arc::new(SessionProbe::new(target));
        *probe.caps.lock().unwrap() = self.probe.session_caps.lock().unwrap().clone();
        self.probe.sessions.lock().unwrap().push(probe.clone());
        Ok(Box::new(MockSession { probe }))
    }

    async fn shutdown(&self) {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct SessionProbe {
    id: Uuid,
    remote_number: String,
    actions: Mutex<Vec<String>>,
    caps: Mutex<Option<Vec<CodecInfo>>>,
    applied_orders: Mutex<Vec<Vec<String>>>,
}

impl SessionProbe {
    fn new(remote_number: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_number: remote_number.to_string(),
            actions: Mutex::new(Vec::new()),
            caps: Mutex::new(None),
            applied_orders: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, action: impl Into<String>) {
        self.actions.lock().unwrap().push(action.into());
    }

    fn count(&self, action: &str) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.as_str() == action)
            .count()
    }

    fn has(&self, action: &str) -> bool {
        self.count(action) > 0
    }
}

struct MockSession {
    probe: Arc<SessionProbe>,
}

#[async_trait]
impl SignalingSession for MockSession {
    fn id(&self) -> Uuid {
        self.probe.id
    }

    fn remote_number(&self) -> String {
        self.probe.remote_number.clone()
    }

    async fn accept(
        &self,
        _local: Arc<dyn LocalAudioTrack>,
        _policy: &CallPolicy,
    ) -> PhoneResult<()> {
        self.probe.record("accept");
        Ok(())
    }

    async fn decline_busy(&self) -> PhoneResult<()> {
        self.probe.record("decline_busy");
        Ok(())
    }

    async fn terminate(&self) -> PhoneResult<()> {
        self.probe.record("terminate");
        Ok(())
    }

    async fn hold(&self) -> PhoneResult<()> {
        self.probe.record("hold");
        Ok(())
    }

    async fn unhold(&self) -> PhoneResult<()> {
        self.probe.record("unhold");
        Ok(())
    }

    async fn send_dtmf(&self, tone: char, method: DtmfMethod) -> PhoneResult<()> {
        self.probe.record(format!("dtmf:{tone}:{method}"));
        Ok(())
    }

    fn audio_codec_capabilities(&self) -> Option<Vec<CodecInfo>> {
        self.probe.caps.lock().unwrap().clone()
    }

    fn set_codec_preferences(&self, order: Vec<CodecInfo>) -> PhoneResult<()> {
        self.probe
            .applied_orders
            .lock()
            .unwrap()
            .push(order.into_iter().map(|c| c.name).collect());
        Ok(())
    }
}

#[derive(Default)]
struct MediaProbe {
    fail: AtomicBool,
    captures: AtomicUsize,
    stops: AtomicUsize,
    enabled: Mutex<Vec<bool>>,
    frame_txs: Mutex<Vec<mpsc::Sender<AudioFrame>>>,
}

struct MockMedia {
    probe: Arc<MediaProbe>,
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn capture_audio(
        &self,
        _constraints: &AudioConstraints,
    ) -> PhoneResult<Arc<dyn LocalAudioTrack>> {
        if self.probe.fail.load(Ordering::SeqCst) {
            return Err(PhoneError::Media("Permission denied".into()));
        }
        self.probe.captures.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.probe.frame_txs.lock().unwrap().push(tx);
        Ok(Arc::new(MockLocalTrack {
            probe: self.probe.clone(),
            frames: Mutex::new(Some(rx)),
        }))
    }
}

struct MockLocalTrack {
    probe: Arc<MediaProbe>,
    frames: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
}

impl LocalAudioTrack for MockLocalTrack {
    fn set_enabled(&self, enabled: bool) {
        self.probe.enabled.lock().unwrap().push(enabled);
    }

    fn stop(&self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.lock().unwrap().take()
    }
}

struct MockRemoteTrack {
    muted: Mutex<Vec<bool>>,
    detached: AtomicUsize,
    frames: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
}

fn remote_track() -> (Arc<MockRemoteTrack>, mpsc::Sender<AudioFrame>) {
    let (tx, rx) = mpsc::channel(64);
    (
        Arc::new(MockRemoteTrack {
            muted: Mutex::new(Vec::new()),
            detached: AtomicUsize::new(0),
            frames: Mutex::new(Some(rx)),
        }),
        tx,
    )
}

impl RemoteAudioTrack for MockRemoteTrack {
    fn set_muted(&self, muted: bool) {
        self.muted.lock().unwrap().push(muted);
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }

    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.lock().unwrap().take()
    }
}

#[derive(Default)]
struct AlertProbe {
    ring_starts: AtomicUsize,
    ring_stops: AtomicUsize,
    notifies: Mutex<Vec<String>>,
    tones: AtomicUsize,
}

impl AlertSink for AlertProbe {
    fn ring_start(&self) {
        self.ring_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn ring_stop(&self) {
        self.ring_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_incoming(&self, remote_number: &str) {
        self.notifies.lock().unwrap().push(remote_number.to_string());
    }

    fn play_tone(&self, _samples: &[i16]) {
        self.tones.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    handle: PhoneHandle,
    events: mpsc::Receiver<PhoneEvent>,
    state: watch::Receiver<PhoneSnapshot>,
    transport: Arc<TransportProbe>,
    media: Arc<MediaProbe>,
    alerts: Arc<AlertProbe>,
    store: Arc<MemoryRecordingStore>,
}

impl Harness {
    fn spawn(policy: CallPolicy) -> Self {
        let transport = Arc::new(TransportProbe::default());
        let media = Arc::new(MediaProbe::default());
        let alerts = Arc::new(AlertProbe::default());
        let store = Arc::new(MemoryRecordingStore::new());

        let (handle, events) = Softphone::spawn(
            SoftphoneDeps {
                transport: Arc::new(MockTransport {
                    probe: transport.clone(),
                }),
                media: Arc::new(MockMedia {
                    probe: media.clone(),
                }),
                store: store.clone(),
                alerts: alerts.clone(),
            },
            policy,
        );
        let state = handle.watch();

        Self {
            handle,
            events,
            state,
            transport,
            media,
            alerts,
            store,
        }
    }

    async fn register(&mut self) {
        self.handle.connect(account()).await.unwrap();
        self.wait(|s| s.registration == RegistrationStatus::Registering)
            .await;
        self.sender().send(TransportEvent::Registered).await.unwrap();
        self.wait(|s| s.is_registered()).await;
    }

    /// Event sender of the most recently opened transport
    fn sender(&self) -> mpsc::Sender<TransportEvent> {
        self.transport
            .senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport connected")
    }

    /// Probe of the most recently created outbound session
    fn session(&self) -> Arc<SessionProbe> {
        self.transport
            .sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no outbound session")
    }

    async fn push_incoming(&self, number: &str) -> Arc<SessionProbe> {
        let probe = Arc::new(SessionProbe::new(number));
        self.sender()
            .send(TransportEvent::IncomingSession(Box::new(MockSession {
                probe: probe.clone(),
            })))
            .await
            .unwrap();
        probe
    }

    async fn send_session(&self, session_id: Uuid, event: SessionEvent) {
        self.sender()
            .send(TransportEvent::Session { session_id, event })
            .await
            .unwrap();
    }

    async fn wait(&mut self, pred: impl FnMut(&PhoneSnapshot) -> bool) -> PhoneSnapshot {
        tokio::time::timeout(Duration::from_secs(5), self.state.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed")
            .clone()
    }

    async fn expect_event(&mut self, pred: impl Fn(&PhoneEvent) -> bool) -> PhoneEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Drain already-delivered events
    fn drain_events(&mut self) -> Vec<PhoneEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Establish an outbound call up to `InCall`
    async fn dial(&mut self, number: &str) -> Arc<SessionProbe> {
        self.handle.call(number).await.unwrap();
        self.wait(|s| s.call_status() == CallStatus::Connecting).await;
        let session = self.session();
        self.send_session(session.id, SessionEvent::Accepted).await;
        self.wait(|s| s.call_status() == CallStatus::InCall).await;
        session
    }
}

fn account() -> Account {
    Account {
        server: "wss://sip.example.com:7443".into(),
        domain: String::new(),
        username: "alice".into(),
        password: "secret".into(),
        display_name: "Alice".into(),
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn wait_until(mut pred: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Registration

#[tokio::test]
async fn test_invalid_account_creates_no_transport() {
    let mut h = Harness::spawn(CallPolicy::default());

    let mut bad = account();
    bad.password.clear();
    h.handle.connect(bad).await.unwrap();

    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("Configuration")))
        .await;
    assert_eq!(
        h.handle.snapshot().registration,
        RegistrationStatus::Unregistered
    );
    assert!(h.transport.senders.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_register_and_disconnect() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    h.handle.disconnect().await.unwrap();
    h.wait(|s| s.registration == RegistrationStatus::Unregistered)
        .await;
    assert_eq!(h.transport.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_every_handle_tears_the_core_down() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;
    let transport = h.transport.clone();
    let media = h.media.clone();

    // Only handles hold the core's inbox open
    drop(h);

    wait_until(|| transport.shutdowns.load(Ordering::SeqCst) == 1).await;
    assert!(session.has("terminate"));
    assert_eq!(media.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transport_refusal_parks_failed() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.transport.fail_connect.store(true, Ordering::SeqCst);

    h.handle.connect(account()).await.unwrap();
    let snapshot = h
        .wait(|s| s.registration == RegistrationStatus::Failed)
        .await;
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn test_drop_before_registration_parks_failed() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.handle.connect(account()).await.unwrap();
    h.wait(|s| s.registration == RegistrationStatus::Registering)
        .await;

    // Socket died before the registrar ever accepted us
    h.sender()
        .send(TransportEvent::Disconnected { cause: None })
        .await
        .unwrap();

    let snapshot = h
        .wait(|s| s.registration == RegistrationStatus::Failed)
        .await;
    assert!(snapshot.last_error.unwrap().contains("check server"));
}

#[tokio::test]
async fn test_drop_after_registration_unregisters_and_ends_call() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.dial("200").await;

    h.sender()
        .send(TransportEvent::Disconnected {
            cause: Some("socket closed".into()),
        })
        .await
        .unwrap();

    let snapshot = h
        .wait(|s| s.registration == RegistrationStatus::Unregistered && s.call.is_none())
        .await;
    assert_eq!(snapshot.last_error.as_deref(), Some("socket closed"));
    h.expect_event(|e| matches!(e, PhoneEvent::CallEnded { .. })).await;
    assert!(h.media.stops.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_stale_transport_events_ignored() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    // Reconnect supersedes the first transport
    h.handle.connect(account()).await.unwrap();
    h.wait(|s| s.registration == RegistrationStatus::Registering)
        .await;
    assert_eq!(h.transport.senders.lock().unwrap().len(), 2);

    let old = h.transport.senders.lock().unwrap()[0].clone();
    old.send(TransportEvent::RegistrationFailed {
        cause: "stale".into(),
    })
    .await
    .unwrap();

    h.sender().send(TransportEvent::Registered).await.unwrap();
    h.wait(|s| s.is_registered()).await;
    settle().await;
    assert!(h.handle.snapshot().is_registered());
    assert!(h.handle.snapshot().last_error.is_none());
}

// ---------------------------------------------------------------------------
// Outbound calls

#[tokio::test]
async fn test_outbound_call_flow() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    h.handle.call("100").await.unwrap();
    let snapshot = h.wait(|s| s.call_status() == CallStatus::Connecting).await;
    let call = snapshot.call.unwrap();
    assert_eq!(call.direction, CallDirection::Outgoing);
    assert_eq!(call.remote_number, "100");
    assert_eq!(h.media.captures.load(Ordering::SeqCst), 1);

    let session = h.session();
    h.send_session(session.id, SessionEvent::Progress).await;
    h.wait(|s| s.call_status() == CallStatus::Ringing).await;

    h.send_session(session.id, SessionEvent::Accepted).await;
    h.wait(|s| s.call_status() == CallStatus::InCall).await;

    h.handle.hangup().await.unwrap();
    h.wait(|s| s.call.is_none()).await;
    assert!(session.has("terminate"));
    assert_eq!(h.media.stops.load(Ordering::SeqCst), 1);
    h.expect_event(|e| matches!(e, PhoneEvent::CallEnded { cause: None, .. }))
        .await;
}

#[tokio::test]
async fn test_call_requires_registration() {
    let mut h = Harness::spawn(CallPolicy::default());

    h.handle.call("100").await.unwrap();
    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("Not registered")))
        .await;
    assert!(h.handle.snapshot().call.is_none());
}

#[tokio::test]
async fn test_capture_failure_aborts_before_invite() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.media.fail.store(true, Ordering::SeqCst);

    h.handle.call("100").await.unwrap();
    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("Media")))
        .await;

    // Nothing ever reached the wire
    assert!(h.transport.sessions.lock().unwrap().is_empty());
    assert!(h.handle.snapshot().call.is_none());
}

#[tokio::test]
async fn test_busy_rejects_second_call_attempt() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.dial("100").await;

    h.handle.call("200").await.unwrap();
    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("already in a call")))
        .await;

    // The first call is untouched
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.call.unwrap().remote_number, "100");
    assert_eq!(h.transport.sessions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_remote_hangup_cleans_up() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;

    h.send_session(
        session.id,
        SessionEvent::Ended {
            cause: Some("remote hangup".into()),
        },
    )
    .await;

    h.wait(|s| s.call.is_none()).await;
    h.expect_event(
        |e| matches!(e, PhoneEvent::CallEnded { cause: Some(c), .. } if c == "remote hangup"),
    )
    .await;
    assert_eq!(h.media.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_failure_surfaces_error() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;

    h.send_session(
        session.id,
        SessionEvent::Failed {
            cause: "486 Busy Here".into(),
        },
    )
    .await;

    h.wait(|s| s.call.is_none()).await;
    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("486"))).await;
}

#[tokio::test]
async fn test_hangup_is_idempotent() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.dial("100").await;

    h.handle.hangup().await.unwrap();
    h.wait(|s| s.call.is_none()).await;
    h.handle.hangup().await.unwrap();
    settle().await;

    let ended = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, PhoneEvent::CallEnded { .. }))
        .count();
    assert_eq!(ended, 1);
    assert_eq!(h.media.stops.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Incoming calls

#[tokio::test]
async fn test_incoming_ring_and_answer() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    let session = h.push_incoming("5551234").await;
    let snapshot = h.wait(|s| s.call_status() == CallStatus::Ringing).await;
    let call = snapshot.call.unwrap();
    assert_eq!(call.direction, CallDirection::Incoming);
    assert_eq!(call.remote_number, "5551234");
    assert_eq!(h.alerts.ring_starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.alerts.notifies.lock().unwrap().as_slice(), ["5551234"]);
    h.expect_event(|e| matches!(e, PhoneEvent::IncomingCall { .. })).await;

    h.handle.answer().await.unwrap();
    wait_until(|| session.has("accept")).await;
    assert_eq!(h.media.captures.load(Ordering::SeqCst), 1);

    h.send_session(session.id, SessionEvent::Accepted).await;
    h.wait(|s| s.call_status() == CallStatus::InCall).await;
    assert!(h.alerts.ring_stops.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_incoming_reject_never_touches_media() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    let session = h.push_incoming("5551234").await;
    h.wait(|s| s.call_status() == CallStatus::Ringing).await;

    h.handle.reject().await.unwrap();
    h.wait(|s| s.call.is_none()).await;
    assert!(session.has("decline_busy"));
    assert_eq!(h.media.captures.load(Ordering::SeqCst), 0);
    h.expect_event(|e| matches!(e, PhoneEvent::CallEnded { .. })).await;
}

#[tokio::test]
async fn test_second_incoming_is_busy_declined() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.dial("100").await;

    let second = h.push_incoming("5551234").await;
    h.expect_event(|e| {
        matches!(
            e,
            PhoneEvent::CallRefused {
                reason: RefuseReason::Busy,
                ..
            }
        )
    })
    .await;
    assert!(second.has("decline_busy"));

    // The active call never noticed
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.call.unwrap().remote_number, "100");
}

#[tokio::test]
async fn test_do_not_disturb_force_rejects() {
    let policy = CallPolicy {
        do_not_disturb: true,
        ..CallPolicy::default()
    };
    let mut h = Harness::spawn(policy);
    h.register().await;

    let session = h.push_incoming("5551234").await;
    h.expect_event(|e| {
        matches!(
            e,
            PhoneEvent::CallRefused {
                reason: RefuseReason::DoNotDisturb,
                ..
            }
        )
    })
    .await;
    assert!(session.has("decline_busy"));
    assert_eq!(h.alerts.ring_starts.load(Ordering::SeqCst), 0);
    assert!(h.handle.snapshot().call.is_none());
}

#[tokio::test]
async fn test_answer_capture_failure_declines_call() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    let session = h.push_incoming("5551234").await;
    h.wait(|s| s.call_status() == CallStatus::Ringing).await;

    h.media.fail.store(true, Ordering::SeqCst);
    h.handle.answer().await.unwrap();

    h.wait(|s| s.call.is_none()).await;
    assert!(!session.has("accept"));
    assert!(session.has("terminate"));
    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("Media"))).await;
}

// ---------------------------------------------------------------------------
// Auto-answer

#[tokio::test(start_paused = true)]
async fn test_auto_answer_after_delay() {
    let policy = CallPolicy {
        auto_answer: AutoAnswer::AfterSeconds(3),
        ..CallPolicy::default()
    };
    let mut h = Harness::spawn(policy);
    h.register().await;

    let session = h.push_incoming("5551234").await;
    h.wait(|s| s.call_status() == CallStatus::Ringing).await;
    assert_eq!(h.media.captures.load(Ordering::SeqCst), 0);

    // Paused time advances to the timer on its own
    wait_until(|| session.has("accept")).await;
    assert_eq!(h.media.captures.load(Ordering::SeqCst), 1);

    h.send_session(session.id, SessionEvent::Accepted).await;
    h.wait(|s| s.call_status() == CallStatus::InCall).await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_answer_cancelled_by_reject() {
    let policy = CallPolicy {
        auto_answer: AutoAnswer::AfterSeconds(3),
        ..CallPolicy::default()
    };
    let mut h = Harness::spawn(policy);
    h.register().await;

    let session = h.push_incoming("5551234").await;
    h.wait(|s| s.call_status() == CallStatus::Ringing).await;

    h.handle.reject().await.unwrap();
    h.wait(|s| s.call.is_none()).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!session.has("accept"));
    assert_eq!(h.media.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_immediate_auto_answer() {
    let policy = CallPolicy {
        auto_answer: AutoAnswer::Immediate,
        ..CallPolicy::default()
    };
    let mut h = Harness::spawn(policy);
    h.register().await;

    let session = h.push_incoming("5551234").await;
    wait_until(|| session.has("accept")).await;
}

// ---------------------------------------------------------------------------
// Mid-call controls

#[tokio::test]
async fn test_hold_toggle() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;

    h.handle.toggle_hold().await.unwrap();
    h.wait(|s| s.call_status() == CallStatus::OnHold).await;
    assert!(session.has("hold"));

    h.handle.toggle_hold().await.unwrap();
    h.wait(|s| s.call_status() == CallStatus::InCall).await;
    assert!(session.has("unhold"));
}

#[tokio::test]
async fn test_peer_hold() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;

    h.send_session(session.id, SessionEvent::PeerHold).await;
    h.wait(|s| s.call_status() == CallStatus::OnHold).await;

    h.send_session(session.id, SessionEvent::PeerUnhold).await;
    h.wait(|s| s.call_status() == CallStatus::InCall).await;
    // Hold initiated by the peer sends nothing back
    assert!(!session.has("hold"));
    assert!(!session.has("unhold"));
}

#[tokio::test]
async fn test_mute_toggle() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.dial("100").await;

    h.handle.toggle_mute().await.unwrap();
    h.wait(|s| s.call.as_ref().map(|c| c.muted).unwrap_or(false))
        .await;
    assert_eq!(h.media.enabled.lock().unwrap().last(), Some(&false));

    h.handle.toggle_mute().await.unwrap();
    h.wait(|s| s.call.as_ref().map(|c| !c.muted).unwrap_or(false))
        .await;
    assert_eq!(h.media.enabled.lock().unwrap().last(), Some(&true));
}

#[tokio::test]
async fn test_speaker_toggle_applies_to_remote_track() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;

    let (remote, _tx) = remote_track();
    h.send_session(session.id, SessionEvent::RemoteTrack(remote.clone()))
        .await;
    settle().await;

    h.handle.toggle_speaker().await.unwrap();
    h.wait(|s| s.call.as_ref().map(|c| c.speaker_muted).unwrap_or(false))
        .await;
    // false from attach, then true from the toggle
    assert_eq!(remote.muted.lock().unwrap().as_slice(), [false, true]);
}

#[tokio::test]
async fn test_dtmf_only_while_connected() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;

    h.handle.call("100").await.unwrap();
    h.wait(|s| s.call_status() == CallStatus::Connecting).await;
    let session = h.session();

    // Not connected yet: silently dropped
    h.handle.send_dtmf('1').await.unwrap();
    settle().await;
    assert!(session.actions.lock().unwrap().iter().all(|a| !a.starts_with("dtmf")));

    h.send_session(session.id, SessionEvent::Accepted).await;
    h.wait(|s| s.call_status() == CallStatus::InCall).await;

    h.handle.send_dtmf('5').await.unwrap();
    wait_until(|| session.has("dtmf:5:auto")).await;
    assert_eq!(h.alerts.tones.load(Ordering::SeqCst), 1);

    h.handle.send_dtmf('x').await.unwrap();
    h.expect_event(|e| matches!(e, PhoneEvent::Error(msg) if msg.contains("DTMF"))).await;
}

// ---------------------------------------------------------------------------
// Codec preferences

#[tokio::test]
async fn test_codec_preferences_applied_and_reapplied() {
    let mut h = Harness::spawn(CallPolicy::default());
    *h.transport.session_caps.lock().unwrap() = Some(vec![
        CodecInfo::new("PCMU", 8000, 1),
        CodecInfo::new("opus", 48000, 2),
        CodecInfo::new("CN", 8000, 1),
        CodecInfo::new("G722", 8000, 1),
    ]);
    h.register().await;

    h.handle.call("100").await.unwrap();
    h.wait(|s| s.call_status() == CallStatus::Connecting).await;
    let session = h.session();

    let orders = session.applied_orders.lock().unwrap().clone();
    assert_eq!(orders.len(), 1);
    // Policy order first, unranked codecs trailing in capability order
    assert_eq!(orders[0], vec!["opus", "G722", "PCMU", "CN"]);

    h.send_session(session.id, SessionEvent::NegotiationNeeded).await;
    wait_until(|| session.applied_orders.lock().unwrap().len() == 2).await;
}

#[tokio::test]
async fn test_missing_capabilities_are_not_an_error() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    let session = h.dial("100").await;

    assert!(session.applied_orders.lock().unwrap().is_empty());
    // Still a perfectly healthy call
    assert_eq!(h.handle.snapshot().call_status(), CallStatus::InCall);
}

// ---------------------------------------------------------------------------
// Recording

#[tokio::test]
async fn test_auto_recording_persists_on_hangup() {
    let policy = CallPolicy {
        call_recording: true,
        ..CallPolicy::default()
    };
    let mut h = Harness::spawn(policy);
    h.register().await;

    h.handle.call("100").await.unwrap();
    h.wait(|s| s.call_status() == CallStatus::Connecting).await;
    let session = h.session();

    let (remote, remote_tx) = remote_track();
    h.send_session(session.id, SessionEvent::RemoteTrack(remote)).await;
    h.send_session(session.id, SessionEvent::Accepted).await;
    h.wait(|s| s.call.as_ref().map(|c| c.recording).unwrap_or(false))
        .await;

    let local_tx = h.media.frame_txs.lock().unwrap().last().cloned().unwrap();
    local_tx
        .send(AudioFrame {
            samples: vec![1000; 160],
            timestamp: 0,
        })
        .await
        .unwrap();
    remote_tx
        .send(AudioFrame {
            samples: vec![-1000; 160],
            timestamp: 0,
        })
        .await
        .unwrap();
    settle().await;

    h.handle.hangup().await.unwrap();
    h.wait(|s| s.call.is_none()).await;

    let event = h
        .expect_event(|e| matches!(e, PhoneEvent::RecordingSaved { .. }))
        .await;
    let PhoneEvent::RecordingSaved { artifact_id, .. } = event else {
        unreachable!()
    };
    let artifact = h.store.get(artifact_id).await.unwrap().unwrap();
    assert_eq!(artifact.mime_type, "audio/wav");
    assert!(artifact.size() > 44);
}

#[tokio::test]
async fn test_manual_recording_stop_mid_call() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.dial("100").await;
    assert!(!h.handle.snapshot().call.unwrap().recording);

    h.handle.start_recording().await.unwrap();
    h.wait(|s| s.call.as_ref().map(|c| c.recording).unwrap_or(false))
        .await;

    h.handle.stop_recording().await.unwrap();
    h.wait(|s| s.call.as_ref().map(|c| !c.recording).unwrap_or(false))
        .await;

    // The artifact lands while the call keeps going
    h.expect_event(|e| matches!(e, PhoneEvent::RecordingSaved { .. })).await;
    assert_eq!(h.handle.snapshot().call_status(), CallStatus::InCall);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn test_start_recording_without_call_is_a_noop() {
    let mut h = Harness::spawn(CallPolicy::default());
    h.register().await;
    h.drain_events();

    h.handle.start_recording().await.unwrap();
    settle().await;

    assert!(h.handle.snapshot().call.is_none());
    assert_eq!(h.store.len().await, 0);
    let drained = h.drain_events();
    assert!(drained.iter().all(|e| !matches!(
        e,
        PhoneEvent::CallChanged(_) | PhoneEvent::RecordingSaved { .. } | PhoneEvent::Error(_)
    )));
}

#[tokio::test]
async fn test_store_failure_never_fails_the_call() {
    struct FailingStore;

    #[async_trait]
    impl crate::RecordingStore for FailingStore {
        async fn put(&self, _artifact: &crate::RecordingArtifact) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        async fn get(&self, _id: Uuid) -> anyhow::Result<Option<crate::RecordingArtifact>> {
            Ok(None)
        }
        async fn delete(&self, _id: Uuid) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list(&self) -> anyhow::Result<Vec<crate::RecordingArtifact>> {
            Ok(Vec::new())
        }
    }

    let transport = Arc::new(TransportProbe::default());
    let media = Arc::new(MediaProbe::default());
    let (handle, events) = Softphone::spawn(
        SoftphoneDeps {
            transport: Arc::new(MockTransport {
                probe: transport.clone(),
            }),
            media: Arc::new(MockMedia {
                probe: media.clone(),
            }),
            store: Arc::new(FailingStore),
            alerts: Arc::new(AlertProbe::default()),
        },
        CallPolicy {
            call_recording: true,
            ..CallPolicy::default()
        },
    );
    let state = handle.watch();
    let mut h = Harness {
        handle,
        events,
        state,
        transport,
        media,
        alerts: Arc::new(AlertProbe::default()),
        store: Arc::new(MemoryRecordingStore::new()),
    };

    h.register().await;
    let session = h.dial("100").await;
    h.wait(|s| s.call.as_ref().map(|c| c.recording).unwrap_or(false))
        .await;

    h.handle.hangup().await.unwrap();
    h.wait(|s| s.call.is_none()).await;
    settle().await;

    // The failed persist produced neither a saved event nor an error
    let drained = h.drain_events();
    assert!(drained
        .iter()
        .all(|e| !matches!(e, PhoneEvent::RecordingSaved { .. } | PhoneEvent::Error(_))));
    assert!(session.has("terminate"));
}
