use crate::call::{CallControl, CallManager, CallSessionRef, DialogState};
use crate::config::PhoneConfig;
use crate::event::{EventReceiver, EventSender};
use crate::media::{
    sdp::tests::sample_sdp, CaptureRequest, DeviceError, FacingMode, MediaAcquirer,
    MediaConstraints, MediaDevices, MediaTrack, MediaTrackRef, PeerTransport, ReadyState,
    RtpReceiver, RtpSender, TrackKind,
};
use crate::media::peer::{IceConnectionState, RtcConnectionState, SignalingState};
use crate::useragent::{
    AnswerOption, DialogStateSender, EngineEvent, EngineEventSender, InviteOption,
    RegisterOption, RegistrationState, RegistrationStateSender, SipDialog, SipEngine,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
    muted: AtomicBool,
    facing: Option<FacingMode>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            facing: None,
        }
    }

    pub fn with_facing(mut self, facing: FacingMode) -> Self {
        self.facing = Some(facing);
        self
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
    fn ready_state(&self) -> ReadyState {
        if self.ended.load(Ordering::SeqCst) {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }
    fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
    fn facing_mode(&self) -> Option<FacingMode> {
        self.facing
    }
    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

pub fn track(id: &str, kind: TrackKind) -> MediaTrackRef {
    Arc::new(FakeTrack::new(id, kind))
}

pub struct FakeSender {
    track: Mutex<Option<MediaTrackRef>>,
    fail_replace: AtomicBool,
    /// Whether the outgoing track was still live at each `replace_track`.
    pub old_live_at_replace: Mutex<Vec<bool>>,
}

impl FakeSender {
    pub fn new(track: Option<MediaTrackRef>) -> Arc<Self> {
        Arc::new(Self {
            track: Mutex::new(track),
            fail_replace: AtomicBool::new(false),
            old_live_at_replace: Mutex::new(vec![]),
        })
    }

    pub fn fail_replace(&self) {
        self.fail_replace.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RtpSender for FakeSender {
    fn track(&self) -> Option<MediaTrackRef> {
        self.track.lock().unwrap().clone()
    }

    async fn replace_track(&self, track: Option<MediaTrackRef>) -> Result<()> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(anyhow!("InvalidStateError: sender is closed"));
        }
        let mut current = self.track.lock().unwrap();
        let old_live = current.as_ref().map(|t| t.is_live()).unwrap_or(false);
        self.old_live_at_replace.lock().unwrap().push(old_live);
        *current = track;
        Ok(())
    }
}

pub struct FakeReceiver {
    track: MediaTrackRef,
}

impl RtpReceiver for FakeReceiver {
    fn track(&self) -> MediaTrackRef {
        self.track.clone()
    }
}

pub struct FakePeer {
    senders: Mutex<Vec<Arc<FakeSender>>>,
    receivers: Mutex<Vec<Arc<FakeReceiver>>>,
    remote_tx: broadcast::Sender<MediaTrackRef>,
    local_sdp: Mutex<Option<String>>,
    remote_sdp: Mutex<Option<String>>,
    pub added: AtomicUsize,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        let (remote_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            senders: Mutex::new(vec![]),
            receivers: Mutex::new(vec![]),
            remote_tx,
            local_sdp: Mutex::new(Some(sample_sdp(Some("sendrecv")))),
            remote_sdp: Mutex::new(Some(sample_sdp(Some("sendrecv")))),
            added: AtomicUsize::new(0),
        })
    }

    pub fn add_sender(&self, track: MediaTrackRef) -> Arc<FakeSender> {
        let sender = FakeSender::new(Some(track));
        self.senders.lock().unwrap().push(sender.clone());
        sender
    }

    /// Drops every sender, the way a bad renegotiation does.
    pub fn clear_senders(&self) {
        self.senders.lock().unwrap().clear();
    }

    pub fn fake_senders(&self) -> Vec<Arc<FakeSender>> {
        self.senders.lock().unwrap().clone()
    }

    pub fn sender_tracks(&self, kind: TrackKind) -> Vec<MediaTrackRef> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.track())
            .filter(|t| t.kind() == kind)
            .collect()
    }

    /// Delivers a remote track like an `ontrack` callback.
    pub fn push_remote_track(&self, track: MediaTrackRef) {
        self.receivers.lock().unwrap().push(Arc::new(FakeReceiver {
            track: track.clone(),
        }));
        self.remote_tx.send(track).ok();
    }

    pub fn set_descriptions(&self, local: Option<String>, remote: Option<String>) {
        *self.local_sdp.lock().unwrap() = local;
        *self.remote_sdp.lock().unwrap() = remote;
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSender>)
            .collect()
    }

    fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>> {
        self.receivers
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.clone() as Arc<dyn RtpReceiver>)
            .collect()
    }

    async fn add_track(&self, track: MediaTrackRef) -> Result<Arc<dyn RtpSender>> {
        self.added.fetch_add(1, Ordering::SeqCst);
        Ok(self.add_sender(track))
    }

    fn connection_state(&self) -> RtcConnectionState {
        RtcConnectionState::Connected
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        IceConnectionState::Connected
    }

    fn signaling_state(&self) -> SignalingState {
        SignalingState::Stable
    }

    fn local_description(&self) -> Option<String> {
        self.local_sdp.lock().unwrap().clone()
    }

    fn remote_description(&self) -> Option<String> {
        self.remote_sdp.lock().unwrap().clone()
    }

    fn subscribe_remote_tracks(&self) -> broadcast::Receiver<MediaTrackRef> {
        self.remote_tx.subscribe()
    }
}

pub struct FakeDialog {
    id: String,
    remote: String,
    peer: Mutex<Option<Arc<FakePeer>>>,
    calls: Mutex<Vec<String>>,
    fail_accept: AtomicBool,
}

impl FakeDialog {
    pub fn new(remote: &str, peer: Option<Arc<FakePeer>>) -> Arc<Self> {
        Arc::new(Self {
            id: format!("dialog-{}", uuid::Uuid::new_v4()),
            remote: remote.to_string(),
            peer: Mutex::new(peer),
            calls: Mutex::new(vec![]),
            fail_accept: AtomicBool::new(false),
        })
    }

    pub fn set_peer(&self, peer: Option<Arc<FakePeer>>) {
        *self.peer.lock().unwrap() = peer;
    }

    pub fn fake_peer(&self) -> Option<Arc<FakePeer>> {
        self.peer.lock().unwrap().clone()
    }

    pub fn fail_accept(&self) {
        self.fail_accept.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SipDialog for FakeDialog {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote_identity(&self) -> String {
        self.remote.clone()
    }

    fn peer(&self) -> Option<Arc<dyn PeerTransport>> {
        self.peer
            .lock()
            .unwrap()
            .clone()
            .map(|p| p as Arc<dyn PeerTransport>)
    }

    async fn accept(&self, _option: AnswerOption) -> Result<()> {
        if self.fail_accept.load(Ordering::SeqCst) {
            return Err(anyhow!("transport closed"));
        }
        self.record("accept".to_string());
        Ok(())
    }

    async fn reject(&self, code: u16) -> Result<()> {
        self.record(format!("reject:{}", code));
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.record("cancel".to_string());
        Ok(())
    }

    async fn bye(&self) -> Result<()> {
        self.record("bye".to_string());
        Ok(())
    }

    async fn refer(&self, target: &rsip::Uri) -> Result<()> {
        self.record(format!("refer:{}", target));
        Ok(())
    }

    fn send_dtmf(&self, tone: char, _duration: Duration) -> bool {
        self.record(format!("dtmf:{}", tone));
        true
    }
}

pub struct FakeEngine {
    /// State sent right after REGISTER, `None` leaves the attempt hanging.
    pub register_reply: Mutex<Option<RegistrationState>>,
    pub registrations: Mutex<Vec<(RegisterOption, RegistrationStateSender)>>,
    engine_events: Mutex<Option<EngineEventSender>>,
    pub invites: Mutex<Vec<(rsip::Uri, MediaConstraints)>>,
    /// Peer handed to the next outbound dialog; cleared dialogs get none.
    pub invite_with_peer: AtomicBool,
    dialogs: Mutex<Vec<(Arc<FakeDialog>, DialogStateSender)>>,
    pub messages: Mutex<Vec<(String, String)>>,
    pub fail_message: AtomicBool,
    pub unregistered: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            register_reply: Mutex::new(Some(RegistrationState::Registered)),
            registrations: Mutex::new(vec![]),
            engine_events: Mutex::new(None),
            invites: Mutex::new(vec![]),
            invite_with_peer: AtomicBool::new(true),
            dialogs: Mutex::new(vec![]),
            messages: Mutex::new(vec![]),
            fail_message: AtomicBool::new(false),
            unregistered: AtomicBool::new(false),
        })
    }

    pub fn reply_with(&self, state: Option<RegistrationState>) {
        *self.register_reply.lock().unwrap() = state;
    }

    /// Pushes a registration transition to attempt `index`.
    pub fn emit_registration(&self, index: usize, state: RegistrationState) {
        let registrations = self.registrations.lock().unwrap();
        registrations[index].1.send(state).ok();
    }

    pub fn last_dialog(&self) -> Arc<FakeDialog> {
        self.dialogs.lock().unwrap().last().unwrap().0.clone()
    }

    pub fn emit_dialog_state(&self, state: DialogState) {
        let dialogs = self.dialogs.lock().unwrap();
        dialogs.last().unwrap().1.send(state).ok();
    }

    /// Simulates an INVITE from `remote`, returns the dialog state feed.
    pub fn incoming_invite(&self, dialog: Arc<FakeDialog>) -> DialogStateSender {
        let (states_tx, states) = mpsc::unbounded_channel();
        self.engine_events
            .lock()
            .unwrap()
            .as_ref()
            .expect("engine not registered")
            .send(EngineEvent::IncomingInvite { dialog, states })
            .ok();
        states_tx
    }

    pub fn incoming_message(&self, from: &str, body: &str) {
        self.engine_events
            .lock()
            .unwrap()
            .as_ref()
            .expect("engine not registered")
            .send(EngineEvent::Message {
                from: from.to_string(),
                body: body.to_string(),
            })
            .ok();
    }
}

#[async_trait]
impl SipEngine for FakeEngine {
    async fn register(
        &self,
        option: RegisterOption,
        states: RegistrationStateSender,
        events: EngineEventSender,
    ) -> Result<()> {
        if let Some(reply) = self.register_reply.lock().unwrap().clone() {
            states.send(reply).ok();
        }
        self.registrations.lock().unwrap().push((option, states));
        *self.engine_events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        self.unregistered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invite(
        &self,
        option: InviteOption,
        states: DialogStateSender,
    ) -> Result<Arc<dyn SipDialog>> {
        self.invites
            .lock()
            .unwrap()
            .push((option.callee.clone(), option.constraints));
        let peer = if self.invite_with_peer.load(Ordering::SeqCst) {
            Some(FakePeer::new())
        } else {
            None
        };
        let dialog = FakeDialog::new(&option.callee.to_string(), peer);
        self.dialogs.lock().unwrap().push((dialog.clone(), states));
        Ok(dialog)
    }

    async fn message(&self, target: &rsip::Uri, body: &str) -> Result<()> {
        if self.fail_message.load(Ordering::SeqCst) {
            return Err(anyhow!("408 Request Timeout"));
        }
        self.messages
            .lock()
            .unwrap()
            .push((target.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct FakeDevices {
    requests: Mutex<Vec<CaptureRequest>>,
    issued: Mutex<Vec<MediaTrackRef>>,
    failure: Mutex<Option<DeviceError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    counter: AtomicUsize,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(vec![]),
            issued: Mutex::new(vec![]),
            failure: Mutex::new(None),
            gate: Mutex::new(None),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Every track handed out so far.
    pub fn issued(&self) -> Vec<MediaTrackRef> {
        self.issued.lock().unwrap().clone()
    }

    pub fn fail_with(&self, name: &str, message: &str) {
        *self.failure.lock().unwrap() = Some(DeviceError::new(name, message));
    }

    /// Makes captures wait until the returned gate is notified.
    pub fn hold_captures(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        request: CaptureRequest,
    ) -> Result<Vec<MediaTrackRef>, DeviceError> {
        self.requests.lock().unwrap().push(request.clone());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut tracks: Vec<MediaTrackRef> = vec![];
        if request.audio {
            tracks.push(Arc::new(FakeTrack::new(&format!("audio-{}", n), TrackKind::Audio)));
        }
        if request.video {
            let facing = request.facing_mode.unwrap_or(FacingMode::User);
            tracks.push(Arc::new(
                FakeTrack::new(&format!("video-{}", n), TrackKind::Video).with_facing(facing),
            ));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub devices: Arc<FakeDevices>,
    pub manager: CallManager,
    pub control: CallControl,
    pub events: EventSender,
}

impl Harness {
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }
}

/// Test config: periodic reconcile off so repairs are only the ones a
/// test triggers.
pub fn test_config() -> PhoneConfig {
    PhoneConfig {
        reconcile_interval: None,
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with_config(test_config())
}

pub fn harness_with_config(config: PhoneConfig) -> Harness {
    let engine = FakeEngine::new();
    let devices = Arc::new(FakeDevices::new());
    let (events, _) = broadcast::channel(128);
    let manager = CallManager::new(
        engine.clone(),
        MediaAcquirer::new(devices.clone()),
        events.clone(),
        Arc::new(config),
        CancellationToken::new(),
    );
    Harness {
        engine,
        devices,
        control: CallControl::new(manager.clone()),
        manager,
        events,
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub fn callee() -> rsip::Uri {
    rsip::Uri::try_from("sip:bob@example.com").unwrap()
}

/// Places a call and drives it to Established with local tracks bound.
pub async fn established_call(
    h: &Harness,
    with_video: bool,
) -> (CallSessionRef, Arc<FakeDialog>, Arc<FakePeer>) {
    let session = h
        .manager
        .place_call("sip:alice@example.com".to_string(), callee(), with_video)
        .await
        .unwrap();
    let dialog = h.engine.last_dialog();
    let peer = dialog.fake_peer().unwrap();
    h.engine.emit_dialog_state(DialogState::Establishing);
    h.engine.emit_dialog_state(DialogState::Established);
    let expected = if with_video { 2 } else { 1 };
    assert!(
        wait_until(|| session.state() == DialogState::Established
            && peer.fake_senders().len() == expected
            && session.info().established_at.is_some())
        .await
    );
    // let the established hook finish its snapshot
    tokio::time::sleep(Duration::from_millis(20)).await;
    (session, dialog, peer)
}
