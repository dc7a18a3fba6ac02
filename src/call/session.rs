use super::{
    CallSession, CallSessionRef, DialogState, Direction, MediaPolicy, ReconcileReport,
    ReconcileStatus, SessionSlot, TrackReconciler,
};
use crate::config::PhoneConfig;
use crate::error::CallError;
use crate::event::{EventSender, PhoneEvent};
use crate::media::{
    peer::{senders_of_kind, set_senders_enabled},
    MediaAcquirer, MediaTrackRef, TrackKind,
};
use crate::useragent::{
    AnswerOption, DialogStateReceiver, InboundInvitation, InviteOption, SipDialog, SipEngine,
};
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    select,
    sync::{broadcast::error::RecvError, mpsc},
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REJECT_BUSY: u16 = 486;
const REJECT_UNAVAILABLE: u16 = 480;
const REJECT_DECLINE: u16 = 603;

struct CallManagerInner {
    slot: SessionSlot,
    engine: Arc<dyn SipEngine>,
    acquirer: MediaAcquirer,
    reconciler: TrackReconciler,
    events: EventSender,
    config: Arc<PhoneConfig>,
    token: CancellationToken,
}

/// Owns the single call: creates sessions, follows their dialog states,
/// binds local media and tears everything down again.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<CallManagerInner>,
}

impl CallManager {
    pub fn new(
        engine: Arc<dyn SipEngine>,
        acquirer: MediaAcquirer,
        events: EventSender,
        config: Arc<PhoneConfig>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(CallManagerInner {
                slot: SessionSlot::default(),
                engine,
                acquirer,
                reconciler: TrackReconciler::new(config.max_track_reattach),
                events,
                config,
                token,
            }),
        }
    }

    pub fn current(&self) -> Option<CallSessionRef> {
        self.inner.slot.current()
    }

    /// Whether `session` still is the active call.
    pub fn is_current(&self, session: &CallSession) -> bool {
        self.inner.slot.is_live(session.generation) && !session.is_terminated()
    }

    pub fn acquirer(&self) -> &MediaAcquirer {
        &self.inner.acquirer
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.inner.config
    }

    pub async fn place_call(
        &self,
        caller: String,
        callee: rsip::Uri,
        with_video: bool,
    ) -> Result<CallSessionRef, CallError> {
        let generation = self.inner.slot.reserve()?;
        info!(%callee, with_video, generation, "placing call");

        let local_media = match self.inner.acquirer.acquire(true, with_video).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(%callee, "media acquisition failed: {}", e);
                self.inner.slot.release(generation);
                return Err(e.into());
            }
        };
        if !self.inner.slot.is_live(generation) {
            info!(generation, "call hung up while acquiring media");
            local_media.stop_all();
            return Err(CallError::Cancelled);
        }

        let (state_sender, states) = mpsc::unbounded_channel();
        let option = InviteOption {
            callee: callee.clone(),
            caller,
            constraints: local_media.constraints(),
            local_media: local_media.clone(),
            ice_servers: self.inner.config.ice_servers.clone(),
        };
        let dialog = match self.inner.engine.invite(option, state_sender).await {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(%callee, "invite failed: {}", e);
                local_media.stop_all();
                self.inner.slot.release(generation);
                return Err(CallError::Signaling(e.to_string()));
            }
        };

        let session = Arc::new(CallSession::new(
            generation,
            Direction::Outbound,
            dialog.clone(),
            MediaPolicy::new(with_video),
            self.inner.token.child_token(),
        ));
        session.set_local_media(local_media);
        if !self.inner.slot.install(generation, session.clone()) {
            info!(generation, "call hung up while the invite was in flight");
            session.local_media().stop_all();
            if let Err(e) = dialog.cancel().await {
                warn!(dialog_id = %dialog.id(), "failed to cancel invite: {}", e);
            }
            return Err(CallError::Cancelled);
        }

        info!(session_id = %session.id, dialog_id = %dialog.id(), "invite dispatched");
        self.emit_state(&session, DialogState::Initial);
        self.emit_local_media(&session);
        self.spawn_dialog_watch(session.clone(), states);
        Ok(session)
    }

    pub async fn accept_call(
        &self,
        invitation: &InboundInvitation,
        with_video: bool,
    ) -> Result<(), CallError> {
        let session = match self.inner.slot.current() {
            Some(session)
                if session.generation == invitation.generation()
                    && session.direction == Direction::Inbound
                    && session.state() == DialogState::Initial =>
            {
                session
            }
            _ => return Err(CallError::InvitationGone),
        };
        if session.accepting.swap(true, Ordering::SeqCst) {
            return Err(CallError::InvitationGone);
        }
        info!(session_id = %session.id, with_video, "accepting call");

        let local_media = match self.inner.acquirer.acquire(true, with_video).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(session_id = %session.id, "media acquisition failed, rejecting: {}", e);
                if self.inner.slot.clear_if(session.generation) {
                    self.finish(&session);
                    if let Err(e) = session.dialog.reject(REJECT_UNAVAILABLE).await {
                        warn!(session_id = %session.id, "failed to reject invitation: {}", e);
                    }
                }
                return Err(e.into());
            }
        };
        if !self.is_current(&session) {
            info!(session_id = %session.id, "call ended while acquiring media");
            local_media.stop_all();
            return Err(CallError::Cancelled);
        }

        session.update_policy(|p| p.video_enabled = with_video);
        session.set_local_media(local_media.clone());
        self.emit_local_media(&session);

        let option = AnswerOption {
            constraints: local_media.constraints(),
            local_media,
            ice_servers: self.inner.config.ice_servers.clone(),
        };
        session.answered.store(true, Ordering::SeqCst);
        if let Err(e) = session.dialog.accept(option).await {
            warn!(session_id = %session.id, "accept failed: {}", e);
            session.answered.store(false, Ordering::SeqCst);
            self.terminate(&session);
            return Err(CallError::Signaling(e.to_string()));
        }
        if !self.is_current(&session) {
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    /// Entry point for an INVITE received from the engine.
    pub async fn on_incoming_invite(&self, dialog: Arc<dyn SipDialog>, states: DialogStateReceiver) {
        let generation = match self.inner.slot.reserve() {
            Ok(generation) => generation,
            Err(_) => {
                info!(
                    dialog_id = %dialog.id(),
                    from = %dialog.remote_identity(),
                    "busy, rejecting incoming invite"
                );
                if let Err(e) = dialog.reject(REJECT_BUSY).await {
                    warn!(dialog_id = %dialog.id(), "failed to reject: {}", e);
                }
                return;
            }
        };

        let session = Arc::new(CallSession::new(
            generation,
            Direction::Inbound,
            dialog.clone(),
            MediaPolicy::new(false),
            self.inner.token.child_token(),
        ));
        self.inner.slot.install(generation, session.clone());
        info!(
            session_id = %session.id,
            dialog_id = %dialog.id(),
            from = %session.remote_identity,
            "incoming call"
        );
        self.emit_state(&session, DialogState::Initial);
        self.spawn_dialog_watch(session.clone(), states);
        self.inner
            .events
            .send(PhoneEvent::IncomingInvite(InboundInvitation::new(
                session.id.clone(),
                generation,
                dialog,
            )))
            .ok();
    }

    /// Clears the active call right away; the BYE/CANCEL/reject goes out in
    /// the background. Returns false when there was nothing to hang up.
    pub fn hangup(&self) -> bool {
        match self.inner.slot.take() {
            Some(session) => {
                info!(session_id = %session.id, state = ?session.state(), "hangup");
                self.teardown(session);
                true
            }
            None => {
                debug!("hangup without an active call");
                false
            }
        }
    }

    /// Ends `session` if it still owns the slot.
    pub(crate) fn terminate(&self, session: &CallSessionRef) {
        if self.inner.slot.clear_if(session.generation) {
            self.teardown(session.clone());
        }
    }

    fn teardown(&self, session: CallSessionRef) {
        let state = session.state();
        let answered = session.answered.load(Ordering::SeqCst);
        self.finish(&session);
        tokio::spawn(async move {
            let dialog = &session.dialog;
            let result = match (state, session.direction) {
                (DialogState::Terminated, _) => return,
                (DialogState::Established, _) | (DialogState::Establishing, Direction::Inbound) => {
                    dialog.bye().await
                }
                (DialogState::Initial, Direction::Outbound)
                | (DialogState::Establishing, Direction::Outbound) => dialog.cancel().await,
                // an answer may already be on the wire
                (DialogState::Initial, Direction::Inbound) if answered => dialog.bye().await,
                (DialogState::Initial, Direction::Inbound) => dialog.reject(REJECT_DECLINE).await,
            };
            if let Err(e) = result {
                warn!(session_id = %session.id, ?state, "teardown signaling failed: {}", e);
            }
        });
    }

    /// Final cleanup of a session. Runs once however often it is called.
    fn finish(&self, session: &CallSessionRef) {
        if session.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let advanced = session.advance(DialogState::Terminated);
        session.local_media().stop_all();
        session.token.cancel();
        self.inner.slot.clear_if(session.generation);
        info!(session_id = %session.id, "call terminated");
        if advanced {
            self.emit_state(session, DialogState::Terminated);
        }
    }

    fn spawn_dialog_watch(&self, session: CallSessionRef, mut states: DialogStateReceiver) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let state = select! {
                    _ = session.token.cancelled() => break,
                    state = states.recv() => state,
                };
                match state {
                    Some(state) => manager.on_dialog_state(&session, state).await,
                    None => {
                        warn!(session_id = %session.id, "dialog state stream closed");
                        manager.terminate(&session);
                        break;
                    }
                }
            }
            debug!(session_id = %session.id, "dialog watch finished");
        });
    }

    async fn on_dialog_state(&self, session: &CallSessionRef, state: DialogState) {
        if state == DialogState::Terminated {
            info!(session_id = %session.id, "remote ended the dialog");
            self.inner.slot.clear_if(session.generation);
            self.finish(session);
            return;
        }
        if !session.advance(state) {
            debug!(session_id = %session.id, ?state, current = ?session.state(), "ignoring stale dialog state");
            return;
        }
        info!(session_id = %session.id, ?state, "dialog state changed");
        self.emit_state(session, state);
        self.sync_media(session).await;
    }

    /// Brings the transport in line with the session's current state.
    async fn sync_media(&self, session: &CallSessionRef) {
        match session.state() {
            DialogState::Establishing => {
                if self.bind_local_tracks(session).await {
                    self.reconcile(session).await;
                }
            }
            DialogState::Established => self.on_established(session).await,
            _ => {}
        }
    }

    /// Attaches every live local track whose kind has no sender yet, then
    /// applies the media policy. False when there is no transport to bind to.
    async fn bind_local_tracks(&self, session: &CallSessionRef) -> bool {
        let peer = match session.peer() {
            Some(peer) => peer,
            None => {
                self.watch_transport(session);
                return false;
            }
        };
        for track in session.local_media().tracks() {
            if !track.is_live() || !senders_of_kind(peer.as_ref(), track.kind()).is_empty() {
                continue;
            }
            debug!(session_id = %session.id, track_id = track.id(), kind = ?track.kind(), "binding local track");
            if let Err(e) = peer.add_track(track.clone()).await {
                warn!(session_id = %session.id, track_id = track.id(), "failed to bind track: {}", e);
            }
            if !self.is_current(session) {
                return false;
            }
        }
        let policy = session.policy();
        set_senders_enabled(peer.as_ref(), TrackKind::Audio, policy.audio_live());
        set_senders_enabled(peer.as_ref(), TrackKind::Video, policy.video_live());
        true
    }

    async fn on_established(&self, session: &CallSessionRef) {
        let peer = match session.peer() {
            Some(peer) => peer,
            None => {
                self.watch_transport(session);
                return;
            }
        };
        // the dialog watch and the transport watchdog can both get here
        if session.established_sync.swap(true, Ordering::SeqCst) {
            debug!(session_id = %session.id, "established media already synced");
            return;
        }
        // subscribe before the snapshot so no track falls in between
        let remote_tracks = peer.subscribe_remote_tracks();
        if !self.bind_local_tracks(session).await {
            return;
        }

        let sent: Vec<MediaTrackRef> = peer.senders().iter().filter_map(|s| s.track()).collect();
        session.merge_local_tracks(sent);
        for receiver in peer.receivers() {
            session.merge_remote_track(receiver.track());
        }
        self.emit_local_media(session);
        self.emit_remote_media(session);

        if !session.remote_listener.swap(true, Ordering::SeqCst) {
            self.spawn_remote_listener(session.clone(), remote_tracks);
        }
        self.reconcile(session).await;
        self.spawn_periodic_reconcile(session.clone());
    }

    fn spawn_remote_listener(
        &self,
        session: CallSessionRef,
        mut remote_tracks: tokio::sync::broadcast::Receiver<MediaTrackRef>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let received = select! {
                    _ = session.token.cancelled() => break,
                    received = remote_tracks.recv() => received,
                };
                match received {
                    Ok(track) => {
                        debug!(session_id = %session.id, track_id = track.id(), kind = ?track.kind(), "remote track arrived");
                        if session.merge_remote_track(track) {
                            manager.emit_remote_media(&session);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session.id, skipped, "remote track stream lagged, resyncing");
                        let mut grew = false;
                        if let Some(peer) = session.peer() {
                            for receiver in peer.receivers() {
                                grew |= session.merge_remote_track(receiver.track());
                            }
                        }
                        if grew {
                            manager.emit_remote_media(&session);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_periodic_reconcile(&self, session: CallSessionRef) {
        let period = match self.inner.config.reconcile_interval {
            Some(period) => period,
            None => return,
        };
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                select! {
                    _ = session.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !manager.is_current(&session) {
                    break;
                }
                manager.reconcile(&session).await;
            }
        });
    }

    /// Runs the reconciler and arms the media watchdog when audio is gone.
    pub(crate) async fn reconcile(&self, session: &CallSessionRef) -> ReconcileReport {
        let report = self.inner.reconciler.reconcile(session).await;
        if report.status == ReconcileStatus::NoAudioTrack
            && session.state() == DialogState::Established
            && self.is_current(session)
        {
            self.watch_media(session);
        }
        report
    }

    fn watch_media(&self, session: &CallSessionRef) {
        if session.media_watch.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(session_id = %session.id, "established call has no audio sender");
        self.inner
            .events
            .send(PhoneEvent::NoAudioTrack {
                session_id: session.id.clone(),
            })
            .ok();

        let manager = self.clone();
        let session = session.clone();
        let wait = self.inner.config.media_recovery_timeout;
        tokio::spawn(async move {
            select! {
                _ = session.token.cancelled() => return,
                _ = sleep(wait) => {}
            }
            let report = manager.inner.reconciler.reconcile(&session).await;
            if report.status == ReconcileStatus::NoAudioTrack {
                warn!(session_id = %session.id, ?wait, "audio never recovered, ending call");
                manager.terminate(&session);
            } else {
                info!(session_id = %session.id, "audio sender recovered");
                session.media_watch.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Polls for a late peer transport, ends the call when none shows up.
    fn watch_transport(&self, session: &CallSessionRef) {
        if session.transport_watch.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(session_id = %session.id, "signaling supplied no peer transport");
        self.inner
            .events
            .send(PhoneEvent::TransportUnavailable {
                session_id: session.id.clone(),
            })
            .ok();

        let manager = self.clone();
        let session = session.clone();
        let wait = self.inner.config.transport_recovery_timeout;
        tokio::spawn(async move {
            let deadline = Instant::now() + wait;
            loop {
                select! {
                    _ = session.token.cancelled() => return,
                    _ = sleep(TRANSPORT_POLL_INTERVAL) => {}
                }
                if session.peer().is_some() {
                    info!(session_id = %session.id, "peer transport recovered");
                    session.transport_watch.store(false, Ordering::SeqCst);
                    manager.sync_media(&session).await;
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(session_id = %session.id, ?wait, "peer transport never appeared, ending call");
                    manager.terminate(&session);
                    return;
                }
            }
        });
    }

    pub(crate) fn emit_state(&self, session: &CallSession, state: DialogState) {
        self.inner
            .events
            .send(PhoneEvent::SessionStateChanged {
                session_id: session.id.clone(),
                state,
            })
            .ok();
    }

    pub(crate) fn emit_local_media(&self, session: &CallSession) {
        self.inner
            .events
            .send(PhoneEvent::LocalMediaUpdated {
                session_id: session.id.clone(),
                bundle: session.local_media(),
            })
            .ok();
    }

    pub(crate) fn emit_remote_media(&self, session: &CallSession) {
        self.inner
            .events
            .send(PhoneEvent::RemoteMediaUpdated {
                session_id: session.id.clone(),
                bundle: session.remote_media(),
            })
            .ok();
    }
}
