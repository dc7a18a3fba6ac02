use super::{CallManager, CallSessionRef, Direction, ReconcileReport, ReconcileStatus};
use crate::media::{
    peer::{senders_of_kind, set_senders_enabled},
    sdp::{audio_direction, MediaDirection},
    TrackKind,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStatus {
    Healthy,
    Repaired,
    NoAudioTrack,
    TransportUnavailable,
    NoSession,
    Error,
}

impl From<ReconcileStatus> for DiagnosticStatus {
    fn from(status: ReconcileStatus) -> Self {
        match status {
            ReconcileStatus::Healthy => DiagnosticStatus::Healthy,
            ReconcileStatus::Repaired => DiagnosticStatus::Repaired,
            ReconcileStatus::NoAudioTrack => DiagnosticStatus::NoAudioTrack,
            ReconcileStatus::TransportUnavailable => DiagnosticStatus::TransportUnavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub status: DiagnosticStatus,
    pub fixed_count: usize,
    pub reconcile: Option<ReconcileReport>,
    pub local_audio_direction: Option<MediaDirection>,
    pub remote_audio_direction: Option<MediaDirection>,
    /// Both descriptions carry a sendrecv audio line.
    pub bidirectional: bool,
    pub error: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl DiagnosticReport {
    fn no_session() -> Self {
        Self {
            status: DiagnosticStatus::NoSession,
            fixed_count: 0,
            reconcile: None,
            local_audio_direction: None,
            remote_audio_direction: None,
            bidirectional: false,
            error: None,
            generated_at: Utc::now(),
        }
    }
}

pub fn is_dtmf_tone(tone: char) -> bool {
    matches!(tone, '0'..='9' | '*' | '#' | 'A'..='D')
}

/// The operations the UI fires at the active call.
///
/// None of them fail loudly: without a session, or when the transport
/// cannot carry the change, they report `false` and leave state alone.
#[derive(Clone)]
pub struct CallControl {
    manager: CallManager,
}

impl CallControl {
    pub fn new(manager: CallManager) -> Self {
        Self { manager }
    }

    fn session(&self) -> Option<CallSessionRef> {
        self.manager.current()
    }

    pub fn mute(&self, muted: bool) -> bool {
        let session = match self.session() {
            Some(session) => session,
            None => return false,
        };
        let policy = session.update_policy(|p| p.audio_enabled = !muted);
        let reached = match session.peer() {
            Some(peer) => set_senders_enabled(peer.as_ref(), TrackKind::Audio, policy.audio_live()),
            None => 0,
        };
        info!(session_id = %session.id, muted, reached, "mute");
        reached > 0
    }

    pub fn hold(&self, on_hold: bool) -> bool {
        let session = match self.session() {
            Some(session) => session,
            None => return false,
        };
        let policy = session.update_policy(|p| p.on_hold = on_hold);
        let reached = match session.peer() {
            Some(peer) => {
                set_senders_enabled(peer.as_ref(), TrackKind::Audio, policy.audio_live())
                    + set_senders_enabled(peer.as_ref(), TrackKind::Video, policy.video_live())
            }
            None => 0,
        };
        info!(session_id = %session.id, on_hold, reached, "hold");
        reached > 0
    }

    pub fn is_on_hold(&self) -> bool {
        self.session()
            .map(|s| s.policy().on_hold)
            .unwrap_or(false)
    }

    pub fn toggle_video(&self, enabled: bool) -> bool {
        let session = match self.session() {
            Some(session) => session,
            None => return false,
        };
        let policy = session.update_policy(|p| p.video_enabled = enabled);
        let reached = match session.peer() {
            Some(peer) => set_senders_enabled(peer.as_ref(), TrackKind::Video, policy.video_live()),
            None => 0,
        };
        info!(session_id = %session.id, enabled, reached, "toggle video");
        reached > 0
    }

    /// Forwards one DTMF symbol. Sent regardless of hold state.
    pub fn send_tone(&self, tone: char) -> bool {
        if !is_dtmf_tone(tone) {
            debug!(%tone, "not a dtmf tone");
            return false;
        }
        let session = match self.session() {
            Some(session) => session,
            None => return false,
        };
        let sent = session
            .dialog
            .send_dtmf(tone, self.manager.config().dtmf_duration);
        info!(session_id = %session.id, %tone, sent, "send tone");
        sent
    }

    /// Blind transfer through REFER, only for calls we placed.
    pub async fn transfer(&self, target: &rsip::Uri) -> bool {
        let session = match self.session() {
            Some(session) => session,
            None => return false,
        };
        if session.direction != Direction::Outbound {
            info!(session_id = %session.id, "transfer refused for inbound call");
            return false;
        }
        match session.dialog.refer(target).await {
            Ok(()) => {
                info!(session_id = %session.id, dest = %target, "call transferred");
                true
            }
            Err(e) => {
                warn!(session_id = %session.id, dest = %target, "transfer failed: {}", e);
                false
            }
        }
    }

    /// Swaps the outgoing camera for the one facing the other way.
    ///
    /// The old track is stopped only once `replace_track` has succeeded, so
    /// a failure leaves the call with the camera it had. A switch requested
    /// while another is still in flight is refused.
    pub async fn switch_camera(&self) -> bool {
        let session = match self.session() {
            Some(session) => session,
            None => return false,
        };
        if session.switching.swap(true, Ordering::SeqCst) {
            debug!(session_id = %session.id, "camera switch already in progress");
            return false;
        }
        let switched = self.swap_camera(&session).await;
        session.switching.store(false, Ordering::SeqCst);
        switched
    }

    async fn swap_camera(&self, session: &CallSessionRef) -> bool {
        let peer = match session.peer() {
            Some(peer) => peer,
            None => return false,
        };
        let (sender, current) = match senders_of_kind(peer.as_ref(), TrackKind::Video)
            .into_iter()
            .find_map(|s| s.track().map(|t| (s, t)))
        {
            Some(found) => found,
            None => {
                debug!(session_id = %session.id, "no video sender to switch");
                return false;
            }
        };

        let fresh = match self.manager.acquirer().switch_facing(current.as_ref()).await {
            Ok(track) => track,
            Err(e) => {
                warn!(session_id = %session.id, "camera switch failed: {}", e);
                return false;
            }
        };
        if !self.manager.is_current(session) {
            fresh.stop();
            return false;
        }
        fresh.set_enabled(session.policy().video_live());

        // the sender may have moved on while the camera was opening
        let old = sender.track().unwrap_or(current);
        if let Err(e) = sender.replace_track(Some(fresh.clone())).await {
            warn!(session_id = %session.id, "replace track failed: {}", e);
            fresh.stop();
            return false;
        }
        old.stop();
        if !self.manager.is_current(session) {
            // the call ended during the swap; the fresh track is ours to release
            fresh.stop();
            return false;
        }
        session.replace_local_track(old.id(), fresh.clone());
        info!(
            session_id = %session.id,
            from = old.id(),
            to = fresh.id(),
            facing = ?fresh.facing_mode(),
            "camera switched"
        );
        self.manager.emit_local_media(session);
        true
    }

    pub fn hangup(&self) -> bool {
        self.manager.hangup()
    }

    /// Repairs audio senders and inspects the negotiated audio direction.
    pub async fn diagnose_audio(&self) -> DiagnosticReport {
        let session = match self.session() {
            Some(session) => session,
            None => return DiagnosticReport::no_session(),
        };
        let reconcile = self.manager.reconcile(&session).await;
        let mut status = DiagnosticStatus::from(reconcile.status);
        let mut errors = vec![];

        let (local_sdp, remote_sdp) = match session.peer() {
            Some(peer) => (peer.local_description(), peer.remote_description()),
            None => (None, None),
        };
        let mut inspect = |label: &str, sdp: Option<String>| match sdp {
            Some(sdp) => match audio_direction(&sdp) {
                Ok(direction) => direction,
                Err(e) => {
                    errors.push(format!("{} description: {}", label, e));
                    None
                }
            },
            None => None,
        };
        let local_audio_direction = inspect("local", local_sdp);
        let remote_audio_direction = inspect("remote", remote_sdp);

        let error = if errors.is_empty() {
            None
        } else {
            status = DiagnosticStatus::Error;
            Some(errors.join("; "))
        };
        let report = DiagnosticReport {
            status,
            fixed_count: reconcile.fixed,
            local_audio_direction,
            remote_audio_direction,
            bidirectional: local_audio_direction == Some(MediaDirection::SendRecv)
                && remote_audio_direction == Some(MediaDirection::SendRecv),
            reconcile: Some(reconcile),
            error,
            generated_at: Utc::now(),
        };
        info!(
            session_id = %session.id,
            status = ?report.status,
            fixed = report.fixed_count,
            bidirectional = report.bidirectional,
            "audio diagnosis"
        );
        report
    }
}
