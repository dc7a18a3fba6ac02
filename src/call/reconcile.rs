use super::CallSession;
use crate::media::{
    peer::{senders_of_kind, IceConnectionState, RtcConnectionState, SignalingState},
    MediaTrackRecord, TrackKind,
};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Healthy,
    Repaired,
    /// No outbound audio sender exists; nothing left to flip.
    NoAudioTrack,
    TransportUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub session_id: String,
    pub status: ReconcileStatus,
    pub connection_state: Option<RtcConnectionState>,
    pub ice_connection_state: Option<IceConnectionState>,
    pub signaling_state: Option<SignalingState>,
    pub senders: Vec<MediaTrackRecord>,
    pub receivers: Vec<MediaTrackRecord>,
    pub fixed: usize,
    pub reattached: bool,
}

/// Keeps audio sender enablement in line with the session's media policy.
///
/// Video is left alone: it only changes on an explicit toggle.
#[derive(Debug, Clone)]
pub struct TrackReconciler {
    max_reattach: u32,
}

impl TrackReconciler {
    pub fn new(max_reattach: u32) -> Self {
        Self { max_reattach }
    }

    pub async fn reconcile(&self, session: &CallSession) -> ReconcileReport {
        let peer = match session.peer() {
            Some(peer) => peer,
            None => {
                warn!(session_id = %session.id, "no peer transport to reconcile");
                return ReconcileReport {
                    session_id: session.id.clone(),
                    status: ReconcileStatus::TransportUnavailable,
                    connection_state: None,
                    ice_connection_state: None,
                    signaling_state: None,
                    senders: vec![],
                    receivers: vec![],
                    fixed: 0,
                    reattached: false,
                };
            }
        };

        let mut reattached = false;
        if senders_of_kind(peer.as_ref(), TrackKind::Audio).is_empty() {
            let local_audio = session
                .local_media()
                .of_kind(TrackKind::Audio)
                .find(|t| t.is_live())
                .cloned();
            if let Some(track) = local_audio {
                if session.try_reattach(self.max_reattach) {
                    info!(session_id = %session.id, track_id = track.id(), "re-attaching local audio");
                    match peer.add_track(track).await {
                        Ok(_) => reattached = true,
                        Err(e) => warn!(session_id = %session.id, "re-attach failed: {}", e),
                    }
                }
            }
        }

        // policy is read after the await so a mute issued meanwhile is honoured
        let audio_live = session.policy().audio_live();
        let audio_senders = senders_of_kind(peer.as_ref(), TrackKind::Audio);
        let mut fixed = 0;
        for sender in audio_senders.iter() {
            let track = match sender.track() {
                Some(track) if track.is_live() => track,
                _ => continue,
            };
            if track.enabled() != audio_live {
                track.set_enabled(audio_live);
                fixed += 1;
            }
        }

        let senders: Vec<MediaTrackRecord> = peer
            .senders()
            .iter()
            .enumerate()
            .map(|(index, s)| MediaTrackRecord::snapshot(index, s.track().as_deref()))
            .collect();
        let receivers: Vec<MediaTrackRecord> = peer
            .receivers()
            .iter()
            .enumerate()
            .map(|(index, r)| MediaTrackRecord::snapshot(index, Some(r.track().as_ref())))
            .collect();
        debug!(session_id = %session.id, ?senders, ?receivers, "track snapshot");

        let status = if audio_senders.is_empty() {
            ReconcileStatus::NoAudioTrack
        } else if fixed > 0 || reattached {
            ReconcileStatus::Repaired
        } else {
            ReconcileStatus::Healthy
        };
        match status {
            ReconcileStatus::Repaired => {
                warn!(session_id = %session.id, fixed, reattached, "audio senders repaired")
            }
            ReconcileStatus::NoAudioTrack => {
                warn!(session_id = %session.id, "no audio sender on the transport")
            }
            _ => {}
        }

        ReconcileReport {
            session_id: session.id.clone(),
            status,
            connection_state: Some(peer.connection_state()),
            ice_connection_state: Some(peer.ice_connection_state()),
            signaling_state: Some(peer.signaling_state()),
            senders,
            receivers,
            fixed,
            reattached,
        }
    }
}
