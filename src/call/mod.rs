use crate::media::{MediaBundle, MediaTrackRef, PeerTransport};
use crate::useragent::SipDialog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};
use tokio_util::sync::CancellationToken;

pub mod control;
pub mod reconcile;
pub mod session;
pub mod slot;
#[cfg(test)]
pub(crate) mod tests;

pub use control::{CallControl, DiagnosticReport, DiagnosticStatus};
pub use reconcile::{ReconcileReport, ReconcileStatus, TrackReconciler};
pub use session::CallManager;
pub use slot::SessionSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Dialog-level call state. Variants are ordered; a session only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogState {
    Initial,
    Establishing,
    Established,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPolicy {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub on_hold: bool,
}

impl MediaPolicy {
    pub fn new(with_video: bool) -> Self {
        Self {
            audio_enabled: true,
            video_enabled: with_video,
            on_hold: false,
        }
    }

    pub fn audio_live(&self) -> bool {
        self.audio_enabled && !self.on_hold
    }

    pub fn video_live(&self) -> bool {
        self.video_enabled && !self.on_hold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub direction: Direction,
    pub state: DialogState,
    pub remote_identity: String,
    pub policy: MediaPolicy,
    pub started_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
}

/// One call. Owned by the `CallManager` through its `SessionSlot`; everyone
/// else holds an `Arc` only for the duration of an operation and checks the
/// generation again after every await.
pub struct CallSession {
    pub id: String,
    pub generation: u64,
    pub direction: Direction,
    pub remote_identity: String,
    pub dialog: Arc<dyn SipDialog>,
    state: RwLock<DialogState>,
    policy: RwLock<MediaPolicy>,
    local_media: Mutex<MediaBundle>,
    remote_media: Mutex<MediaBundle>,
    reattach_attempts: AtomicU32,
    pub(crate) accepting: AtomicBool,
    pub(crate) answered: AtomicBool,
    pub(crate) finished: AtomicBool,
    pub(crate) transport_watch: AtomicBool,
    pub(crate) media_watch: AtomicBool,
    pub(crate) remote_listener: AtomicBool,
    pub(crate) established_sync: AtomicBool,
    pub(crate) switching: AtomicBool,
    pub(crate) token: CancellationToken,
    started_at: DateTime<Utc>,
    established_at: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("direction", &self.direction)
            .field("remote_identity", &self.remote_identity)
            .finish()
    }
}

pub type CallSessionRef = Arc<CallSession>;

impl CallSession {
    pub fn new(
        generation: u64,
        direction: Direction,
        dialog: Arc<dyn SipDialog>,
        policy: MediaPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            generation,
            direction,
            remote_identity: dialog.remote_identity(),
            dialog,
            state: RwLock::new(DialogState::Initial),
            policy: RwLock::new(policy),
            local_media: Mutex::new(MediaBundle::default()),
            remote_media: Mutex::new(MediaBundle::default()),
            reattach_attempts: AtomicU32::new(0),
            accepting: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            transport_watch: AtomicBool::new(false),
            media_watch: AtomicBool::new(false),
            remote_listener: AtomicBool::new(false),
            established_sync: AtomicBool::new(false),
            switching: AtomicBool::new(false),
            token,
            started_at: Utc::now(),
            established_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> DialogState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == DialogState::Terminated
    }

    /// Moves to `next` if it lies ahead of the current state.
    pub(crate) fn advance(&self, next: DialogState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if next <= *state {
            return false;
        }
        *state = next;
        if next == DialogState::Established {
            *self
                .established_at
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        }
        true
    }

    pub fn policy(&self) -> MediaPolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_policy(&self, update: impl FnOnce(&mut MediaPolicy)) -> MediaPolicy {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut policy);
        *policy
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerTransport>> {
        self.dialog.peer()
    }

    pub fn local_media(&self) -> MediaBundle {
        self.local_media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remote_media(&self) -> MediaBundle {
        self.remote_media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_local_media(&self, bundle: MediaBundle) {
        *self.local_media.lock().unwrap_or_else(PoisonError::into_inner) = bundle;
    }

    /// Adds tracks not yet in the local bundle, returns whether it grew.
    pub(crate) fn merge_local_tracks(&self, tracks: Vec<MediaTrackRef>) -> bool {
        let mut bundle = self.local_media.lock().unwrap_or_else(PoisonError::into_inner);
        let mut grew = false;
        for track in tracks {
            grew |= bundle.insert(track);
        }
        grew
    }

    pub(crate) fn replace_local_track(&self, old_id: &str, track: MediaTrackRef) {
        self.local_media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(old_id, track);
    }

    /// Folds a remote track into the remote bundle. The bundle never shrinks.
    pub(crate) fn merge_remote_track(&self, track: MediaTrackRef) -> bool {
        self.remote_media
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(track)
    }

    /// Claims one audio re-attach, false once `max` were used.
    pub(crate) fn try_reattach(&self, max: u32) -> bool {
        self.reattach_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            direction: self.direction,
            state: self.state(),
            remote_identity: self.remote_identity.clone(),
            policy: self.policy(),
            started_at: self.started_at,
            established_at: *self
                .established_at
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}
