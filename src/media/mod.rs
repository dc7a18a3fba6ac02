use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod acquire;
pub mod peer;
pub mod sdp;

pub use acquire::{CaptureRequest, DeviceError, MediaAcquirer, MediaDevices};
pub use peer::{PeerTransport, RtpReceiver, RtpSender};

pub type TrackId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Live,
    Ended,
}

/// Which physical camera a video capture uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

/// A captured or received media track.
///
/// Implementations are shared handles: `set_enabled` and `stop` act on the
/// underlying device or transport track and are visible to every clone.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn ready_state(&self) -> ReadyState;
    /// Whether the source is currently not delivering media.
    fn muted(&self) -> bool;
    fn facing_mode(&self) -> Option<FacingMode>;
    /// Releases the capture device. Ends the track for good.
    fn stop(&self);

    fn is_live(&self) -> bool {
        self.ready_state() == ReadyState::Live
    }
}

pub type MediaTrackRef = Arc<dyn MediaTrack>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// An ordered set of tracks, unique by track id.
#[derive(Clone, Default)]
pub struct MediaBundle {
    tracks: Vec<MediaTrackRef>,
}

impl MediaBundle {
    pub fn new(tracks: Vec<MediaTrackRef>) -> Self {
        let mut bundle = Self::default();
        for track in tracks {
            bundle.insert(track);
        }
        bundle
    }

    pub fn tracks(&self) -> &[MediaTrackRef] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrackRef> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.tracks.iter().map(|t| t.kind()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == id)
    }

    /// Adds the track unless one with the same id is present.
    pub fn insert(&mut self, track: MediaTrackRef) -> bool {
        if self.contains(track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Puts `track` in the slot of the track with id `old_id`, or appends it.
    pub fn replace(&mut self, old_id: &str, track: MediaTrackRef) {
        match self.tracks.iter().position(|t| t.id() == old_id) {
            Some(pos) => self.tracks[pos] = track,
            None => {
                self.insert(track);
            }
        }
    }

    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.of_kind(TrackKind::Audio).next().is_some(),
            video: self.of_kind(TrackKind::Video).next().is_some(),
        }
    }

    pub fn stop_all(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.tracks
                    .iter()
                    .map(|t| format!("{:?}:{}", t.kind(), t.id())),
            )
            .finish()
    }
}

/// Read-only observation of one sender or receiver slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTrackRecord {
    pub index: usize,
    pub track_id: Option<TrackId>,
    pub kind: Option<TrackKind>,
    pub enabled: bool,
    pub ready_state: Option<ReadyState>,
    pub muted: bool,
}

impl MediaTrackRecord {
    pub fn snapshot(index: usize, track: Option<&dyn MediaTrack>) -> Self {
        match track {
            Some(track) => Self {
                index,
                track_id: Some(track.id().to_string()),
                kind: Some(track.kind()),
                enabled: track.enabled(),
                ready_state: Some(track.ready_state()),
                muted: track.muted(),
            },
            None => Self {
                index,
                track_id: None,
                kind: None,
                enabled: false,
                ready_state: None,
                muted: false,
            },
        }
    }
}
