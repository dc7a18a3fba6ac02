use super::{FacingMode, MediaBundle, MediaTrack, MediaTrackRef, TrackKind};
use crate::error::MediaError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
    pub facing_mode: Option<FacingMode>,
}

/// Failure reported by the capture backend, named like a DOMException.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    pub name: String,
    pub message: String,
}

impl DeviceError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Local capture-device access (the host's getUserMedia).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        request: CaptureRequest,
    ) -> Result<Vec<MediaTrackRef>, DeviceError>;
}

#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
}

impl MediaAcquirer {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Captures a fresh bundle. Ownership of the tracks passes to the caller.
    pub async fn acquire(&self, want_audio: bool, want_video: bool) -> Result<MediaBundle, MediaError> {
        if !want_audio && !want_video {
            return Err(MediaError::Other("no media kind requested".to_string()));
        }
        let request = CaptureRequest {
            audio: want_audio,
            video: want_video,
            facing_mode: None,
        };
        let tracks = self
            .devices
            .get_user_media(request)
            .await
            .map_err(|e| classify(&e))?;
        let bundle = MediaBundle::new(tracks);

        let missing = (want_audio && bundle.of_kind(TrackKind::Audio).next().is_none())
            || (want_video && bundle.of_kind(TrackKind::Video).next().is_none());
        if missing {
            warn!(
                want_audio,
                want_video,
                got = ?bundle,
                "capture returned fewer kinds than requested"
            );
            bundle.stop_all();
            return Err(MediaError::DeviceNotFound);
        }
        info!(?bundle, "local media acquired");
        Ok(bundle)
    }

    /// Captures a video-only track from the camera facing away from `current`.
    pub async fn switch_facing(&self, current: &dyn MediaTrack) -> Result<MediaTrackRef, MediaError> {
        let facing = current
            .facing_mode()
            .map(FacingMode::opposite)
            .unwrap_or(FacingMode::User);
        debug!(from = ?current.facing_mode(), to = ?facing, "switching camera");

        let request = CaptureRequest {
            audio: false,
            video: true,
            facing_mode: Some(facing),
        };
        let tracks = self
            .devices
            .get_user_media(request)
            .await
            .map_err(|e| classify(&e))?;

        let mut video = None;
        for track in tracks {
            if video.is_none() && track.kind() == TrackKind::Video {
                video = Some(track);
            } else {
                track.stop();
            }
        }
        video.ok_or(MediaError::DeviceNotFound)
    }
}

pub fn classify(error: &DeviceError) -> MediaError {
    match error.name.as_str() {
        "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
            MediaError::PermissionDenied
        }
        "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
            MediaError::DeviceNotFound
        }
        _ => MediaError::Other(format!("{}: {}", error.name, error.message)),
    }
}
