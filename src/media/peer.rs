use super::{MediaTrackRef, TrackKind};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtcConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for RtcConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => RtcConnectionState::New,
            RTCPeerConnectionState::Connecting => RtcConnectionState::Connecting,
            RTCPeerConnectionState::Connected => RtcConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => RtcConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => RtcConnectionState::Failed,
            RTCPeerConnectionState::Closed => RtcConnectionState::Closed,
            RTCPeerConnectionState::Unspecified => RtcConnectionState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New => IceConnectionState::New,
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            RTCIceConnectionState::Unspecified => IceConnectionState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }
}

#[async_trait]
pub trait RtpSender: Send + Sync {
    fn track(&self) -> Option<MediaTrackRef>;
    /// Swaps the outgoing track without renegotiation.
    async fn replace_track(&self, track: Option<MediaTrackRef>) -> Result<()>;
}

pub trait RtpReceiver: Send + Sync {
    fn track(&self) -> MediaTrackRef;
}

/// The live media transport of one call, owned by the signaling engine.
///
/// The core only observes it and flips sender enablement; it never closes it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn senders(&self) -> Vec<Arc<dyn RtpSender>>;
    fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>>;
    async fn add_track(&self, track: MediaTrackRef) -> Result<Arc<dyn RtpSender>>;
    fn connection_state(&self) -> RtcConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn signaling_state(&self) -> SignalingState;
    fn local_description(&self) -> Option<String>;
    fn remote_description(&self) -> Option<String>;
    /// Remote tracks as they arrive, the `ontrack` stream.
    fn subscribe_remote_tracks(&self) -> broadcast::Receiver<MediaTrackRef>;
}

/// Senders currently carrying a track of `kind`.
pub fn senders_of_kind(peer: &dyn PeerTransport, kind: TrackKind) -> Vec<Arc<dyn RtpSender>> {
    peer.senders()
        .into_iter()
        .filter(|s| s.track().map(|t| t.kind() == kind).unwrap_or(false))
        .collect()
}

/// Flips every sender of `kind` to `enabled`, returns how many were reached.
pub fn set_senders_enabled(peer: &dyn PeerTransport, kind: TrackKind, enabled: bool) -> usize {
    let mut reached = 0;
    for sender in senders_of_kind(peer, kind) {
        if let Some(track) = sender.track() {
            track.set_enabled(enabled);
            reached += 1;
        }
    }
    reached
}
