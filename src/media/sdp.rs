use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use webrtc::sdp::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    fn from_attribute(key: &str) -> Option<Self> {
        match key {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// Direction of the first audio m-line, `None` when there is no audio.
///
/// A media-level attribute wins over the session-level one; with neither
/// present the line is sendrecv.
pub fn audio_direction(sdp: &str) -> Result<Option<MediaDirection>> {
    let mut reader = Cursor::new(sdp.as_bytes());
    let description = SessionDescription::unmarshal(&mut reader)?;

    let audio = match description
        .media_descriptions
        .iter()
        .find(|m| m.media_name.media == "audio")
    {
        Some(audio) => audio,
        None => return Ok(None),
    };

    let media_level = audio
        .attributes
        .iter()
        .find_map(|a| MediaDirection::from_attribute(&a.key));
    let session_level = description
        .attributes
        .iter()
        .find_map(|a| MediaDirection::from_attribute(&a.key));
    Ok(Some(
        media_level
            .or(session_level)
            .unwrap_or(MediaDirection::SendRecv),
    ))
}
