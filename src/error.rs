use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("registration rejected: {reason}")]
    Rejected { reason: String },
    #[error("registration timed out after {0:?}")]
    Timeout(Duration),
    #[error("registration superseded by a newer attempt")]
    Superseded,
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("signaling engine: {0}")]
    Engine(String),
}

/// Classified capture-device failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture media was denied")]
    PermissionDenied,
    #[error("no capture device matches the request")]
    DeviceNotFound,
    #[error("media capture failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("not registered")]
    NotRegistered,
    #[error("another call is already active")]
    Busy,
    #[error("invitation is no longer pending")]
    InvitationGone,
    #[error("call was hung up before setup completed")]
    Cancelled,
    #[error("signaling failed: {0}")]
    Signaling(String),
}

#[derive(Debug, Error)]
pub enum PhoneError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("message not sent: {0}")]
    Message(String),
}
