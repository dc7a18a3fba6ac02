use crate::call::DialogState;
use crate::config::IceServerItem;
use crate::media::{MediaBundle, MediaConstraints, PeerTransport};
use anyhow::Result;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub mod invitation;
pub mod message;
pub mod registration;
pub mod target;

pub use invitation::InboundInvitation;
pub use message::InstantMessage;
pub use registration::{RegisterOption, Registrar, RegistrationState, UserCredential};
pub use target::normalize_target;

pub type DialogStateSender = mpsc::UnboundedSender<DialogState>;
pub type DialogStateReceiver = mpsc::UnboundedReceiver<DialogState>;
pub type RegistrationStateSender = mpsc::UnboundedSender<RegistrationState>;
pub type RegistrationStateReceiver = mpsc::UnboundedReceiver<RegistrationState>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Unsolicited traffic from the signaling engine.
pub enum EngineEvent {
    IncomingInvite {
        dialog: Arc<dyn SipDialog>,
        states: DialogStateReceiver,
    },
    Message {
        from: String,
        body: String,
    },
}

pub struct InviteOption {
    pub callee: rsip::Uri,
    pub caller: String,
    pub local_media: MediaBundle,
    pub constraints: MediaConstraints,
    pub ice_servers: Vec<IceServerItem>,
}

pub struct AnswerOption {
    pub local_media: MediaBundle,
    pub constraints: MediaConstraints,
    pub ice_servers: Vec<IceServerItem>,
}

/// The SIP-over-WebSocket stack the phone drives.
///
/// Registration and dialog state transitions are pushed through the
/// channels handed to `register` and `invite`; the engine keeps those
/// senders for as long as the registration or dialog lives.
#[async_trait]
pub trait SipEngine: Send + Sync {
    async fn register(
        &self,
        option: RegisterOption,
        states: RegistrationStateSender,
        events: EngineEventSender,
    ) -> Result<()>;
    async fn unregister(&self) -> Result<()>;
    /// Dispatches an INVITE and returns as soon as it is sent.
    async fn invite(
        &self,
        option: InviteOption,
        states: DialogStateSender,
    ) -> Result<Arc<dyn SipDialog>>;
    async fn message(&self, target: &rsip::Uri, body: &str) -> Result<()>;
}

#[async_trait]
pub trait SipDialog: Send + Sync {
    fn id(&self) -> String;
    fn remote_identity(&self) -> String;
    /// The WebRTC transport backing the dialog, once the engine created it.
    fn peer(&self) -> Option<Arc<dyn PeerTransport>>;
    async fn accept(&self, option: AnswerOption) -> Result<()>;
    async fn reject(&self, code: u16) -> Result<()>;
    async fn cancel(&self) -> Result<()>;
    async fn bye(&self) -> Result<()>;
    async fn refer(&self, target: &rsip::Uri) -> Result<()>;
    fn send_dtmf(&self, tone: char, duration: Duration) -> bool;
}
