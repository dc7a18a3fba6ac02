use crate::call::DialogState;
use crate::media::MediaBundle;
use crate::useragent::invitation::InboundInvitation;
use crate::useragent::message::InstantMessage;
use crate::useragent::registration::RegistrationState;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::warn;

/// PhoneEvent is everything the core reports back to the UI layer.
#[derive(Debug, Clone)]
pub enum PhoneEvent {
    RegistrationStateChanged {
        identity: String,
        state: RegistrationState,
    },
    IncomingInvite(InboundInvitation),
    InstantMessage(InstantMessage),
    SessionStateChanged {
        session_id: String,
        state: DialogState,
    },
    LocalMediaUpdated {
        session_id: String,
        bundle: MediaBundle,
    },
    RemoteMediaUpdated {
        session_id: String,
        bundle: MediaBundle,
    },
    /// The signaling layer never supplied a peer transport for the call.
    TransportUnavailable { session_id: String },
    /// An established call has no outbound audio sender left.
    NoAudioTrack { session_id: String },
}

pub type EventSender = broadcast::Sender<PhoneEvent>;
pub type EventReceiver = broadcast::Receiver<PhoneEvent>;

/// A typed view on the event bus.
///
/// Dropping the subscription releases its slot on the bus, so there is no
/// listener to remove by hand.
pub struct Subscription<T> {
    receiver: EventReceiver,
    select: fn(PhoneEvent) -> Option<T>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: EventReceiver, select: fn(PhoneEvent) -> Option<T>) -> Self {
        Self { receiver, select }
    }

    /// Waits for the next matching event, `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(value) = (self.select)(event) {
                        return Some(value);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged behind the event bus");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event that is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(value) = (self.select)(event) {
                        return Some(value);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged behind the event bus");
                }
                Err(_) => return None,
            }
        }
    }
}
