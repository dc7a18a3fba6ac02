use super::SipDialog;
use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};

struct InvitationInner {
    session_id: String,
    generation: u64,
    remote_identity: String,
    dialog: Arc<dyn SipDialog>,
    received_at: DateTime<Utc>,
}

/// A ringing inbound call, handed to the UI through `on_incoming_invite`.
///
/// It stays valid only while its session is the pending inbound one; once
/// the caller cancels or the session is hung up, accepting it fails with
/// `InvitationGone`.
#[derive(Clone)]
pub struct InboundInvitation {
    inner: Arc<InvitationInner>,
}

impl InboundInvitation {
    pub(crate) fn new(session_id: String, generation: u64, dialog: Arc<dyn SipDialog>) -> Self {
        Self {
            inner: Arc::new(InvitationInner {
                session_id,
                generation,
                remote_identity: dialog.remote_identity(),
                dialog,
                received_at: Utc::now(),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn remote_identity(&self) -> &str {
        &self.inner.remote_identity
    }

    pub fn dialog_id(&self) -> String {
        self.inner.dialog.id()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.inner.received_at
    }
}

impl fmt::Debug for InboundInvitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundInvitation")
            .field("session_id", &self.inner.session_id)
            .field("generation", &self.inner.generation)
            .field("remote_identity", &self.inner.remote_identity)
            .field("received_at", &self.inner.received_at)
            .finish()
    }
}
