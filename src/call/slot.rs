use super::CallSessionRef;
use crate::error::CallError;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, PoisonError,
};

enum SlotState {
    Idle,
    /// A call is being set up under this generation but has no session yet.
    Pending(u64),
    Active(CallSessionRef),
}

/// Holder of the single active call.
///
/// Every call gets a fresh generation when it reserves the slot. Code that
/// resumes after an await asks `is_live(generation)` before touching the
/// session, so a hangup that cleared the slot meanwhile always wins.
pub struct SessionSlot {
    state: Mutex<SlotState>,
    next_generation: AtomicU64,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            next_generation: AtomicU64::new(1),
        }
    }
}

impl SessionSlot {
    pub fn reserve(&self) -> Result<u64, CallError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            SlotState::Idle => {
                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                *state = SlotState::Pending(generation);
                Ok(generation)
            }
            _ => Err(CallError::Busy),
        }
    }

    /// Promotes a reservation to an active session.
    pub fn install(&self, generation: u64, session: CallSessionRef) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            SlotState::Pending(pending) if pending == generation => {
                *state = SlotState::Active(session);
                true
            }
            _ => false,
        }
    }

    /// Drops a reservation whose setup failed.
    pub fn release(&self, generation: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, SlotState::Pending(pending) if pending == generation) {
            *state = SlotState::Idle;
        }
    }

    /// Empties the slot, cancelling a pending setup as well.
    pub fn take(&self) -> Option<CallSessionRef> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Active(session) => Some(session),
            SlotState::Pending(_) | SlotState::Idle => None,
        }
    }

    pub fn clear_if(&self, generation: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let matches = match &*state {
            SlotState::Active(session) => session.generation == generation,
            SlotState::Pending(pending) => *pending == generation,
            SlotState::Idle => false,
        };
        if matches {
            *state = SlotState::Idle;
        }
        matches
    }

    pub fn current(&self) -> Option<CallSessionRef> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Active(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn is_live(&self, generation: u64) -> bool {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Active(session) => session.generation == generation,
            SlotState::Pending(pending) => *pending == generation,
            SlotState::Idle => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            SlotState::Idle
        )
    }
}
