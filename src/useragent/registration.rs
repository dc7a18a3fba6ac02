use super::{EngineEventSender, RegistrationStateReceiver, SipEngine};
use crate::config::{AccountConfig, IceServerItem};
use crate::error::RegistrationError;
use crate::event::{EventSender, PhoneEvent};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{select, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed(String),
    /// The transport is gone or the user unregistered.
    Terminated,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct RegisterOption {
    /// Address of record, `sip:alice@example.com` or `alice@example.com`.
    pub identity: String,
    /// WebSocket URL of the SIP server.
    pub endpoint: String,
    pub display_name: Option<String>,
    pub credential: Option<UserCredential>,
    #[serde(default)]
    pub ice_servers: Vec<IceServerItem>,
    /// User-Agent header value, filled from the config when unset.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl RegisterOption {
    pub fn from_account(account: &AccountConfig, ice_servers: Vec<IceServerItem>) -> Self {
        let username = account
            .identity
            .trim_start_matches("sips:")
            .trim_start_matches("sip:")
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            identity: account.identity.clone(),
            endpoint: account.endpoint.clone(),
            display_name: account.display_name.clone(),
            credential: account.password.clone().map(|password| UserCredential {
                username,
                password,
                realm: None,
            }),
            ice_servers,
            user_agent: None,
        }
    }

    pub fn identity_uri(&self) -> Result<rsip::Uri, RegistrationError> {
        let identity = self.identity.trim();
        let text = if identity.starts_with("sip:") || identity.starts_with("sips:") {
            identity.to_string()
        } else {
            format!("sip:{}", identity)
        };
        let uri = rsip::Uri::try_from(text.as_str())
            .map_err(|e| RegistrationError::InvalidIdentity(format!("{}: {}", self.identity, e)))?;
        if uri.auth.is_none() {
            return Err(RegistrationError::InvalidIdentity(self.identity.clone()));
        }
        Ok(uri)
    }

    pub fn aor(&self) -> String {
        self.identity_uri()
            .map(|uri| uri.to_string())
            .unwrap_or_else(|_| self.identity.clone())
    }

    /// Host part of the identity, used to complete bare dial strings.
    pub fn domain(&self) -> Option<String> {
        self.identity_uri()
            .ok()
            .map(|uri| uri.host_with_port.host.to_string())
    }
}

struct Attempt {
    id: u64,
    cancel_token: CancellationToken,
}

struct RegistrarInner {
    engine: Arc<dyn SipEngine>,
    events: EventSender,
    engine_events: EngineEventSender,
    register_timeout: Duration,
    token: CancellationToken,
    next_attempt: AtomicU64,
    attempt: Mutex<Option<Attempt>>,
    state: RwLock<RegistrationState>,
    option: RwLock<Option<RegisterOption>>,
}

/// Owns the one process-wide registration.
///
/// Every `connect` starts a new attempt and cancels the previous one, so a
/// saved-credential auto-connect racing a manual login never leaves two
/// timers running: the loser resolves to `Superseded` and its late state
/// reports are ignored.
#[derive(Clone)]
pub struct Registrar {
    inner: Arc<RegistrarInner>,
}

impl Registrar {
    pub fn new(
        engine: Arc<dyn SipEngine>,
        events: EventSender,
        engine_events: EngineEventSender,
        register_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RegistrarInner {
                engine,
                events,
                engine_events,
                register_timeout,
                token,
                next_attempt: AtomicU64::new(1),
                attempt: Mutex::new(None),
                state: RwLock::new(RegistrationState::Unregistered),
                option: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    /// The option of the last successful registration.
    pub fn option(&self) -> Option<RegisterOption> {
        self.inner
            .option
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn domain(&self) -> Option<String> {
        self.option().and_then(|o| o.domain())
    }

    pub async fn connect(&self, option: RegisterOption) -> Result<(), RegistrationError> {
        option.identity_uri()?;
        let aor = option.aor();
        let (attempt, cancel_token) = self.begin_attempt();
        info!(identity = %aor, endpoint = %option.endpoint, attempt, "registering");
        self.update_if_current(attempt, RegistrationState::Registering, &aor);

        let (state_sender, mut state_receiver) = mpsc::unbounded_channel();
        let register_timeout = self.inner.register_timeout;
        let outcome = {
            let engine = self.inner.engine.clone();
            let engine_events = self.inner.engine_events.clone();
            let request = option.clone();
            let wait = async {
                engine
                    .register(request, state_sender, engine_events)
                    .await
                    .map_err(|e| RegistrationError::Engine(e.to_string()))?;
                wait_for_outcome(&mut state_receiver).await
            };
            select! {
                _ = cancel_token.cancelled() => Err(RegistrationError::Superseded),
                result = timeout(register_timeout, wait) => match result {
                    Ok(result) => result,
                    Err(_) => Err(RegistrationError::Timeout(register_timeout)),
                },
            }
        };

        match outcome {
            Ok(()) => {
                if !self.update_if_current(attempt, RegistrationState::Registered, &aor) {
                    return Err(RegistrationError::Superseded);
                }
                *self
                    .inner
                    .option
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(option);
                info!(identity = %aor, attempt, "registered");
                self.spawn_monitor(attempt, aor, state_receiver, cancel_token);
                Ok(())
            }
            Err(RegistrationError::Superseded) => {
                debug!(identity = %aor, attempt, "registration attempt superseded");
                Err(RegistrationError::Superseded)
            }
            Err(e) => {
                warn!(identity = %aor, attempt, "registration failed: {}", e);
                if self.update_if_current(attempt, RegistrationState::Failed(e.to_string()), &aor)
                {
                    self.end_attempt(attempt);
                }
                Err(e)
            }
        }
    }

    /// Cancels any attempt, then de-registers through the engine.
    pub async fn unregister(&self) -> Result<(), RegistrationError> {
        if let Some(previous) = self
            .inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            previous.cancel_token.cancel();
        }
        let aor = self.option().map(|o| o.aor()).unwrap_or_default();
        info!(identity = %aor, "unregistering");
        let result = self
            .inner
            .engine
            .unregister()
            .await
            .map_err(|e| RegistrationError::Engine(e.to_string()));
        self.publish(RegistrationState::Terminated, &aor);
        result
    }

    fn begin_attempt(&self) -> (u64, CancellationToken) {
        let id = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        let cancel_token = self.inner.token.child_token();
        let previous = self
            .inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Attempt {
                id,
                cancel_token: cancel_token.clone(),
            });
        if let Some(previous) = previous {
            debug!(previous = previous.id, attempt = id, "cancelling previous registration");
            previous.cancel_token.cancel();
        }
        (id, cancel_token)
    }

    fn end_attempt(&self, attempt: u64) {
        let mut current = self
            .inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|a| a.id) == Some(attempt) {
            current.take();
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.id == attempt)
            .unwrap_or(false)
    }

    /// Applies `state` only when `attempt` is still the live one.
    fn update_if_current(&self, attempt: u64, state: RegistrationState, identity: &str) -> bool {
        if !self.is_current(attempt) {
            debug!(attempt, ?state, "ignoring state of stale registration attempt");
            return false;
        }
        self.publish(state, identity);
        true
    }

    fn publish(&self, state: RegistrationState, identity: &str) {
        {
            let mut current = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        self.inner
            .events
            .send(PhoneEvent::RegistrationStateChanged {
                identity: identity.to_string(),
                state,
            })
            .ok();
    }

    fn spawn_monitor(
        &self,
        attempt: u64,
        identity: String,
        mut receiver: RegistrationStateReceiver,
        cancel_token: CancellationToken,
    ) {
        let registrar = self.clone();
        tokio::spawn(async move {
            loop {
                let state = select! {
                    _ = cancel_token.cancelled() => break,
                    state = receiver.recv() => state,
                };
                let state = match state {
                    Some(state) => state,
                    None => {
                        warn!(%identity, "registration stream closed by engine");
                        RegistrationState::Terminated
                    }
                };
                info!(%identity, ?state, "registration state changed");
                let terminated = state == RegistrationState::Terminated;
                if !registrar.update_if_current(attempt, state, &identity) || terminated {
                    break;
                }
            }
            registrar.end_attempt(attempt);
        });
    }
}

async fn wait_for_outcome(
    receiver: &mut RegistrationStateReceiver,
) -> Result<(), RegistrationError> {
    while let Some(state) = receiver.recv().await {
        match state {
            RegistrationState::Registered => return Ok(()),
            RegistrationState::Registering => continue,
            RegistrationState::Failed(reason) => {
                return Err(RegistrationError::Rejected { reason })
            }
            RegistrationState::Unregistered => {
                return Err(RegistrationError::Rejected {
                    reason: "unregistered".to_string(),
                })
            }
            RegistrationState::Terminated => {
                return Err(RegistrationError::Rejected {
                    reason: "transport terminated".to_string(),
                })
            }
        }
    }
    Err(RegistrationError::Rejected {
        reason: "engine closed the registration".to_string(),
    })
}
