use crate::call::{
    CallControl, CallManager, CallSessionRef, DialogState, DiagnosticReport, SessionInfo,
};
use crate::config::PhoneConfig;
use crate::error::{CallError, PhoneError, RegistrationError};
use crate::event::{EventReceiver, EventSender, PhoneEvent, Subscription};
use crate::media::{MediaAcquirer, MediaBundle, MediaDevices};
use crate::useragent::{
    normalize_target, EngineEvent, EngineEventReceiver, InboundInvitation, InstantMessage,
    RegisterOption, Registrar, RegistrationState, SipEngine,
};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{
    select,
    sync::{broadcast, broadcast::error::RecvError, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 128;

pub struct SoftphoneBuilder {
    config: Option<PhoneConfig>,
    engine: Option<Arc<dyn SipEngine>>,
    devices: Option<Arc<dyn MediaDevices>>,
    cancel_token: Option<CancellationToken>,
}

pub struct Softphone {
    pub config: Arc<PhoneConfig>,
    engine: Arc<dyn SipEngine>,
    registrar: Registrar,
    calls: CallManager,
    control: CallControl,
    events: EventSender,
    engine_events: Mutex<Option<EngineEventReceiver>>,
    token: CancellationToken,
}

impl Default for SoftphoneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftphoneBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            engine: None,
            devices: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: Option<PhoneConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn SipEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> Result<Softphone> {
        let config = Arc::new(self.config.unwrap_or_default());
        let engine = self
            .engine
            .ok_or_else(|| anyhow!("softphone needs a signaling engine"))?;
        let devices = self
            .devices
            .ok_or_else(|| anyhow!("softphone needs media devices"))?;
        let token = self.cancel_token.unwrap_or_default();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (engine_event_sender, engine_events) = mpsc::unbounded_channel();
        let registrar = Registrar::new(
            engine.clone(),
            events.clone(),
            engine_event_sender,
            config.register_timeout,
            token.child_token(),
        );
        let calls = CallManager::new(
            engine.clone(),
            MediaAcquirer::new(devices),
            events.clone(),
            config.clone(),
            token.child_token(),
        );
        let control = CallControl::new(calls.clone());

        Ok(Softphone {
            config,
            engine,
            registrar,
            calls,
            control,
            events,
            engine_events: Mutex::new(Some(engine_events)),
            token,
        })
    }
}

impl Softphone {
    pub async fn register(&self, mut option: RegisterOption) -> Result<(), RegistrationError> {
        if option.user_agent.is_none() {
            option.user_agent = self.config.useragent.clone();
        }
        self.registrar.connect(option).await
    }

    /// Registers with the saved account from the configuration, if any.
    pub async fn connect_saved(&self) -> Result<bool, RegistrationError> {
        let account = match self.config.account.as_ref() {
            Some(account) => account,
            None => return Ok(false),
        };
        let option = RegisterOption::from_account(account, self.config.ice_servers.clone());
        self.register(option).await?;
        Ok(true)
    }

    pub async fn unregister(&self) -> Result<(), RegistrationError> {
        self.calls.hangup();
        self.registrar.unregister().await
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registrar.state()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn on_incoming_invite(&self) -> Subscription<InboundInvitation> {
        Subscription::new(self.subscribe(), |event| match event {
            PhoneEvent::IncomingInvite(invitation) => Some(invitation),
            _ => None,
        })
    }

    pub fn on_instant_message(&self) -> Subscription<InstantMessage> {
        Subscription::new(self.subscribe(), |event| match event {
            PhoneEvent::InstantMessage(message) => Some(message),
            _ => None,
        })
    }

    pub fn on_session_state_changed(&self) -> Subscription<DialogState> {
        Subscription::new(self.subscribe(), |event| match event {
            PhoneEvent::SessionStateChanged { state, .. } => Some(state),
            _ => None,
        })
    }

    pub fn on_remote_media_updated(&self) -> Subscription<MediaBundle> {
        Subscription::new(self.subscribe(), |event| match event {
            PhoneEvent::RemoteMediaUpdated { bundle, .. } => Some(bundle),
            _ => None,
        })
    }

    pub fn on_local_media_updated(&self) -> Subscription<MediaBundle> {
        Subscription::new(self.subscribe(), |event| match event {
            PhoneEvent::LocalMediaUpdated { bundle, .. } => Some(bundle),
            _ => None,
        })
    }

    fn target(&self, target: &str) -> Result<rsip::Uri, PhoneError> {
        let domain = self.registrar.domain();
        Ok(normalize_target(target, domain.as_deref())?)
    }

    pub async fn place_call(&self, target: &str, with_video: bool) -> Result<CallSessionRef, PhoneError> {
        // a bare target needs the registered domain to resolve
        let caller = match self.registrar.option() {
            Some(option) if self.registrar.is_registered() => option.aor(),
            _ => return Err(CallError::NotRegistered.into()),
        };
        let callee = self.target(target)?;
        Ok(self.calls.place_call(caller, callee, with_video).await?)
    }

    pub async fn accept_call(
        &self,
        invitation: &InboundInvitation,
        with_video: bool,
    ) -> Result<(), PhoneError> {
        Ok(self.calls.accept_call(invitation, with_video).await?)
    }

    pub fn hangup(&self) {
        self.control.hangup();
    }

    pub fn mute(&self, muted: bool) -> bool {
        self.control.mute(muted)
    }

    pub fn hold(&self, on_hold: bool) -> bool {
        self.control.hold(on_hold)
    }

    pub fn toggle_video(&self, enabled: bool) -> bool {
        self.control.toggle_video(enabled)
    }

    pub async fn switch_camera(&self) -> bool {
        self.control.switch_camera().await
    }

    pub fn send_tone(&self, tone: char) -> bool {
        self.control.send_tone(tone)
    }

    pub async fn transfer(&self, target: &str) -> bool {
        match self.target(target) {
            Ok(target) => self.control.transfer(&target).await,
            Err(e) => {
                warn!(dest = target, "transfer target rejected: {}", e);
                false
            }
        }
    }

    pub async fn diagnose_audio(&self) -> DiagnosticReport {
        self.control.diagnose_audio().await
    }

    pub fn get_state(&self) -> Option<DialogState> {
        self.calls.current().map(|s| s.state())
    }

    pub fn is_on_hold(&self) -> bool {
        self.control.is_on_hold()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.calls.current().map(|s| s.info())
    }

    pub async fn send_message(&self, target: &str, body: &str) -> Result<(), PhoneError> {
        if !self.registrar.is_registered() {
            return Err(PhoneError::Message("not registered".to_string()));
        }
        let target = self.target(target)?;
        self.engine.message(&target, body).await.map_err(|e| {
            warn!(dest = %target, "message failed: {}", e);
            PhoneError::Message(e.to_string())
        })?;
        info!(dest = %target, "message sent");
        Ok(())
    }

    /// Pumps engine events until `stop` is called. Runs once per phone.
    pub async fn serve(&self) -> Result<()> {
        let mut engine_events = self
            .engine_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("softphone is already serving"))?;
        let mut phone_events = self.events.subscribe();
        let token = self.token.child_token();

        loop {
            select! {
                _ = token.cancelled() => {
                    info!("cancelled");
                    break;
                }
                event = engine_events.recv() => match event {
                    Some(event) => self.handle_engine_event(event).await,
                    None => {
                        info!("engine event stream closed");
                        break;
                    }
                },
                event = phone_events.recv() => match event {
                    Ok(PhoneEvent::RegistrationStateChanged { state: RegistrationState::Terminated, identity }) => {
                        if self.calls.hangup() {
                            warn!(%identity, "registration terminated, call ended");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "serve loop lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.calls.hangup();
        info!("stopping");
        Ok(())
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::IncomingInvite { dialog, states } => {
                self.calls.on_incoming_invite(dialog, states).await;
            }
            EngineEvent::Message { from, body } => {
                info!(%from, "instant message received");
                self.events
                    .send(PhoneEvent::InstantMessage(InstantMessage::new(from, body)))
                    .ok();
            }
        }
    }

    pub fn stop(&self) {
        info!("stopping");
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests;
