use super::{Softphone, SoftphoneBuilder};
use crate::call::tests::common::*;
use crate::call::{DialogState, Direction};
use crate::config::{AccountConfig, PhoneConfig};
use crate::error::{CallError, PhoneError};
use crate::useragent::{RegisterOption, RegistrationState};
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

fn build(config: PhoneConfig) -> (Arc<Softphone>, Arc<FakeEngine>, Arc<FakeDevices>) {
    let engine = FakeEngine::new();
    let devices = Arc::new(FakeDevices::new());
    let phone = SoftphoneBuilder::new()
        .with_config(Some(config))
        .with_engine(engine.clone())
        .with_devices(devices.clone())
        .build()
        .unwrap();
    (Arc::new(phone), engine, devices)
}

fn alice() -> RegisterOption {
    RegisterOption {
        identity: "alice@example.com".to_string(),
        endpoint: "wss://sip.example.com/ws".to_string(),
        display_name: Some("Alice".to_string()),
        credential: None,
        ice_servers: vec![],
        user_agent: None,
    }
}

/// Spawns the serve loop and gives it a moment to subscribe.
async fn serving(phone: &Arc<Softphone>) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let handle = {
        let phone = phone.clone();
        tokio::spawn(async move { phone.serve().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle
}

#[tokio::test]
async fn test_build_requires_engine_and_devices() {
    assert!(SoftphoneBuilder::new().build().is_err());
    assert!(SoftphoneBuilder::new()
        .with_engine(FakeEngine::new())
        .build()
        .is_err());
}

#[tokio::test]
async fn test_place_call_completes_bare_target() {
    let (phone, engine, _) = build(test_config());
    phone.register(alice()).await.unwrap();

    let session = phone.place_call("bob", false).await.unwrap();
    let invites = engine.invites.lock().unwrap().clone();
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].0.to_string(), "sip:bob@example.com");
    assert!(invites[0].1.audio);
    assert!(!invites[0].1.video);

    assert_eq!(phone.get_state(), Some(DialogState::Initial));
    let info = phone.session_info().unwrap();
    assert_eq!(info.id, session.id);
    assert_eq!(info.direction, Direction::Outbound);
    assert_eq!(info.remote_identity, "sip:bob@example.com");
}

#[tokio::test]
async fn test_place_call_requires_registration() {
    let (phone, engine, devices) = build(test_config());
    let err = phone
        .place_call("sip:bob@example.com", false)
        .await
        .unwrap_err();
    assert!(matches!(err, PhoneError::Call(CallError::NotRegistered)));
    assert!(engine.invites.lock().unwrap().is_empty());
    assert!(devices.requests().is_empty());
}

#[tokio::test]
async fn test_bare_target_while_unregistered_reports_registration() {
    let (phone, _, devices) = build(test_config());
    let err = phone.place_call("bob", false).await.unwrap_err();
    assert!(matches!(err, PhoneError::Call(CallError::NotRegistered)));

    let err = phone.send_message("bob", "hi").await.unwrap_err();
    assert!(matches!(err, PhoneError::Message(ref reason) if reason == "not registered"));
    assert!(devices.requests().is_empty());
}

#[tokio::test]
async fn test_place_call_rejects_bad_target_before_capture() {
    let (phone, _, devices) = build(test_config());
    phone.register(alice()).await.unwrap();

    for target in ["", "bob smith", "sip:example.com"] {
        let err = phone.place_call(target, true).await.unwrap_err();
        assert!(
            matches!(err, PhoneError::Call(CallError::InvalidTarget(_))),
            "{:?}",
            target
        );
    }
    assert!(devices.requests().is_empty());
    assert_eq!(phone.get_state(), None);
}

#[tokio::test]
async fn test_serve_delivers_invites_and_messages() {
    let (phone, engine, _) = build(test_config());
    phone.register(alice()).await.unwrap();
    let mut invites = phone.on_incoming_invite();
    let mut messages = phone.on_instant_message();
    let mut states = phone.on_session_state_changed();
    let handle = serving(&phone).await;

    let dialog = FakeDialog::new("sip:carol@example.com", Some(FakePeer::new()));
    let _dialog_states = engine.incoming_invite(dialog.clone());
    let invitation = invites.recv().await.unwrap();
    assert_eq!(invitation.remote_identity(), "sip:carol@example.com");
    assert_eq!(states.recv().await, Some(DialogState::Initial));

    phone.accept_call(&invitation, false).await.unwrap();
    assert_eq!(dialog.calls(), vec!["accept".to_string()]);

    engine.incoming_message("sip:carol@example.com", "are you there?");
    let message = messages.recv().await.unwrap();
    assert_eq!(message.from, "sip:carol@example.com");
    assert_eq!(message.body, "are you there?");

    phone.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(phone.get_state(), None);
}

#[tokio::test]
async fn test_serve_runs_once() {
    let (phone, _, _) = build(test_config());
    let handle = serving(&phone).await;
    assert!(phone.serve().await.is_err());
    phone.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_registration_loss_ends_call() {
    let (phone, engine, _) = build(test_config());
    phone.register(alice()).await.unwrap();
    let handle = serving(&phone).await;
    phone.place_call("bob", false).await.unwrap();
    let dialog = engine.last_dialog();

    engine.emit_registration(0, RegistrationState::Terminated);
    assert!(wait_until(|| phone.get_state().is_none()).await);
    assert!(wait_until(|| dialog.calls() == vec!["cancel".to_string()]).await);
    assert_eq!(phone.registration_state(), RegistrationState::Terminated);

    phone.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_send_message() {
    let (phone, engine, _) = build(test_config());
    let err = phone.send_message("sip:bob@example.com", "hi").await;
    assert!(matches!(err, Err(PhoneError::Message(_))));

    phone.register(alice()).await.unwrap();
    phone.send_message("bob", "hi").await.unwrap();
    assert_eq!(
        engine.messages.lock().unwrap().clone(),
        vec![("sip:bob@example.com".to_string(), "hi".to_string())]
    );

    engine.fail_message.store(true, Ordering::SeqCst);
    let err = phone.send_message("bob", "again").await;
    assert!(matches!(err, Err(PhoneError::Message(_))));
}

#[tokio::test]
async fn test_connect_saved_account() {
    let (phone, _, _) = build(test_config());
    assert!(!phone.connect_saved().await.unwrap());

    let (phone, engine, _) = build(PhoneConfig {
        account: Some(AccountConfig {
            identity: "sip:alice@example.com".to_string(),
            endpoint: "wss://sip.example.com/ws".to_string(),
            password: Some("secret".to_string()),
            display_name: None,
        }),
        ..test_config()
    });
    assert!(phone.connect_saved().await.unwrap());
    assert_eq!(phone.registration_state(), RegistrationState::Registered);
    let registrations = engine.registrations.lock().unwrap();
    let credential = registrations[0].0.credential.clone().unwrap();
    assert_eq!(credential.username, "alice");
    assert_eq!(credential.password, "secret");
    assert_eq!(registrations[0].0.user_agent.as_deref(), Some("rustphone"));
}

#[tokio::test]
async fn test_unregister_hangs_up() {
    let (phone, engine, _) = build(test_config());
    phone.register(alice()).await.unwrap();
    let session = phone.place_call("bob", false).await.unwrap();

    phone.unregister().await.unwrap();
    assert!(engine.unregistered.load(Ordering::SeqCst));
    assert_eq!(phone.registration_state(), RegistrationState::Terminated);
    assert_eq!(phone.get_state(), None);
    assert!(session.local_media().tracks().iter().all(|t| !t.is_live()));
}

#[tokio::test]
async fn test_transfer_resolves_bare_target() {
    let (phone, engine, _) = build(test_config());
    phone.register(alice()).await.unwrap();
    phone.place_call("bob", false).await.unwrap();

    assert!(phone.transfer("carol").await);
    assert!(!phone.transfer("not valid").await);
    assert_eq!(
        engine.last_dialog().calls(),
        vec!["refer:sip:carol@example.com".to_string()]
    );
}
