//! Identity lifecycle: persistence, emergency wipe, configuration.

use crate::test_utils::{connect, deliver, TestDevice};
use murmur_core::{Config, ManualClock};
use murmur_identity::{FileSecureStorage, IdentityError, SecureStorage};
use murmur_session::{SessionError, SessionStateKind};
use std::sync::Arc;

#[test]
fn test_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let config = Config::default();

    let storage: Arc<dyn SecureStorage> = Arc::new(FileSecureStorage::new(dir.path()).unwrap());
    let alice = TestDevice::with_storage("alice", &clock, storage, &config);
    let bob = TestDevice::new("bob", &clock);
    let (_, first) = connect(&alice, &bob);
    let fingerprint = alice.identity.fingerprint().unwrap();
    drop(alice);

    let storage: Arc<dyn SecureStorage> = Arc::new(FileSecureStorage::new(dir.path()).unwrap());
    let restarted = TestDevice::with_storage("alice", &clock, storage, &config);
    assert_eq!(restarted.identity.fingerprint().unwrap(), fingerprint);

    let (a_info, b_info) = connect(&restarted, &bob);
    assert_eq!(b_info.remote_fingerprint, first.remote_fingerprint);
    assert!(b_info.generation > first.generation);
    assert_eq!(a_info.generation, b_info.generation);
    assert_eq!(deliver(&bob, &restarted, b"welcome back"), b"welcome back");
}

#[test]
fn test_emergency_wipe() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let storage: Arc<dyn SecureStorage> = Arc::new(FileSecureStorage::new(dir.path()).unwrap());
    let alice = TestDevice::with_storage("alice", &clock, storage.clone(), &Config::default());
    let bob = TestDevice::new("bob", &clock);
    connect(&alice, &bob);
    let old_fingerprint = alice.identity.fingerprint().unwrap();

    alice.sessions.wipe_all().unwrap();

    assert!(storage.load(alice.identity.record_name()).unwrap().is_none());
    assert!(matches!(
        alice.identity.public_identity_bundle(),
        Err(IdentityError::NotInitialized)
    ));
    assert_eq!(
        alice.sessions.session_state(&bob.peer_id),
        SessionStateKind::Revoked
    );
    assert!(matches!(
        alice.sessions.encrypt(&bob.peer_id, b"secret"),
        Err(SessionError::NoSession(_))
    ));

    let new_fingerprint = alice.identity.ensure_identity().unwrap();
    assert_ne!(new_fingerprint, old_fingerprint);

    let (_, b_info) = connect(&alice, &bob);
    assert_eq!(b_info.remote_fingerprint, new_fingerprint);
    assert_eq!(deliver(&alice, &bob, b"new me"), b"new me");
}

#[test]
fn test_config_drives_components() {
    let config = Config::from_toml_str(
        r#"
        [registry]
        stale_after_secs = 30
        retention_secs = 120

        [session]
        rotation_grace_secs = 5
        max_messages_per_generation = 2
        "#,
    )
    .unwrap();

    let clock = Arc::new(ManualClock::new());
    let alice = TestDevice::with_storage(
        "alice",
        &clock,
        Arc::new(murmur_identity::InMemorySecureStorage::new()),
        &config,
    );
    let bob = TestDevice::with_storage(
        "bob",
        &clock,
        Arc::new(murmur_identity::InMemorySecureStorage::new()),
        &config,
    );
    connect(&alice, &bob);

    deliver(&alice, &bob, b"one");
    deliver(&alice, &bob, b"two");
    assert!(alice.sessions.rotation_required(&bob.peer_id));

    clock.advance(std::time::Duration::from_secs(30));
    assert!(!alice.registry.is_peer_active(&bob.peer_id));

    clock.advance(std::time::Duration::from_secs(90));
    let report = alice.registry.sweep();
    assert_eq!(report.evicted, vec![bob.peer_id.clone()]);
    assert!(alice.registry.peer_nickname(&bob.peer_id).is_none());
}
