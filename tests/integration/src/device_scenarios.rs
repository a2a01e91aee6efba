//! Multi-device scenarios: discovery, handshake, messaging, disconnect.

use crate::test_utils::{connect, deliver, TestDevice};
use murmur_core::ManualClock;
use murmur_mesh::PresenceEvent;
use murmur_session::{RevocationReason, SessionError, SessionEvent, SessionStateKind};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_two_devices_meet_and_talk() {
    let clock = Arc::new(ManualClock::new());
    let alice = TestDevice::new("alice", &clock);
    let bob = TestDevice::new("bob", &clock);

    let (a_info, b_info) = connect(&alice, &bob);
    assert_eq!(a_info.key_id, b_info.key_id);
    assert_eq!(a_info.remote_fingerprint, bob.identity.fingerprint().unwrap());
    assert_eq!(b_info.remote_fingerprint, alice.identity.fingerprint().unwrap());

    assert_eq!(deliver(&alice, &bob, b"hey bob"), b"hey bob");
    assert_eq!(deliver(&bob, &alice, b"hey alice"), b"hey alice");

    assert!(alice.registry.is_peer_active(&bob.peer_id));
    assert_eq!(
        alice.registry.peer_nickname(&bob.peer_id).as_deref(),
        Some("bob")
    );
}

#[test]
fn test_frames_are_bound_to_their_session() {
    let clock = Arc::new(ManualClock::new());
    let alice = TestDevice::new("alice", &clock);
    let bob = TestDevice::new("bob", &clock);
    let carol = TestDevice::new("carol", &clock);

    connect(&alice, &bob);
    connect(&alice, &carol);
    connect(&bob, &carol);

    let to_bob = alice.sessions.encrypt(&bob.peer_id, b"for bob only").unwrap();
    assert!(matches!(
        carol.sessions.decrypt(&alice.peer_id, &to_bob),
        Err(SessionError::DecryptionFailed)
    ));
    assert!(matches!(
        bob.sessions.decrypt(&carol.peer_id, &to_bob),
        Err(SessionError::DecryptionFailed)
    ));
    assert_eq!(
        bob.sessions.decrypt(&alice.peer_id, &to_bob).unwrap(),
        b"for bob only"
    );
}

#[test]
fn test_staleness_keeps_sessions() {
    let clock = Arc::new(ManualClock::new());
    let alice = TestDevice::new("alice", &clock);
    let bob = TestDevice::new("bob", &clock);
    connect(&alice, &bob);

    clock.advance(Duration::from_secs(181));
    let report = alice.registry.sweep();
    assert_eq!(report.newly_inactive, vec![bob.peer_id.clone()]);
    assert!(!alice.registry.is_peer_active(&bob.peer_id));

    alice.sessions.handle_presence(&PresenceEvent::BecameInactive {
        peer_id: bob.peer_id.clone(),
    });
    assert_eq!(
        alice.sessions.session_state(&bob.peer_id),
        SessionStateKind::Established
    );

    // Heard from again: active, same session.
    alice.registry.update_peer_last_seen(&bob.peer_id);
    assert!(alice.registry.is_peer_active(&bob.peer_id));
    assert_eq!(deliver(&bob, &alice, b"back in range"), b"back in range");
}

#[tokio::test]
async fn test_radio_disconnect_revokes_session() {
    let clock = Arc::new(ManualClock::new());
    let alice = TestDevice::new("alice", &clock);
    let bob = TestDevice::new("bob", &clock);
    connect(&alice, &bob);

    let mut session_events = alice.sessions.subscribe();
    let listener = alice
        .sessions
        .spawn_presence_listener(alice.registry.subscribe());

    alice.registry.remove_peer(&bob.peer_id);

    let event = tokio::time::timeout(Duration::from_secs(5), session_events.recv())
        .await
        .expect("revocation within timeout")
        .unwrap();
    assert_eq!(
        event,
        SessionEvent::Revoked {
            peer_id: bob.peer_id.clone(),
            reason: RevocationReason::PeerRemoved,
        }
    );
    assert!(matches!(
        alice.sessions.encrypt(&bob.peer_id, b"gone"),
        Err(SessionError::NoSession(_))
    ));

    // Rediscovery and a fresh handshake restore the link.
    let (a_info, b_info) = connect(&alice, &bob);
    assert_eq!(a_info.generation, 2);
    assert_eq!(b_info.generation, 2);
    assert_eq!(deliver(&alice, &bob, b"reconnected"), b"reconnected");

    listener.abort();
}

#[test]
fn test_rotation_across_devices() {
    let clock = Arc::new(ManualClock::new());
    let alice = TestDevice::new("alice", &clock);
    let bob = TestDevice::new("bob", &clock);
    connect(&alice, &bob);

    let queued = alice.sessions.encrypt(&bob.peer_id, b"queued").unwrap();

    let a_offer = alice.sessions.rotate(&bob.peer_id).unwrap();
    let b_offer = bob.sessions.rotate(&alice.peer_id).unwrap();
    let a_info = alice.sessions.complete_handshake(&bob.peer_id, &b_offer).unwrap();
    let b_info = bob.sessions.complete_handshake(&alice.peer_id, &a_offer).unwrap();
    assert_eq!(a_info.generation, 2);
    assert_eq!(a_info.key_id, b_info.key_id);

    clock.advance(Duration::from_secs(30));
    assert_eq!(
        bob.sessions.decrypt(&alice.peer_id, &queued).unwrap(),
        b"queued"
    );

    clock.advance(Duration::from_secs(30));
    assert!(matches!(
        bob.sessions.decrypt(&alice.peer_id, &queued),
        Err(SessionError::DecryptionFailed)
    ));
    assert_eq!(deliver(&alice, &bob, b"fresh"), b"fresh");
}

#[test]
fn test_hub_handles_concurrent_handshakes() {
    let clock = Arc::new(ManualClock::new());
    let hub = TestDevice::new("hub", &clock);
    let spokes: Vec<TestDevice> = (0..8)
        .map(|i| TestDevice::new(&format!("spoke{}", i), &clock))
        .collect();

    std::thread::scope(|scope| {
        for spoke in &spokes {
            let hub = &hub;
            scope.spawn(move || {
                connect(hub, spoke);
                assert_eq!(deliver(spoke, hub, b"ping"), b"ping");
            });
        }
    });

    assert_eq!(hub.registry.active_peer_count(), spokes.len());
    assert_eq!(hub.sessions.established_peers().len(), spokes.len());
}
