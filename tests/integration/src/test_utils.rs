//! Test utilities for multi-device scenarios

use murmur_core::{Config, ManualClock, PeerId};
use murmur_identity::{IdentityKeyStore, InMemorySecureStorage, SecureStorage};
use murmur_mesh::PeerRegistry;
use murmur_session::{SessionEstablisher, SessionInfo};
use std::sync::Arc;

/// One simulated device: its own storage, identity, registry and sessions,
/// all driven by a shared test clock.
pub struct TestDevice {
    pub peer_id: PeerId,
    pub nickname: String,
    pub storage: Arc<dyn SecureStorage>,
    pub identity: Arc<IdentityKeyStore>,
    pub registry: PeerRegistry,
    pub sessions: Arc<SessionEstablisher>,
}

impl TestDevice {
    /// Create a device with in-memory secure storage
    pub fn new(nickname: &str, clock: &Arc<ManualClock>) -> Self {
        Self::with_storage(
            nickname,
            clock,
            Arc::new(InMemorySecureStorage::new()),
            &Config::default(),
        )
    }

    /// Create a device over an existing storage backend
    pub fn with_storage(
        nickname: &str,
        clock: &Arc<ManualClock>,
        storage: Arc<dyn SecureStorage>,
        config: &Config,
    ) -> Self {
        let identity = Arc::new(IdentityKeyStore::with_config(
            storage.clone(),
            &config.identity,
        ));
        identity.ensure_identity().unwrap();

        let registry = PeerRegistry::with_clock(config.registry.clone(), clock.clone());
        let sessions = Arc::new(SessionEstablisher::with_clock(
            identity.clone(),
            config.session.clone(),
            clock.clone(),
        ));

        Self {
            peer_id: PeerId::new(format!("{}-radio", nickname)),
            nickname: nickname.to_string(),
            storage,
            identity,
            registry,
            sessions,
        }
    }

    /// Serialized public identity bundle, as sent over the radio
    pub fn bundle(&self) -> Vec<u8> {
        self.identity.public_identity_bundle().unwrap().to_vec()
    }

    /// Radio layer discovered `other`
    pub fn discover(&self, other: &TestDevice) -> bool {
        self.registry
            .add_or_update_peer(&other.peer_id, &other.nickname)
    }
}

/// Both devices discover each other and run a full handshake, exchanging
/// offers in their fixed-layout wire form.
pub fn connect(a: &TestDevice, b: &TestDevice) -> (SessionInfo, SessionInfo) {
    a.discover(b);
    b.discover(a);

    let a_offer = a.sessions.begin_handshake(&b.peer_id, &b.bundle()).unwrap();
    let b_offer = b.sessions.begin_handshake(&a.peer_id, &a.bundle()).unwrap();

    let a_wire = a_offer.to_bytes();
    let b_wire = b_offer.to_bytes();

    let a_info = a
        .sessions
        .complete_handshake(
            &b.peer_id,
            &murmur_session::HandshakeOffer::from_bytes(&b_wire).unwrap(),
        )
        .unwrap();
    let b_info = b
        .sessions
        .complete_handshake(
            &a.peer_id,
            &murmur_session::HandshakeOffer::from_bytes(&a_wire).unwrap(),
        )
        .unwrap();

    (a_info, b_info)
}

/// Encrypt on `from`, decrypt on `to`
pub fn deliver(from: &TestDevice, to: &TestDevice, message: &[u8]) -> Vec<u8> {
    let frame = from.sessions.encrypt(&to.peer_id, message).unwrap();
    to.sessions.decrypt(&from.peer_id, &frame).unwrap()
}
