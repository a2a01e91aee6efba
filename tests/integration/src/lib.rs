//! Integration tests for the Murmur trust core
//!
//! This test suite validates the three services working together the way a
//! radio transport drives them:
//! - Peer discovery feeding the registry, and registry removals revoking sessions
//! - Symmetric handshakes between independent devices
//! - Rotation, emergency wipe and identity persistence across restarts
//! - Concurrent handshakes against one device

pub mod test_utils;

#[cfg(test)]
mod device_scenarios;

#[cfg(test)]
mod lifecycle_tests;
