//! Shared plumbing for the Murmur mesh messenger core.
//!
//! This crate provides the small set of types every other Murmur crate agrees
//! on: peer identifiers, the clock abstraction used for liveness decisions,
//! configuration and logging initialization.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{Config, IdentityConfig, LoggingConfig, RegistryConfig, SessionConfig};
pub use error::{CoreError, Result};
pub use types::{Clock, ManualClock, PeerId, SystemClock};
