//! Tether Core - Shared identity rules, error taxonomy and configuration
//!
//! This crate contains the foundational types used by the signaling relay.
//! It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod identity;

pub use config::{Config, ConfigError, LivenessConfig, LivenessMode, LoggingConfig, ServerConfig};
pub use error::{ErrorCode, SignalError};
pub use identity::{generate_device_key, validate_device_key, DeviceKey, DEVICE_KEY_LENGTH};

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;
