//! Error types for the Tether relay

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
///
/// Every variant is recoverable: the relay logs it and, where the protocol
/// calls for a reply, reports it to the originating client as an `error`
/// message tagged with the matching [`ErrorCode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("invalid device key: {0:?}")]
    InvalidIdentity(String),

    #[error("target device {0} is not registered")]
    TargetNotFound(String),

    #[error("no negotiation in flight between {initiator} and {responder}")]
    NoSuchNegotiation { initiator: String, responder: String },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("channel unavailable")]
    ChannelUnavailable,

    #[error("device is not registered on this connection")]
    NotRegistered,
}

impl SignalError {
    /// Shorthand for a missing required field
    pub fn missing_field(field: &str) -> Self {
        SignalError::MalformedMessage(format!("missing required field `{}`", field))
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

/// Wire error codes (sent to clients)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidKey,
    TargetNotFound,
    NoSuchNegotiation,
    MalformedMessage,
    ChannelUnavailable,
    NotRegistered,
}

impl From<&SignalError> for ErrorCode {
    fn from(e: &SignalError) -> Self {
        match e {
            SignalError::InvalidIdentity(_) => ErrorCode::InvalidKey,
            SignalError::TargetNotFound(_) => ErrorCode::TargetNotFound,
            SignalError::NoSuchNegotiation { .. } => ErrorCode::NoSuchNegotiation,
            SignalError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            SignalError::ChannelUnavailable => ErrorCode::ChannelUnavailable,
            SignalError::NotRegistered => ErrorCode::NotRegistered,
        }
    }
}
