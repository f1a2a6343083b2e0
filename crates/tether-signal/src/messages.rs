//! Signal protocol messages
//!
//! Every frame is a JSON object with a kebab-case `type` discriminant and
//! camelCase fields. Offer, answer and candidate payloads are opaque values
//! relayed byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{DeviceKey, ErrorCode, SignalError};

/// Messages sent by devices to the relay
///
/// Fields are optional on the wire so that a missing field is reported as
/// a protocol error naming the field, rather than a generic parse failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind this connection to a device key
    Register { device_key: Option<String> },

    /// Ask a device to connect, carrying the initial offer
    ConnectionRequest {
        source_key: Option<String>,
        target_key: Option<String>,
        offer: Option<Value>,
    },

    /// Accept or reject a connection request
    ConnectionResponse {
        target_key: Option<String>,
        accepted: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Session offer (also used for renegotiation)
    Offer {
        target_key: Option<String>,
        offer: Option<Value>,
    },

    /// Session answer addressed back to the initiator
    Answer {
        target_key: Option<String>,
        answer: Option<Value>,
    },

    /// Trickled network-path candidate
    IceCandidate {
        target_key: Option<String>,
        candidate: Option<Value>,
    },

    /// Application-level keepalive
    Heartbeat,

    /// Tell a peer this device is leaving
    Disconnect { target_key: Option<String> },
}

/// Messages sent by the relay to devices
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RegistrationSuccess { device_key: DeviceKey },

    RegistrationError { code: ErrorCode, message: String },

    Error { code: ErrorCode, message: String },

    ConnectionRequest { source_key: DeviceKey, offer: Value },

    ConnectionAccepted {
        source_key: DeviceKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<Value>,
    },

    ConnectionEstablished { peer_key: DeviceKey },

    ConnectionRejected {
        source_key: DeviceKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Offer { source_key: DeviceKey, offer: Value },

    Answer { source_key: DeviceKey, answer: Value },

    IceCandidate { source_key: DeviceKey, candidate: Value },

    PeerDisconnected { device_key: DeviceKey },

    ForcedDisconnect { reason: String },
}

impl ClientMessage {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, SignalError> {
        serde_json::from_str(json).map_err(|e| SignalError::MalformedMessage(e.to_string()))
    }

    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::ConnectionRequest { .. } => "connection-request",
            ClientMessage::ConnectionResponse { .. } => "connection-response",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::Heartbeat => "heartbeat",
            ClientMessage::Disconnect { .. } => "disconnect",
        }
    }
}

impl ServerMessage {
    /// Create an error message
    pub fn error(err: &SignalError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
