//! Device identity keys
//!
//! A device key is exactly [`DEVICE_KEY_LENGTH`] characters drawn from
//! `A-Z` and `0-9`. Keys are chosen by clients; the relay only checks the
//! format and that no other live channel currently holds the same key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// Length of a device key in characters
pub const DEVICE_KEY_LENGTH: usize = 10;

/// Characters allowed in a device key
const DEVICE_KEY_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A validated device key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Parse a key, rejecting anything that fails [`validate_device_key`]
    pub fn parse(key: &str) -> Result<Self, SignalError> {
        if validate_device_key(key) {
            Ok(Self(key.to_string()))
        } else {
            Err(SignalError::InvalidIdentity(key.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = SignalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if validate_device_key(&value) {
            Ok(Self(value))
        } else {
            Err(SignalError::InvalidIdentity(value))
        }
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.0
    }
}

/// Check a key against the fixed device key pattern
pub fn validate_device_key(key: &str) -> bool {
    key.len() == DEVICE_KEY_LENGTH && key.bytes().all(|b| DEVICE_KEY_CHARS.contains(&b))
}

/// Generate a random well-formed device key
pub fn generate_device_key() -> Result<DeviceKey, getrandom::Error> {
    let mut bytes = [0u8; DEVICE_KEY_LENGTH];
    getrandom::fill(&mut bytes)?;

    let key: String = bytes
        .iter()
        .map(|b| DEVICE_KEY_CHARS[(*b as usize) % DEVICE_KEY_CHARS.len()] as char)
        .collect();

    Ok(DeviceKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_key_validation() {
        assert!(validate_device_key("AAAA111111"));
        assert!(validate_device_key("Z9Y8X7W6V5"));

        // wrong length
        assert!(!validate_device_key("AAAA11111"));
        assert!(!validate_device_key("AAAA1111111"));
        assert!(!validate_device_key(""));

        // lowercase and punctuation are outside the allowed set
        assert!(!validate_device_key("aaaa111111"));
        assert!(!validate_device_key("AAAA_11111"));
        assert!(!validate_device_key("AAAA-11111"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let err = DeviceKey::parse("nope").unwrap_err();
        assert!(matches!(err, SignalError::InvalidIdentity(ref k) if k == "nope"));

        let key = DeviceKey::parse("BBBB222222").unwrap();
        assert_eq!(key.as_str(), "BBBB222222");
        assert_eq!(key.to_string(), "BBBB222222");
    }

    #[test]
    fn test_generated_keys_are_valid() {
        for _ in 0..32 {
            let key = generate_device_key().unwrap();
            assert!(validate_device_key(key.as_str()));
        }
    }

    #[test]
    fn test_serde_enforces_format() {
        let key: DeviceKey = serde_json::from_str("\"AAAA111111\"").unwrap();
        assert_eq!(key.as_str(), "AAAA111111");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"AAAA111111\"");

        assert!(serde_json::from_str::<DeviceKey>("\"short\"").is_err());
    }
}
