//! Shared types used across handler configurations

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Wrapper around `SecretString` for credentials inside target configs.
///
/// Target config blobs routinely carry API tokens, MQTT passwords, and
/// object-store keys; those blobs get logged and dumped during diagnosis.
/// This wrapper redacts the value in `Debug`/`Display` output and when
/// serialized, while still deserializing from the plain stored value.
///
/// Call [`expose`](SensitiveString::expose) only at the point the credential
/// is handed to a transport client.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a plain string value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the underlying value
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// True if the wrapped value is the empty string
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}
