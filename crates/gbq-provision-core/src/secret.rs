//! Wrapper for token and credential material that must never reach a log line.
//!
//! `Debug`, `Display` and `Serialize` all render [`REDACTED`]. The inner value is
//! zeroized on drop and is only reachable through [`SecretString::expose`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

pub const REDACTED: &str = "[REDACTED]";

#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    pub fn new(inner: impl Into<String>) -> Self {
        Self {
            inner: inner.into(),
        }
    }

    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.trim().is_empty()
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretString").field(&REDACTED).finish()
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = SecretString::new("1//refresh-token-value");
        assert!(!format!("{secret:?}").contains("refresh-token-value"));
        assert_eq!(format!("{secret}"), REDACTED);
    }

    #[test]
    fn serialize_is_redacted_but_deserialize_keeps_value() {
        let secret = SecretString::new("hunter2");
        let json = serde_json::to_string(&secret).expect("serialize");
        assert_eq!(json, format!("\"{REDACTED}\""));

        let parsed: SecretString = serde_json::from_str("\"hunter2\"").expect("deserialize");
        assert_eq!(parsed.expose(), "hunter2");
    }

    #[test]
    fn whitespace_only_counts_as_empty() {
        assert!(SecretString::new("   ").is_empty());
        assert!(!SecretString::new("tok").is_empty());
    }
}
