//! Credential wrapper that keeps tokens out of logs.
//!
//! OAuth tokens, client secrets and engine API keys are held as
//! [`SecretString`]: `Debug` and `Display` print `[REDACTED]`, and
//! `Serialize` writes an empty string, so `warden check` can dump the
//! effective configuration safely.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The real value. Only for request headers and form bodies.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Inline value if set, otherwise the named environment variable.
    pub fn resolve(inline: &SecretString, env_var: Option<&str>) -> Option<SecretString> {
        if !inline.is_empty() {
            return Some(inline.clone());
        }
        let name = env_var?.trim();
        if name.is_empty() {
            return None;
        }
        std::env::var(name)
            .ok()
            .map(SecretString)
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "\"\"")
        } else {
            write!(f, "\"[REDACTED]\"")
        }
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            Ok(())
        } else {
            f.write_str("[REDACTED]")
        }
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString)
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        SecretString(s.to_owned())
    }
}
