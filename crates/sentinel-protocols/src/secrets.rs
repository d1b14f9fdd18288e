//! Secret Material Isolation
//!
//! Private keys, pre-shared keys, passwords and credential UUIDs are lifted
//! out of descriptors into a [`SecretBundle`]. Descriptors only keep a
//! [`SecretRef`] naming the slot, so they can be logged, listed and shown on
//! the dashboard without exposing credentials.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of a slot in a [`SecretBundle`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(pub String);

impl SecretRef {
    pub fn new(slot: impl Into<String>) -> Self {
        Self(slot.into())
    }

    pub fn slot(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret:{}", self.0)
    }
}

/// A secret value. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value for rendering daemon configs
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([redacted])")
    }
}

/// Secret values belonging to one descriptor, keyed by slot
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBundle {
    entries: BTreeMap<String, Secret>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value and return the reference to embed in the descriptor
    pub fn insert(&mut self, slot: impl Into<String>, value: impl Into<String>) -> SecretRef {
        let slot = slot.into();
        self.entries.insert(slot.clone(), Secret::new(value));
        SecretRef(slot)
    }

    pub fn get(&self, slot: &SecretRef) -> Option<&Secret> {
        self.entries.get(&slot.0)
    }

    /// Resolve a reference or fail with the missing slot name
    pub fn require(&self, slot: &SecretRef) -> Result<&str, MissingSecret> {
        self.get(slot)
            .map(Secret::expose)
            .ok_or_else(|| MissingSecret(slot.0.clone()))
    }

    /// Slot names, without values
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("slots", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A descriptor referenced a slot the bundle does not contain
#[derive(Debug, Clone, thiserror::Error)]
#[error("secret slot '{0}' is missing")]
pub struct MissingSecret(pub String);

/// Key format errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes, got {0})")]
    InvalidLength(usize),
}

/// Check that `s` is a base64-encoded Curve25519 key (WireGuard format)
pub fn validate_wg_key(s: &str) -> Result<(), KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength(bytes.len()));
    }
    Ok(())
}
