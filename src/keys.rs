//! Long-term identity keys and the static key directory.
//!
//! Participants are authenticated by long-term Ed25519 identity keys. The
//! private half stays with its owner; public halves are resolved through a
//! [`StaticKeyDirectory`], injected by the embedding application. Directory
//! misses surface as [`ConclaveError::UnknownPeer`].

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;

use crate::types::{ConclaveError, Result};

/// Resolves participant ids to long-term public keys.
///
/// Implementations must be pure lookups; key discovery and storage live
/// outside the engine.
pub trait StaticKeyDirectory {
    /// Returns the long-term public key for a participant, if known.
    fn get(&self, pid: &str) -> Option<VerifyingKey>;

    /// Returns the long-term public key or an `UnknownPeer` error.
    fn resolve(&self, pid: &str) -> Result<VerifyingKey> {
        self.get(pid)
            .ok_or_else(|| ConclaveError::UnknownPeer(pid.to_string()))
    }
}

/// In-memory implementation of [`StaticKeyDirectory`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyDirectory {
    keys: HashMap<String, VerifyingKey>,
}

impl InMemoryKeyDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant's long-term public key.
    pub fn insert(&mut self, pid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(pid.into(), key);
    }

    /// Number of registered participants.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl StaticKeyDirectory for InMemoryKeyDirectory {
    fn get(&self, pid: &str) -> Option<VerifyingKey> {
        self.keys.get(pid).copied()
    }
}
