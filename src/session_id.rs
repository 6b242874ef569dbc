//! Session identifier derivation.
//!
//! The session id is a SHA-256 commitment to the set of participants and
//! their nonces. Members and nonces are paired positionally; pairs are
//! sorted by participant id before hashing, so the result is invariant
//! under any reordering of the input.

use sha2::{Digest, Sha256};

use crate::types::SessionId;

/// Derives the session id from positional member/nonce pairs.
///
/// Pids are sorted lexicographically; the digest input is the concatenation
/// of all sorted pids followed by the nonces reordered to match the sorted
/// pids. Empty pids are skipped. Members beyond the length of `nonces` do
/// not contribute (their nonce has not been collected yet).
///
/// # Arguments
/// * `members` - participant ids, in wire order
/// * `nonces` - participant nonces, positionally aligned with `members`
pub fn derive_session_id(members: &[String], nonces: &[Vec<u8>]) -> SessionId {
    let mut pairs: Vec<(&str, &[u8])> = members
        .iter()
        .zip(nonces.iter())
        .filter(|(pid, _)| !pid.is_empty())
        .map(|(pid, nonce)| (pid.as_str(), nonce.as_slice()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (pid, _) in &pairs {
        hasher.update(pid.as_bytes());
    }
    for (_, nonce) in &pairs {
        hasher.update(nonce);
    }
    hasher.finalize().into()
}
