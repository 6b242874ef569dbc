//! Hashing, randomness and session-acknowledgement signatures.
//!
//! Every cryptographic operation the engine performs goes through this
//! module: SHA-256, nonce generation, ephemeral Ed25519 keypairs, and the
//! signature over the session acknowledgement bytes that authenticates a
//! member's ephemeral key with their long-term identity key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::types::{
    ConclaveError, Result, SessionId, NONCE_SIZE, SIGNATURE_SIZE,
};

/// Computes the SHA-256 digest of the given bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Draws a fresh 256-bit nonce from the OS CSPRNG.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generates a fresh ephemeral Ed25519 signing keypair.
///
/// One keypair is generated per participant per session; it is discarded
/// when the session is re-keyed.
pub fn generate_ephemeral_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Derives an Ed25519 keypair deterministically from a 32-byte seed.
///
/// # Arguments
/// * `seed` - 32-byte seed
///
/// # Returns
/// Tuple of (signing_key, verifying_key)
pub fn keypair_from_seed(seed: &[u8]) -> Result<(SigningKey, VerifyingKey)> {
    let seed: [u8; 32] = seed.try_into().map_err(|_| {
        ConclaveError::InvalidInput(format!(
            "Seed must be 32 bytes, got {}",
            seed.len()
        ))
    })?;
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();
    Ok((signing_key, verifying_key))
}

/// Builds the raw acknowledgement bytes a member signs for a session.
///
/// Layout is the plain concatenation `id || ek_pub || nonce || session_id`.
pub fn session_ack_bytes(
    id: &str,
    ephemeral_key: &VerifyingKey,
    nonce: &[u8],
    session_id: &SessionId,
) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(id.len() + 32 + nonce.len() + session_id.len());
    bytes.extend_from_slice(id.as_bytes());
    bytes.extend_from_slice(ephemeral_key.as_bytes());
    bytes.extend_from_slice(nonce);
    bytes.extend_from_slice(session_id);
    bytes
}

/// Signs a session acknowledgement with the member's long-term identity key.
///
/// The acknowledgement bytes are hashed with SHA-256 before signing, so the
/// signed payload has a fixed size regardless of the member id length.
pub fn sign_session_ack(
    id: &str,
    ephemeral_key: &VerifyingKey,
    nonce: &[u8],
    session_id: &SessionId,
    static_key: &SigningKey,
) -> [u8; SIGNATURE_SIZE] {
    let digest = sha256(&session_ack_bytes(id, ephemeral_key, nonce, session_id));
    static_key.sign(&digest).to_bytes()
}

/// Verifies a session acknowledgement against a member's long-term public key.
///
/// Reconstructs the acknowledgement bytes from the member's positional slot
/// data and checks the signature.
///
/// # Returns
/// `true` if the signature is valid
pub fn verify_session_ack(
    id: &str,
    ephemeral_key: &VerifyingKey,
    nonce: &[u8],
    session_id: &SessionId,
    static_key: &VerifyingKey,
    signature: &[u8],
) -> Result<bool> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(ConclaveError::MalformedMessage(format!(
            "Session signature must be {} bytes, got {}",
            SIGNATURE_SIZE,
            signature.len()
        )));
    }

    let signature_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| ConclaveError::MalformedMessage("Invalid signature bytes".into()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let digest = sha256(&session_ack_bytes(id, ephemeral_key, nonce, session_id));
    Ok(static_key.verify(&digest, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_SEED: [u8; 32] = [0x01; 32];
    const BOB_SEED: [u8; 32] = [0x02; 32];

    #[test]
    fn test_sha256_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_random_nonce_uniqueness() {
        let a = random_nonce();
        let b = random_nonce();
        assert_ne!(a, b);
    }

    #[test]
    fn test_keypair_from_seed_deterministic() {
        let (_, pub1) = keypair_from_seed(&ALICE_SEED).unwrap();
        let (_, pub2) = keypair_from_seed(&ALICE_SEED).unwrap();
        assert_eq!(pub1.as_bytes(), pub2.as_bytes());

        let (_, pub3) = keypair_from_seed(&BOB_SEED).unwrap();
        assert_ne!(pub1.as_bytes(), pub3.as_bytes());
    }

    #[test]
    fn test_keypair_from_seed_invalid_length() {
        let result = keypair_from_seed(b"too short");
        assert!(matches!(result, Err(ConclaveError::InvalidInput(_))));
    }

    #[test]
    fn test_ack_sign_and_verify() {
        let (static_priv, static_pub) = keypair_from_seed(&ALICE_SEED).unwrap();
        let (_, ephemeral_pub) = keypair_from_seed(&BOB_SEED).unwrap();
        let nonce = [0xAA; 32];
        let session_id = [0x42; 32];

        let sig =
            sign_session_ack("alice", &ephemeral_pub, &nonce, &session_id, &static_priv);
        let valid = verify_session_ack(
            "alice",
            &ephemeral_pub,
            &nonce,
            &session_id,
            &static_pub,
            &sig,
        )
        .unwrap();
        assert!(valid);
    }

    #[test]
    fn test_ack_verify_rejects_tampered_fields() {
        let (static_priv, static_pub) = keypair_from_seed(&ALICE_SEED).unwrap();
        let (_, ephemeral_pub) = keypair_from_seed(&BOB_SEED).unwrap();
        let nonce = [0xAA; 32];
        let session_id = [0x42; 32];

        let sig =
            sign_session_ack("alice", &ephemeral_pub, &nonce, &session_id, &static_priv);

        // Wrong member id.
        assert!(!verify_session_ack(
            "mallory",
            &ephemeral_pub,
            &nonce,
            &session_id,
            &static_pub,
            &sig
        )
        .unwrap());

        // Wrong session id.
        let other_session = [0x43; 32];
        assert!(!verify_session_ack(
            "alice",
            &ephemeral_pub,
            &nonce,
            &other_session,
            &static_pub,
            &sig
        )
        .unwrap());

        // Wrong static key.
        let (_, wrong_pub) = keypair_from_seed(&BOB_SEED).unwrap();
        assert!(!verify_session_ack(
            "alice",
            &ephemeral_pub,
            &nonce,
            &session_id,
            &wrong_pub,
            &sig
        )
        .unwrap());
    }

    #[test]
    fn test_ack_verify_invalid_signature_length() {
        let (_, static_pub) = keypair_from_seed(&ALICE_SEED).unwrap();
        let (_, ephemeral_pub) = keypair_from_seed(&BOB_SEED).unwrap();
        let result = verify_session_ack(
            "alice",
            &ephemeral_pub,
            &[0xAA; 32],
            &[0x42; 32],
            &static_pub,
            &[0u8; 10],
        );
        assert!(matches!(result, Err(ConclaveError::MalformedMessage(_))));
    }
}
