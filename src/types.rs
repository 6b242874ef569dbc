//! Type definitions and protocol constants for Conclave.

use thiserror::Error;

/// Size of a participant nonce in bytes.
pub const NONCE_SIZE: usize = 32;

/// Size of a derived session identifier in bytes.
pub const SESSION_ID_SIZE: usize = 32;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// A derived session identifier (SHA-256 commitment to sorted member/nonce pairs).
pub type SessionId = [u8; SESSION_ID_SIZE];

/// Errors that can occur during Conclave operations.
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// A caller-supplied value violated a structural precondition.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation is not valid in the current protocol or transcript state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A session acknowledgement signature failed to verify.
    #[error("Authentication failed for member {0}")]
    AuthenticationFailed(String),

    /// The static key directory has no entry for a participant.
    #[error("No static key known for {0}")]
    UnknownPeer(String),

    /// A TLV unit could not be decoded.
    #[error("Malformed TLV: {0}")]
    MalformedTlv(String),

    /// A key-exchange envelope was structurally invalid.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The transcript failed mid-commit and refuses all further operations.
    #[error("Transcript is poisoned and rejects all operations")]
    Poisoned,

    /// Reserved functionality.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, ConclaveError>;

impl ConclaveError {
    /// Whether this error left the data structure that raised it unchanged.
    ///
    /// Everything except `Poisoned` is a local, non-mutating rejection; the
    /// caller may retry with different input.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConclaveError::Poisoned)
    }
}
