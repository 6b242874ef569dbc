//! Conclave - multi-party end-to-end encrypted group chat engine
//!
//! The protocol core between a bulk-message transport and a user-visible
//! message log: an authenticated signature key exchange establishing
//! per-session ephemeral signing keys, and a causally-ordered transcript
//! with acknowledgement tracking and a derived linear log.

mod types;
mod crypto;
mod keys;
mod session_id;
mod envelope;
mod aske;
mod models;
mod merge;
mod transcript;
mod message_log;
mod session;

pub use types::*;
pub use crypto::*;
pub use keys::*;
pub use session_id::*;
pub use envelope::*;
pub use aske::*;
pub use models::*;
pub use merge::*;
pub use transcript::*;
pub use message_log::*;
pub use session::*;
