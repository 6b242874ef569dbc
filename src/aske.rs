//! Authenticated signature key exchange.
//!
//! A dynamic set of participants agrees on per-session ephemeral signing
//! keys, authenticated by long-term identity keys. The exchange runs in two
//! phases: an *upflow* that travels member to member collecting nonces and
//! ephemeral keys, and a broadcast *downflow* in which every member signs
//! the derived session id to acknowledge it.
//!
//! Each member owns a [`KeyExchangeMember`] that is transitioned by received
//! [`KeyExchangeMessage`]s until [`KeyExchangeMember::is_session_acknowledged`]
//! reports true. Join and exclude re-enter the cycle while preserving the
//! member's identity and, for excluded peers, retaining their last known
//! ephemeral keys.

use std::collections::HashMap;
use std::rc::Rc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::debug;

use crate::crypto::{
    generate_ephemeral_keypair, random_nonce, sign_session_ack, verify_session_ack,
};
use crate::keys::StaticKeyDirectory;
use crate::session_id::derive_session_id;
use crate::types::{ConclaveError, Result, SessionId, NONCE_SIZE, SIGNATURE_SIZE};

/// Direction of a key-exchange message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Member-to-member phase collecting contributions.
    Upflow,
    /// Broadcast acknowledgement phase.
    Downflow,
}

/// Kind of key agreement a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreement {
    /// First agreement of a conversation, started by `commit`.
    Initial,
    /// Follow-up agreement changing an established session (join or
    /// exclude).
    Auxiliary,
}

/// Progress of a member through the exchange.
///
/// `Joining` and `JoinFailed` are reserved; the engine never produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No exchange started.
    Init,
    /// Contributions are still being collected.
    Upflowing,
    /// Session id derived; waiting for acknowledgement signatures.
    AwaitingAcks,
    /// Every member has a verified acknowledgement.
    Acked,
    /// Reserved.
    Joining,
    /// Reserved.
    JoinFailed,
}

/// An immutable key-exchange envelope passed upflow or downflow.
///
/// `nonces` and `ephemeral_keys` are positional: index `i` belongs to
/// `members[i]`. Their lengths never exceed `members.len()`. An empty
/// `dest` means broadcast.
#[derive(Debug, Clone)]
pub struct KeyExchangeMessage {
    pub source: String,
    pub dest: String,
    pub agreement: KeyAgreement,
    pub flow: FlowDirection,
    pub members: Vec<String>,
    pub nonces: Vec<Vec<u8>>,
    pub ephemeral_keys: Vec<VerifyingKey>,
    pub session_signature: Option<[u8; SIGNATURE_SIZE]>,
}

/// Ephemeral key material retained for an excluded member.
#[derive(Debug, Clone)]
pub struct RetiredKey {
    /// The member's last ephemeral public key.
    pub key: VerifyingKey,
    /// Whether the member had authenticated before exclusion.
    pub authenticated: bool,
}

/// Per-participant key-exchange state machine.
pub struct KeyExchangeMember {
    id: String,
    static_key: SigningKey,
    directory: Rc<dyn StaticKeyDirectory>,
    members: Vec<String>,
    nonce: Option<[u8; NONCE_SIZE]>,
    ephemeral_key: Option<SigningKey>,
    nonces: Vec<Vec<u8>>,
    ephemeral_keys: Vec<VerifyingKey>,
    authenticated: Vec<bool>,
    session_id: Option<SessionId>,
    old_ephemeral_keys: HashMap<String, RetiredKey>,
}

impl KeyExchangeMember {
    /// Creates a member for one conversation.
    ///
    /// # Arguments
    /// * `id` - this participant's id
    /// * `static_key` - the long-term identity signing key
    /// * `directory` - resolver for other participants' identity keys
    pub fn new(
        id: impl Into<String>,
        static_key: SigningKey,
        directory: Rc<dyn StaticKeyDirectory>,
    ) -> Self {
        Self {
            id: id.into(),
            static_key,
            directory,
            members: Vec::new(),
            nonce: None,
            ephemeral_key: None,
            nonces: Vec::new(),
            ephemeral_keys: Vec::new(),
            authenticated: Vec::new(),
            session_id: None,
            old_ephemeral_keys: HashMap::new(),
        }
    }

    /// This participant's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current member list, in wire order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// The derived session id, once known.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Our ephemeral public key for the current session, once generated.
    pub fn ephemeral_public_key(&self) -> Option<VerifyingKey> {
        self.ephemeral_key.as_ref().map(|k| k.verifying_key())
    }

    /// Positional ephemeral public keys collected so far.
    pub fn ephemeral_keys(&self) -> &[VerifyingKey] {
        &self.ephemeral_keys
    }

    /// Retained key material for a previously excluded member.
    pub fn old_ephemeral_key(&self, pid: &str) -> Option<&RetiredKey> {
        self.old_ephemeral_keys.get(pid)
    }

    /// True iff every member's acknowledgement signature has verified.
    pub fn is_session_acknowledged(&self) -> bool {
        !self.authenticated.is_empty() && self.authenticated.iter().all(|&a| a)
    }

    /// Informal state of this member, derived from its fields.
    pub fn state(&self) -> SessionState {
        if self.is_session_acknowledged() {
            SessionState::Acked
        } else if self.session_id.is_some() {
            SessionState::AwaitingAcks
        } else if self.nonce.is_some() {
            SessionState::Upflowing
        } else {
            SessionState::Init
        }
    }

    /// Initiates a key exchange with the given other members.
    ///
    /// Resets any previous nonce and ephemeral key, then processes the
    /// initial empty upflow addressed to `[self] ∪ other_members`.
    pub fn commit(&mut self, other_members: &[String]) -> Result<KeyExchangeMessage> {
        if other_members.is_empty() {
            return Err(ConclaveError::InvalidInput(
                "Cannot commit to an empty member list".to_string(),
            ));
        }

        self.nonce = None;
        self.ephemeral_key = None;

        let mut members = Vec::with_capacity(other_members.len() + 1);
        members.push(self.id.clone());
        members.extend_from_slice(other_members);

        self.upflow(&KeyExchangeMessage {
            source: self.id.clone(),
            dest: String::new(),
            agreement: KeyAgreement::Initial,
            flow: FlowDirection::Upflow,
            members,
            nonces: Vec::new(),
            ephemeral_keys: Vec::new(),
            session_signature: None,
        })
    }

    /// Processes an upflow message passing through this member.
    ///
    /// Adds our fresh nonce and ephemeral key. If we are the last member in
    /// the chain, derives the session id and returns the broadcast downflow
    /// carrying our acknowledgement signature; otherwise returns the upflow
    /// addressed to the next member.
    ///
    /// Early precondition failures leave the member state untouched.
    pub fn upflow(&mut self, message: &KeyExchangeMessage) -> Result<KeyExchangeMessage> {
        check_no_duplicates(&message.members)?;
        if message.nonces.len() > message.members.len() {
            return Err(ConclaveError::InvalidInput(format!(
                "Too many nonces on key exchange: {} nonces for {} members",
                message.nonces.len(),
                message.members.len()
            )));
        }
        if message.ephemeral_keys.len() > message.members.len() {
            return Err(ConclaveError::InvalidInput(format!(
                "Too many ephemeral keys on key exchange: {} keys for {} members",
                message.ephemeral_keys.len(),
                message.members.len()
            )));
        }
        let my_pos = message
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| {
                ConclaveError::InvalidInput(format!(
                    "Not a member of this key exchange: {}",
                    self.id
                ))
            })?;

        self.members = message.members.clone();
        self.nonces = message.nonces.clone();
        self.ephemeral_keys = message.ephemeral_keys.clone();

        let nonce = random_nonce();
        let (ephemeral_priv, ephemeral_pub) = generate_ephemeral_keypair();
        self.nonce = Some(nonce);
        self.ephemeral_key = Some(ephemeral_priv);
        self.nonces.push(nonce.to_vec());
        self.ephemeral_keys.push(ephemeral_pub);

        if my_pos == self.members.len() - 1 {
            // End of the chain: derive the session id and open the
            // acknowledgement phase.
            let session_id = derive_session_id(&self.members, &self.nonces);
            self.session_id = Some(session_id);
            self.authenticated = vec![false; self.members.len()];
            self.authenticated[my_pos] = true;

            let signature = sign_session_ack(
                &self.id,
                &ephemeral_pub,
                &nonce,
                &session_id,
                &self.static_key,
            );
            debug!(member = %self.id, "upflow complete, broadcasting downflow");

            Ok(KeyExchangeMessage {
                source: self.id.clone(),
                dest: String::new(),
                agreement: message.agreement,
                flow: FlowDirection::Downflow,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                ephemeral_keys: self.ephemeral_keys.clone(),
                session_signature: Some(signature),
            })
        } else {
            let next = self.members[my_pos + 1].clone();
            debug!(member = %self.id, next = %next, "upflow forwarded");

            Ok(KeyExchangeMessage {
                source: self.id.clone(),
                dest: next,
                agreement: message.agreement,
                flow: FlowDirection::Upflow,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                ephemeral_keys: self.ephemeral_keys.clone(),
                session_signature: None,
            })
        }
    }

    /// Processes a broadcast acknowledgement message.
    ///
    /// If the message carries a session we have not adopted yet, the member
    /// switches to it (resetting authentication tracking) and answers with
    /// its own signed downflow. If the session is already current, the
    /// sender is recorded and `None` is returned, as our own broadcast is
    /// already out.
    ///
    /// A signature that fails to verify aborts this message with
    /// [`ConclaveError::AuthenticationFailed`] but keeps the member in the
    /// acknowledgement phase; later valid downflows may still complete it.
    pub fn downflow(
        &mut self,
        message: &KeyExchangeMessage,
    ) -> Result<Option<KeyExchangeMessage>> {
        check_no_duplicates(&message.members)?;

        let session_id = derive_session_id(&message.members, &message.nonces);
        let adopting = self.session_id != Some(session_id);

        if adopting {
            let my_pos = message
                .members
                .iter()
                .position(|m| *m == self.id)
                .ok_or_else(|| {
                    ConclaveError::InvalidInput(format!(
                        "Not a member of the acknowledged session: {}",
                        self.id
                    ))
                })?;

            self.members = message.members.clone();
            self.nonces = message.nonces.clone();
            self.ephemeral_keys = message.ephemeral_keys.clone();
            self.session_id = Some(session_id);
            self.authenticated = vec![false; self.members.len()];
            self.authenticated[my_pos] = true;
            debug!(member = %self.id, "adopted new session");
        }

        self.verify_member_ack(&message.source, message.session_signature.as_ref())?;
        let sender_pos = self
            .members
            .iter()
            .position(|m| *m == message.source)
            .ok_or_else(|| {
                ConclaveError::InvalidInput(format!(
                    "Sender is not a session member: {}",
                    message.source
                ))
            })?;
        self.authenticated[sender_pos] = true;
        debug!(member = %self.id, sender = %message.source, "acknowledgement verified");

        if !adopting {
            return Ok(None);
        }

        let signature = self.sign_own_ack()?;
        Ok(Some(KeyExchangeMessage {
            source: self.id.clone(),
            dest: String::new(),
            agreement: message.agreement,
            flow: FlowDirection::Downflow,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            ephemeral_keys: self.ephemeral_keys.clone(),
            session_signature: Some(signature),
        }))
    }

    /// Starts including new members into the current session.
    ///
    /// Produces the upflow addressed to the first new member, carrying the
    /// current nonces and ephemeral keys so the newcomers can append their
    /// own contributions.
    pub fn join(&mut self, new_members: &[String]) -> Result<KeyExchangeMessage> {
        if new_members.is_empty() {
            return Err(ConclaveError::InvalidInput(
                "Cannot join an empty member list".to_string(),
            ));
        }
        let mut extended = self.members.clone();
        extended.extend_from_slice(new_members);
        check_no_duplicates(&extended)?;

        self.members = extended;
        debug!(member = %self.id, joining = ?new_members, "join upflow started");

        Ok(KeyExchangeMessage {
            source: self.id.clone(),
            dest: new_members[0].clone(),
            agreement: KeyAgreement::Auxiliary,
            flow: FlowDirection::Upflow,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            ephemeral_keys: self.ephemeral_keys.clone(),
            session_signature: None,
        })
    }

    /// Excludes members from the session and re-keys.
    ///
    /// Their last ephemeral keys are retained in the retired-key store. The
    /// remaining positional arrays stay aligned, the session id is
    /// re-derived, authentication tracking resets, and the returned
    /// broadcast downflow carries our fresh acknowledgement signature.
    pub fn exclude(&mut self, exclude_members: &[String]) -> Result<KeyExchangeMessage> {
        if exclude_members.is_empty() {
            return Err(ConclaveError::InvalidInput(
                "Cannot exclude an empty member list".to_string(),
            ));
        }
        if let Some(unknown) = exclude_members
            .iter()
            .find(|m| !self.members.contains(m))
        {
            return Err(ConclaveError::InvalidInput(format!(
                "Cannot exclude non-member: {unknown}"
            )));
        }
        if exclude_members.iter().any(|m| *m == self.id) {
            return Err(ConclaveError::InvalidInput(
                "Cannot exclude self from the session".to_string(),
            ));
        }

        for pid in exclude_members {
            let pos = self
                .members
                .iter()
                .position(|m| m == pid)
                .ok_or_else(|| {
                    ConclaveError::InvalidState(format!("Member vanished mid-exclude: {pid}"))
                })?;
            if let Some(key) = self.ephemeral_keys.get(pos) {
                self.old_ephemeral_keys.insert(
                    pid.clone(),
                    RetiredKey {
                        key: *key,
                        authenticated: self
                            .authenticated
                            .get(pos)
                            .copied()
                            .unwrap_or(false),
                    },
                );
            }
            self.members.remove(pos);
            if pos < self.nonces.len() {
                self.nonces.remove(pos);
            }
            if pos < self.ephemeral_keys.len() {
                self.ephemeral_keys.remove(pos);
            }
            if pos < self.authenticated.len() {
                self.authenticated.remove(pos);
            }
        }

        let session_id = derive_session_id(&self.members, &self.nonces);
        self.session_id = Some(session_id);
        let my_pos = self
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| {
                ConclaveError::InvalidState("Own id missing after exclude".to_string())
            })?;
        self.authenticated = vec![false; self.members.len()];
        self.authenticated[my_pos] = true;
        debug!(member = %self.id, excluded = ?exclude_members, "session re-keyed");

        let signature = self.sign_own_ack()?;
        Ok(KeyExchangeMessage {
            source: self.id.clone(),
            dest: String::new(),
            agreement: KeyAgreement::Auxiliary,
            flow: FlowDirection::Downflow,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            ephemeral_keys: self.ephemeral_keys.clone(),
            session_signature: Some(signature),
        })
    }

    /// Verifies a member's acknowledgement signature against their
    /// positional slot in the current session.
    fn verify_member_ack(
        &self,
        pid: &str,
        signature: Option<&[u8; SIGNATURE_SIZE]>,
    ) -> Result<()> {
        let session_id = self.session_id.as_ref().ok_or_else(|| {
            ConclaveError::InvalidState(
                "No session id to verify an acknowledgement against".to_string(),
            )
        })?;
        let pos = self
            .members
            .iter()
            .position(|m| m == pid)
            .ok_or_else(|| {
                ConclaveError::InvalidInput(format!("Not a session member: {pid}"))
            })?;
        let ephemeral_key = self.ephemeral_keys.get(pos).ok_or_else(|| {
            ConclaveError::InvalidState(format!("No ephemeral key collected for {pid}"))
        })?;
        let nonce = self.nonces.get(pos).ok_or_else(|| {
            ConclaveError::InvalidState(format!("No nonce collected for {pid}"))
        })?;
        let static_key = self.directory.resolve(pid)?;

        let signature = signature
            .ok_or_else(|| ConclaveError::AuthenticationFailed(pid.to_string()))?;
        let valid = verify_session_ack(
            pid,
            ephemeral_key,
            nonce,
            session_id,
            &static_key,
            signature,
        )?;
        if !valid {
            return Err(ConclaveError::AuthenticationFailed(pid.to_string()));
        }
        Ok(())
    }

    fn sign_own_ack(&self) -> Result<[u8; SIGNATURE_SIZE]> {
        let session_id = self.session_id.as_ref().ok_or_else(|| {
            ConclaveError::InvalidState("No session id to acknowledge".to_string())
        })?;
        let ephemeral_key = self
            .ephemeral_key
            .as_ref()
            .map(|k| k.verifying_key())
            .ok_or_else(|| {
                ConclaveError::InvalidState("No ephemeral key to acknowledge with".to_string())
            })?;
        let nonce = self.nonce.as_ref().ok_or_else(|| {
            ConclaveError::InvalidState("No nonce to acknowledge with".to_string())
        })?;

        Ok(sign_session_ack(
            &self.id,
            &ephemeral_key,
            nonce,
            session_id,
            &self.static_key,
        ))
    }
}

impl std::fmt::Debug for KeyExchangeMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchangeMember")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("state", &self.state())
            .field("session_id", &self.session_id.map(hex::encode))
            .finish()
    }
}

fn check_no_duplicates(members: &[String]) -> Result<()> {
    for (i, member) in members.iter().enumerate() {
        if members[..i].contains(member) {
            return Err(ConclaveError::InvalidInput(format!(
                "Duplicate member in key exchange: {member}"
            )));
        }
    }
    Ok(())
}
