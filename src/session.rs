//! Group session facade.
//!
//! Ties one [`KeyExchangeMember`], one [`Transcript`] and one [`MessageLog`]
//! together behind a synchronous API, and queues the user-visible events
//! the embedding application consumes. The session never does I/O; the
//! embedder moves envelopes between sessions and injects timing decisions
//! (such as when an undecryptable message's grace period has expired).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ed25519_dalek::SigningKey;
use tracing::debug;

use crate::aske::{
    FlowDirection, KeyExchangeMember, KeyExchangeMessage, SessionState,
};
use crate::keys::StaticKeyDirectory;
use crate::message_log::MessageLog;
use crate::models::{MessageId, TranscriptMessage};
use crate::transcript::Transcript;
use crate::types::{ConclaveError, Result, SessionId};

/// User-visible session events, drained by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The key-exchange state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Members are being included into the session.
    MemberIncluded { members: Vec<String> },
    /// Members were excluded from the session.
    MemberExcluded { members: Vec<String> },
    /// A payload message entered the log at `index`.
    MessageReady { index: usize, id: MessageId },
    /// Every intended reader has acknowledged the message.
    MessageFullyAcked { id: MessageId },
    /// A message was rejected by the transcript.
    NotAccepted { id: MessageId },
    /// A message is still missing acknowledgements after the embedder's
    /// grace period.
    NotFullyAcked { id: MessageId },
    /// A received message could not be decrypted within the grace period.
    NotDecrypted { sender: String, size: usize },
}

/// A single participant's view of one group conversation.
pub struct GroupSession {
    member: KeyExchangeMember,
    transcript: Rc<RefCell<Transcript>>,
    log: MessageLog,
    events: VecDeque<SessionEvent>,
    last_state: SessionState,
}

impl GroupSession {
    /// Creates a session for one participant.
    pub fn new(
        id: impl Into<String>,
        static_key: SigningKey,
        directory: Rc<dyn StaticKeyDirectory>,
    ) -> Result<Self> {
        let member = KeyExchangeMember::new(id, static_key, directory);
        let transcript = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&transcript), &[])?;
        Ok(Self {
            member,
            transcript,
            log,
            events: VecDeque::new(),
            last_state: SessionState::Init,
        })
    }

    /// This participant's id.
    pub fn id(&self) -> &str {
        self.member.id()
    }

    /// Current key-exchange state.
    pub fn state(&self) -> SessionState {
        self.member.state()
    }

    /// The session id, once derived.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.member.session_id()
    }

    /// Current member list.
    pub fn members(&self) -> &[String] {
        self.member.members()
    }

    /// Whether every member has acknowledged the session.
    pub fn is_established(&self) -> bool {
        self.member.is_session_acknowledged()
    }

    /// The linear message log.
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// The causal transcript.
    pub fn transcript(&self) -> &Rc<RefCell<Transcript>> {
        &self.transcript
    }

    /// Next queued event, if any.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Starts a key exchange with the given other participants.
    pub fn initiate(&mut self, other_members: &[String]) -> Result<KeyExchangeMessage> {
        let message = self.member.commit(other_members)?;
        self.note_state_change();
        Ok(message)
    }

    /// Starts including new participants into the established session.
    pub fn include(&mut self, new_members: &[String]) -> Result<KeyExchangeMessage> {
        let message = self.member.join(new_members)?;
        self.events.push_back(SessionEvent::MemberIncluded {
            members: new_members.to_vec(),
        });
        self.note_state_change();
        Ok(message)
    }

    /// Excludes participants and re-keys the session.
    pub fn exclude(&mut self, members: &[String]) -> Result<KeyExchangeMessage> {
        let message = self.member.exclude(members)?;
        self.events.push_back(SessionEvent::MemberExcluded {
            members: members.to_vec(),
        });
        self.note_state_change();
        Ok(message)
    }

    /// Routes an inbound key-exchange message to the member state machine.
    ///
    /// Returns the message to send out in response, if any. Upflows not
    /// addressed to us are dropped with `None`. Adopting a session with a
    /// changed member list queues include/exclude events.
    pub fn receive_key_exchange(
        &mut self,
        message: &KeyExchangeMessage,
    ) -> Result<Option<KeyExchangeMessage>> {
        let had_session = self.member.session_id().is_some();
        let members_before: Vec<String> = self.member.members().to_vec();

        let reply = match message.flow {
            FlowDirection::Upflow => {
                if message.dest != self.member.id() {
                    debug!(dest = %message.dest, "upflow not addressed to us");
                    None
                } else {
                    Some(self.member.upflow(message)?)
                }
            }
            FlowDirection::Downflow => self.member.downflow(message)?,
        };

        if had_session {
            let included: Vec<String> = self
                .member
                .members()
                .iter()
                .filter(|m| !members_before.contains(m))
                .cloned()
                .collect();
            let excluded: Vec<String> = members_before
                .into_iter()
                .filter(|m| !self.member.members().contains(m))
                .collect();
            if !included.is_empty() {
                self.events
                    .push_back(SessionEvent::MemberIncluded { members: included });
            }
            if !excluded.is_empty() {
                self.events
                    .push_back(SessionEvent::MemberExcluded { members: excluded });
            }
        }

        self.note_state_change();
        Ok(reply)
    }

    /// Authors a payload message on top of the current causal frontier.
    ///
    /// Readers are the current session members minus the author. Returns
    /// the message, ready for the transport.
    pub fn compose(
        &mut self,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
    ) -> Result<TranscriptMessage> {
        if !self.is_established() {
            return Err(ConclaveError::InvalidState(
                "Session is not acknowledged yet".to_string(),
            ));
        }
        let readers: Vec<String> = self
            .member
            .members()
            .iter()
            .filter(|m| *m != self.member.id())
            .cloned()
            .collect();
        let parents = self.transcript.borrow().max()?;
        let message = TranscriptMessage::new(
            id,
            self.member.id().to_string(),
            parents,
            readers,
            body,
        );
        self.accept(message.clone())?;
        Ok(message)
    }

    /// Accepts a payload message into the transcript and the log.
    ///
    /// Queues `MessageReady` for payload messages and `MessageFullyAcked`
    /// for every message this one fully acknowledged. A transcript
    /// rejection queues `NotAccepted` and surfaces the error.
    pub fn accept(&mut self, message: TranscriptMessage) -> Result<()> {
        let id = message.id.clone();
        let newly_acked = match self.transcript.borrow_mut().add(message) {
            Ok(acked) => acked,
            Err(err) => {
                self.events.push_back(SessionEvent::NotAccepted { id });
                return Err(err);
            }
        };
        self.log.ingest(&self.transcript, &id)?;
        if let Some(index) = self.log.index_of(&id) {
            self.events
                .push_back(SessionEvent::MessageReady { index, id: id.clone() });
        }
        for acked in newly_acked {
            self.events
                .push_back(SessionEvent::MessageFullyAcked { id: acked });
        }
        Ok(())
    }

    /// Reports that a message is still unacknowledged after the embedder's
    /// grace period.
    pub fn report_not_fully_acked(&mut self, id: MessageId) {
        self.events.push_back(SessionEvent::NotFullyAcked { id });
    }

    /// Reports a message that could not be decrypted within the grace
    /// period.
    pub fn report_not_decrypted(&mut self, sender: impl Into<String>, size: usize) {
        self.events.push_back(SessionEvent::NotDecrypted {
            sender: sender.into(),
            size,
        });
    }

    fn note_state_change(&mut self) {
        let state = self.member.state();
        if state != self.last_state {
            debug!(member = %self.member.id(), ?state, "session state changed");
            self.events.push_back(SessionEvent::StateChanged {
                from: self.last_state,
                to: state,
            });
            self.last_state = state;
        }
    }
}

impl std::fmt::Debug for GroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSession")
            .field("id", &self.member.id())
            .field("state", &self.member.state())
            .field("log_len", &self.log.len())
            .finish()
    }
}
