//! Observable linear message log derived from transcripts.
//!
//! The log turns the causal partial order of one or more [`Transcript`]s
//! into a flat, user-visible sequence. Payload messages are appended in the
//! order their transcript accepted them; control messages are filtered out
//! by an ignore predicate, and each appended message records its *payload
//! parents*: the nearest earlier non-ignored messages.
//!
//! A transcript spawned from a previous session may be attached with that
//! parent transcript; the first payload messages of the new transcript then
//! fall back to the parent's resolved frontier. Session merges (more than
//! one parent transcript) are out of scope and rejected.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use tracing::debug;

use crate::models::{MessageId, TranscriptMessage};
use crate::transcript::Transcript;
use crate::types::{ConclaveError, Result};

/// Decides whether a transcript message is kept out of the log.
pub type IgnorePredicate = Box<dyn Fn(&TranscriptMessage) -> bool>;

/// Callback invoked with `(index, id)` for every appended message.
pub type LogSubscriber = Box<dyn FnMut(usize, &MessageId)>;

struct Attachment {
    transcript: Rc<RefCell<Transcript>>,
    /// Payload frontier within this transcript.
    frontier: Vec<MessageId>,
    /// Resolved frontier of the parent transcript at attach time.
    fallback: Vec<MessageId>,
}

/// Linear, observable message sequence over attached transcripts.
pub struct MessageLog {
    entries: Vec<MessageId>,
    positions: HashMap<MessageId, usize>,
    parents: HashMap<MessageId, Vec<MessageId>>,
    owners: HashMap<MessageId, usize>,
    attachments: Vec<Attachment>,
    ignore: IgnorePredicate,
    subscribers: Vec<LogSubscriber>,
}

impl MessageLog {
    /// Creates a log filtering out control messages (empty bodies).
    pub fn new() -> Self {
        Self::with_ignore(Box::new(|m| m.is_control()))
    }

    /// Creates a log with a custom ignore predicate.
    pub fn with_ignore(ignore: IgnorePredicate) -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            parents: HashMap::new(),
            owners: HashMap::new(),
            attachments: Vec::new(),
            ignore,
            subscribers: Vec::new(),
        }
    }

    /// Registers a subscriber notified after every append.
    pub fn subscribe(&mut self, subscriber: LogSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Attaches a transcript the log will ingest messages from.
    ///
    /// `parent_transcripts` names the transcripts the new one was spawned
    /// from; at most one is supported, and it must already be attached.
    pub fn attach(
        &mut self,
        transcript: Rc<RefCell<Transcript>>,
        parent_transcripts: &[Rc<RefCell<Transcript>>],
    ) -> Result<()> {
        if parent_transcripts.len() > 1 {
            return Err(ConclaveError::NotImplemented(
                "Multi-parent transcript subscription".to_string(),
            ));
        }
        if self
            .attachments
            .iter()
            .any(|a| Rc::ptr_eq(&a.transcript, &transcript))
        {
            return Err(ConclaveError::InvalidState(
                "Transcript already attached".to_string(),
            ));
        }
        let fallback = match parent_transcripts.first() {
            None => Vec::new(),
            Some(parent) => {
                let attachment = self
                    .attachments
                    .iter()
                    .find(|a| Rc::ptr_eq(&a.transcript, parent))
                    .ok_or_else(|| {
                        ConclaveError::InvalidInput(
                            "Parent transcript is not attached".to_string(),
                        )
                    })?;
                attachment.frontier.clone()
            }
        };
        self.attachments.push(Attachment {
            transcript,
            frontier: Vec::new(),
            fallback,
        });
        Ok(())
    }

    /// Ingests a message just accepted by an attached transcript.
    ///
    /// Ignored messages are skipped. Payload messages are appended, their
    /// payload parents resolved, and subscribers notified.
    pub fn ingest(
        &mut self,
        transcript: &Rc<RefCell<Transcript>>,
        id: &MessageId,
    ) -> Result<()> {
        let slot = self
            .attachments
            .iter()
            .position(|a| Rc::ptr_eq(&a.transcript, transcript))
            .ok_or_else(|| {
                ConclaveError::InvalidInput("Transcript is not attached".to_string())
            })?;

        let payload_parents = {
            let t = transcript.borrow();
            if (self.ignore)(t.get(id)?) {
                debug!(id = %id, "control message ignored by log");
                return Ok(());
            }
            let ignore = &self.ignore;
            let resolved = t.pre_pred(id, &|m| !ignore(m))?;
            if resolved.is_empty() {
                self.attachments[slot].fallback.clone()
            } else {
                resolved
            }
        };

        let index = self.entries.len();
        self.entries.push(id.clone());
        self.positions.insert(id.clone(), index);
        self.owners.insert(id.clone(), slot);

        let attachment = &mut self.attachments[slot];
        attachment
            .frontier
            .retain(|m| !payload_parents.contains(m));
        attachment.frontier.push(id.clone());
        self.parents.insert(id.clone(), payload_parents);

        debug!(id = %id, index, "message appended to log");
        for subscriber in &mut self.subscribers {
            subscriber(index, id);
        }
        Ok(())
    }

    /// Number of messages in the log.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The message id at position `index`; negative indices count from the
    /// end.
    pub fn at(&self, index: isize) -> Option<&MessageId> {
        let len = self.entries.len() as isize;
        let index = if index < 0 { len + index } else { index };
        if (0..len).contains(&index) {
            self.entries.get(index as usize)
        } else {
            None
        }
    }

    /// Position of a message in the log.
    pub fn index_of(&self, id: &MessageId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Whether the log contains a message.
    pub fn has(&self, id: &MessageId) -> bool {
        self.positions.contains_key(id)
    }

    /// A clamped sub-range of the log, in order.
    pub fn slice(&self, start: usize, end: usize) -> &[MessageId] {
        let end = end.min(self.entries.len());
        let start = start.min(end);
        &self.entries[start..end]
    }

    /// The payload frontier of the most recently attached transcript.
    pub fn cur_parents(&self) -> Vec<MessageId> {
        self.attachments
            .last()
            .map(|a| {
                if a.frontier.is_empty() {
                    a.fallback.clone()
                } else {
                    a.frontier.clone()
                }
            })
            .unwrap_or_default()
    }

    /// The payload parents recorded for a logged message.
    pub fn parents(&self, id: &MessageId) -> Option<&[MessageId]> {
        self.parents.get(id).map(|p| p.as_slice())
    }

    /// Fetches a logged message from its owning transcript.
    pub fn get(&self, id: &MessageId) -> Result<TranscriptMessage> {
        let slot = self.owners.get(id).ok_or_else(|| {
            ConclaveError::InvalidInput(format!("Message {id} is not in the log"))
        })?;
        let t = self.attachments[*slot].transcript.borrow();
        Ok(t.get(id)?.clone())
    }

    /// Readers that have not yet acknowledged a logged message.
    pub fn unackby(&self, id: &MessageId) -> Result<BTreeSet<String>> {
        let slot = self.owners.get(id).ok_or_else(|| {
            ConclaveError::InvalidInput(format!("Message {id} is not in the log"))
        })?;
        self.attachments[*slot].transcript.borrow().unackby(id)
    }

    /// All not-fully-acknowledged messages across attached transcripts,
    /// each transcript's portion in accept order.
    pub fn unacked(&self) -> Result<Vec<MessageId>> {
        let mut merged = Vec::new();
        let mut seen = BTreeSet::new();
        for attachment in &self.attachments {
            for id in attachment.transcript.borrow().unacked()? {
                if seen.insert(id.clone()) {
                    merged.push(id);
                }
            }
        }
        Ok(merged)
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLog")
            .field("len", &self.entries.len())
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn msg(
        id: &str,
        author: &str,
        parents: &[&str],
        readers: &[&str],
        body: &str,
    ) -> TranscriptMessage {
        TranscriptMessage::new(
            id,
            author,
            parents.iter().map(|p| MessageId::from(*p)),
            readers.iter().map(|r| r.to_string()),
            body.as_bytes().to_vec(),
        )
    }

    fn mid(id: &str) -> MessageId {
        MessageId::from(id)
    }

    fn add_and_ingest(
        log: &mut MessageLog,
        transcript: &Rc<RefCell<Transcript>>,
        message: TranscriptMessage,
    ) {
        let id = message.id.clone();
        transcript.borrow_mut().add(message).unwrap();
        log.ingest(transcript, &id).unwrap();
    }

    #[test]
    fn test_appends_in_accept_order() {
        let transcript = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&transcript), &[]).unwrap();

        add_and_ingest(&mut log, &transcript, msg("m1", "alice", &[], &["bob"], "hi"));
        add_and_ingest(&mut log, &transcript, msg("m2", "bob", &["m1"], &["alice"], "hey"));

        assert_eq!(log.len(), 2);
        assert_eq!(log.at(0), Some(&mid("m1")));
        assert_eq!(log.at(1), Some(&mid("m2")));
        assert_eq!(log.at(-1), Some(&mid("m2")));
        assert_eq!(log.at(-2), Some(&mid("m1")));
        assert_eq!(log.at(2), None);
        assert_eq!(log.at(-3), None);
        assert_eq!(log.index_of(&mid("m2")), Some(1));
        assert!(log.has(&mid("m1")));
        assert_eq!(log.slice(0, 2), &[mid("m1"), mid("m2")]);
        assert_eq!(log.slice(1, 99), &[mid("m2")]);
    }

    #[test]
    fn test_control_messages_skipped() {
        let transcript = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&transcript), &[]).unwrap();

        add_and_ingest(&mut log, &transcript, msg("c1", "alice", &[], &["bob"], ""));
        add_and_ingest(&mut log, &transcript, msg("m1", "bob", &["c1"], &["alice"], "hi"));

        assert_eq!(log.len(), 1);
        assert!(!log.has(&mid("c1")));
        // The payload skips over the control message: no payload parents.
        assert_eq!(log.parents(&mid("m1")), Some(&[][..]));
    }

    #[test]
    fn test_payload_parents_skip_ignored() {
        let transcript = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&transcript), &[]).unwrap();

        add_and_ingest(&mut log, &transcript, msg("m1", "alice", &[], &["bob"], "hi"));
        add_and_ingest(&mut log, &transcript, msg("c1", "bob", &["m1"], &["alice"], ""));
        add_and_ingest(&mut log, &transcript, msg("m2", "alice", &["c1"], &["bob"], "more"));

        assert_eq!(log.parents(&mid("m2")), Some(&[mid("m1")][..]));
        assert_eq!(log.cur_parents(), vec![mid("m2")]);
    }

    #[test]
    fn test_subscribers_notified() {
        let transcript = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&transcript), &[]).unwrap();

        let seen: Rc<RefCell<Vec<(usize, MessageId)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        log.subscribe(Box::new(move |index, id| {
            sink.borrow_mut().push((index, id.clone()));
        }));

        add_and_ingest(&mut log, &transcript, msg("m1", "alice", &[], &["bob"], "hi"));
        add_and_ingest(&mut log, &transcript, msg("m2", "bob", &["m1"], &["alice"], "yo"));

        assert_eq!(
            *seen.borrow(),
            vec![(0, mid("m1")), (1, mid("m2"))]
        );
    }

    #[test]
    fn test_parent_transcript_fallback() {
        let first = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&first), &[]).unwrap();
        add_and_ingest(&mut log, &first, msg("m1", "alice", &[], &["bob"], "hi"));
        add_and_ingest(&mut log, &first, msg("m2", "bob", &["m1"], &["alice"], "yo"));

        // A re-keyed session spawns a fresh transcript.
        let second = Rc::new(RefCell::new(Transcript::new()));
        log.attach(Rc::clone(&second), &[Rc::clone(&first)]).unwrap();
        assert_eq!(log.cur_parents(), vec![mid("m2")]);

        add_and_ingest(&mut log, &second, msg("n1", "alice", &[], &["bob"], "again"));
        // The first payload of the new transcript inherits the old frontier.
        assert_eq!(log.parents(&mid("n1")), Some(&[mid("m2")][..]));
        assert_eq!(log.cur_parents(), vec![mid("n1")]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_multi_parent_rejected() {
        let a = Rc::new(RefCell::new(Transcript::new()));
        let b = Rc::new(RefCell::new(Transcript::new()));
        let c = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&a), &[]).unwrap();
        log.attach(Rc::clone(&b), &[]).unwrap();

        let result = log.attach(c, &[a, b]);
        assert!(matches!(result, Err(ConclaveError::NotImplemented(_))));
    }

    #[test]
    fn test_attach_requires_known_parent() {
        let a = Rc::new(RefCell::new(Transcript::new()));
        let b = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        let result = log.attach(b, &[a]);
        assert!(matches!(result, Err(ConclaveError::InvalidInput(_))));
    }

    #[test]
    fn test_ingest_requires_attachment() {
        let a = Rc::new(RefCell::new(Transcript::new()));
        a.borrow_mut()
            .add(msg("m1", "alice", &[], &["bob"], "hi"))
            .unwrap();
        let mut log = MessageLog::new();
        let result = log.ingest(&a, &mid("m1"));
        assert!(matches!(result, Err(ConclaveError::InvalidInput(_))));
    }

    #[test]
    fn test_unacked_merged_across_transcripts() {
        let first = Rc::new(RefCell::new(Transcript::new()));
        let second = Rc::new(RefCell::new(Transcript::new()));
        let mut log = MessageLog::new();
        log.attach(Rc::clone(&first), &[]).unwrap();
        log.attach(Rc::clone(&second), &[Rc::clone(&first)]).unwrap();

        add_and_ingest(&mut log, &first, msg("m1", "alice", &[], &["bob"], "hi"));
        add_and_ingest(&mut log, &second, msg("n1", "bob", &[], &["alice"], "yo"));

        assert_eq!(log.unacked().unwrap(), vec![mid("m1"), mid("n1")]);
        assert_eq!(
            log.unackby(&mid("m1")).unwrap(),
            ["bob"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
        );
    }
}
