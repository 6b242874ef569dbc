//! Append-only causal-order transcript.
//!
//! A transcript records the payload messages of one session as a DAG:
//! each accepted message points at its direct causal predecessors. The
//! structure maintains, per message, the set of intended readers that have
//! not yet implicitly acknowledged it (by authoring a causal descendant),
//! and exposes causal-order queries over the whole graph.
//!
//! Invariants enforced on every insert:
//! 1. the graph stays acyclic and all parents are already present,
//! 2. each author's own messages form a chain: a new message must
//!    transitively succeed its author's previous one,
//! 3. the author is never one of the readers,
//! 4. parents come from distinct authors,
//! 5. the author was a reader of every parent,
//! 6. a message cannot be its own parent.
//!
//! Insertion is atomic: a rejected message leaves no trace. If an internal
//! failure ever interrupts the commit itself, the transcript flips into a
//! terminal poisoned state and refuses every further operation.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::merge::{CausalView, MembershipMerger};
use crate::models::{MessageId, TranscriptMessage};
use crate::types::{ConclaveError, Result};

/// Dense per-transcript message index; doubles as the accept-order position.
type Idx = u32;

struct Node {
    msg: TranscriptMessage,
    /// Position of this message in its author's chain.
    author_seq: u32,
    parents: BTreeSet<Idx>,
    successors: BTreeSet<Idx>,
    /// For each reader, the latest message by that reader preceding this
    /// one, if any.
    context: HashMap<String, Option<Idx>>,
    /// Readers that have not yet acknowledged this message.
    unackby: BTreeSet<String>,
}

/// Append-only causal-order graph of session messages.
#[derive(Default)]
pub struct Transcript {
    nodes: Vec<Node>,
    index: HashMap<MessageId, Idx>,
    by_author: HashMap<String, Vec<Idx>>,
    /// Accept-order indices of messages that still have pending readers.
    pending: BTreeSet<Idx>,
    poisoned: bool,
    cache_by: RefCell<HashMap<String, Vec<MessageId>>>,
    cache_unacked: RefCell<Option<Vec<MessageId>>>,
}

impl Transcript {
    /// Creates an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the transcript has entered the terminal poisoned state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn guard(&self) -> Result<()> {
        if self.poisoned {
            Err(ConclaveError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn idx(&self, id: &MessageId) -> Result<Idx> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| ConclaveError::InvalidInput(format!("Unknown message {id}")))
    }

    fn node(&self, idx: Idx) -> &Node {
        &self.nodes[idx as usize]
    }

    /// Count of accepted messages.
    pub fn size(&self) -> Result<usize> {
        self.guard()?;
        Ok(self.nodes.len())
    }

    /// Snapshot of all message ids in accept order.
    pub fn all(&self) -> Result<Vec<MessageId>> {
        self.guard()?;
        Ok(self.nodes.iter().map(|n| n.msg.id.clone()).collect())
    }

    /// Membership test.
    pub fn has(&self, id: &MessageId) -> Result<bool> {
        self.guard()?;
        Ok(self.index.contains_key(id))
    }

    /// The message for an id.
    pub fn get(&self, id: &MessageId) -> Result<&TranscriptMessage> {
        self.guard()?;
        Ok(&self.node(self.idx(id)?).msg)
    }

    /// Author of a message.
    pub fn author(&self, id: &MessageId) -> Result<String> {
        self.guard()?;
        Ok(self.node(self.idx(id)?).msg.author.clone())
    }

    /// Every participant that has authored at least one message.
    pub fn all_authors(&self) -> Result<BTreeSet<String>> {
        self.guard()?;
        Ok(self.by_author.keys().cloned().collect())
    }

    /// Minimal frontier: messages with no parents.
    pub fn min(&self) -> Result<BTreeSet<MessageId>> {
        self.guard()?;
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.parents.is_empty())
            .map(|n| n.msg.id.clone())
            .collect())
    }

    /// Maximal frontier: messages with no successors.
    pub fn max(&self) -> Result<BTreeSet<MessageId>> {
        self.guard()?;
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.successors.is_empty())
            .map(|n| n.msg.id.clone())
            .collect())
    }

    /// Direct parents of a message.
    pub fn pre(&self, id: &MessageId) -> Result<BTreeSet<MessageId>> {
        self.guard()?;
        let idx = self.idx(id)?;
        Ok(self
            .node(idx)
            .parents
            .iter()
            .map(|&p| self.node(p).msg.id.clone())
            .collect())
    }

    /// Direct children of a message.
    pub fn suc(&self, id: &MessageId) -> Result<BTreeSet<MessageId>> {
        self.guard()?;
        let idx = self.idx(id)?;
        Ok(self
            .node(idx)
            .successors
            .iter()
            .map(|&s| self.node(s).msg.id.clone())
            .collect())
    }

    /// Causal less-or-equal; reflexive.
    pub fn le(&self, a: &MessageId, b: &MessageId) -> Result<bool> {
        self.guard()?;
        Ok(self.le_idx(self.idx(a)?, self.idx(b)?))
    }

    /// Causal greater-or-equal; reflexive.
    pub fn ge(&self, a: &MessageId, b: &MessageId) -> Result<bool> {
        self.le(b, a)
    }

    /// Messages authored by `uid`, in authorship order.
    pub fn by(&self, uid: &str) -> Result<Vec<MessageId>> {
        self.guard()?;
        if let Some(cached) = self.cache_by.borrow().get(uid) {
            return Ok(cached.clone());
        }
        let ids: Vec<MessageId> = self
            .by_author
            .get(uid)
            .map(|idxs| idxs.iter().map(|&i| self.node(i).msg.id.clone()).collect())
            .unwrap_or_default();
        self.cache_by
            .borrow_mut()
            .insert(uid.to_string(), ids.clone());
        Ok(ids)
    }

    /// Readers of a message that have not yet acknowledged it.
    pub fn unackby(&self, id: &MessageId) -> Result<BTreeSet<String>> {
        self.guard()?;
        Ok(self.node(self.idx(id)?).unackby.clone())
    }

    /// All messages not yet fully acknowledged, in accept order.
    pub fn unacked(&self) -> Result<Vec<MessageId>> {
        self.guard()?;
        if let Some(cached) = self.cache_unacked.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let ids: Vec<MessageId> = self
            .pending
            .iter()
            .map(|&i| self.node(i).msg.id.clone())
            .collect();
        *self.cache_unacked.borrow_mut() = Some(ids.clone());
        Ok(ids)
    }

    /// The previous message by the same author, if any.
    pub fn pre_uid(&self, id: &MessageId) -> Result<Option<MessageId>> {
        self.guard()?;
        let idx = self.idx(id)?;
        let node = self.node(idx);
        if node.author_seq == 0 {
            return Ok(None);
        }
        let chain = &self.by_author[&node.msg.author];
        Ok(Some(
            self.node(chain[node.author_seq as usize - 1]).msg.id.clone(),
        ))
    }

    /// The latest message by `ruid` visible before `id`, if any.
    pub fn pre_ruid(&self, id: &MessageId, ruid: &str) -> Result<Option<MessageId>> {
        self.guard()?;
        let idx = self.idx(id)?;
        Ok(self
            .node(idx)
            .context
            .get(ruid)
            .copied()
            .flatten()
            .map(|v| self.node(v).msg.id.clone()))
    }

    /// Ancestors of `id`, stopping the walk at any ancestor satisfying
    /// `pred`; returns the satisfying ancestors in accept order.
    pub fn pre_pred(
        &self,
        id: &MessageId,
        pred: &dyn Fn(&TranscriptMessage) -> bool,
    ) -> Result<Vec<MessageId>> {
        self.guard()?;
        let idx = self.idx(id)?;
        let mut queue: VecDeque<Idx> = self.node(idx).parents.iter().copied().collect();
        let mut seen: HashSet<Idx> = queue.iter().copied().collect();
        let mut matches: BTreeSet<Idx> = BTreeSet::new();
        while let Some(n) = queue.pop_front() {
            if pred(&self.node(n).msg) {
                matches.insert(n);
                continue;
            }
            for &p in &self.node(n).parents {
                if seen.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        Ok(matches.iter().map(|&n| self.node(n).msg.id.clone()).collect())
    }

    /// The first causal descendant of `id` authored by `ruid`, if any.
    pub fn suc_ruid(&self, id: &MessageId, ruid: &str) -> Result<Option<MessageId>> {
        self.guard()?;
        let idx = self.idx(id)?;
        let mut queue: VecDeque<Idx> = self.node(idx).successors.iter().copied().collect();
        let mut seen: HashSet<Idx> = queue.iter().copied().collect();
        let mut best: Option<Idx> = None;
        while let Some(n) = queue.pop_front() {
            if self.node(n).msg.author == ruid {
                best = Some(match best {
                    Some(b) => b.min(n),
                    None => n,
                });
                // Later messages by the same author all succeed this one.
                continue;
            }
            for &s in &self.node(n).successors {
                if seen.insert(s) {
                    queue.push_back(s);
                }
            }
        }
        Ok(best.map(|n| self.node(n).msg.id.clone()))
    }

    /// Member-set merge over a set of messages, used to compute the
    /// membership in effect below a prospective child.
    pub fn merge_members(&self, parents: &[MessageId]) -> Result<BTreeSet<String>> {
        self.guard()?;
        let idxs: Vec<Idx> = parents
            .iter()
            .map(|p| self.idx(p))
            .collect::<Result<_>>()?;
        MembershipMerger::new(&TranscriptView { transcript: self }).merge(&idxs)
    }

    /// Inserts a message.
    ///
    /// Validates all invariants first; any rejection leaves the transcript
    /// untouched. On success returns the previously unacknowledged messages
    /// that this insert fully acknowledged, in accept order.
    pub fn add(&mut self, msg: TranscriptMessage) -> Result<Vec<MessageId>> {
        self.guard()?;

        // Invariant checks, in a fixed order, all before any mutation.
        if msg.parents.contains(&msg.id) {
            return Err(ConclaveError::InvalidInput(format!(
                "Message {} references itself as parent",
                msg.id
            )));
        }
        if self.index.contains_key(&msg.id) {
            return Err(ConclaveError::InvalidState(format!(
                "Message {} already in transcript",
                msg.id
            )));
        }
        if msg.id.is_empty() {
            return Err(ConclaveError::InvalidInput("Empty message id".to_string()));
        }
        if msg.author.is_empty() {
            return Err(ConclaveError::InvalidInput(format!(
                "Message {} has no author",
                msg.id
            )));
        }
        if msg.readers.contains(&msg.author) {
            return Err(ConclaveError::InvalidInput(format!(
                "Author {} listed as reader of their own message",
                msg.author
            )));
        }
        let mut parent_idxs: Vec<Idx> = Vec::with_capacity(msg.parents.len());
        for parent in &msg.parents {
            let idx = self.index.get(parent).copied().ok_or_else(|| {
                ConclaveError::InvalidState(format!(
                    "Parent {parent} not in transcript"
                ))
            })?;
            parent_idxs.push(idx);
        }
        let mut parent_authors: HashSet<&str> = HashSet::new();
        for &p in &parent_idxs {
            let parent = &self.node(p).msg;
            if parent.author != msg.author && !parent.readers.contains(&msg.author) {
                return Err(ConclaveError::InvalidState(format!(
                    "Parent {} was not visible to author {}",
                    parent.id, msg.author
                )));
            }
            if !parent_authors.insert(parent.author.as_str()) {
                return Err(ConclaveError::InvalidInput(format!(
                    "Parents of {} share author {}",
                    msg.id, parent.author
                )));
            }
        }
        if let Some(&last) = self.by_author.get(&msg.author).and_then(|c| c.last()) {
            if !parent_idxs.iter().any(|&p| self.le_idx(last, p)) {
                return Err(ConclaveError::InvalidState(format!(
                    "Message {} does not succeed its author's previous message",
                    msg.id
                )));
            }
        }
        if self.nodes.len() >= Idx::MAX as usize {
            return Err(ConclaveError::InvalidState(
                "Transcript is full".to_string(),
            ));
        }

        // Membership of concurrent parents must not conflict.
        if !parent_idxs.is_empty() {
            MembershipMerger::new(&TranscriptView { transcript: self })
                .merge(&parent_idxs)?;
        }

        let context = self.child_context(&msg, &parent_idxs);

        // Commit. Nothing below may reject; an internal failure here
        // poisons the transcript.
        match self.commit(msg, parent_idxs, context) {
            Ok(acked) => Ok(acked),
            Err(err) => {
                warn!(error = %err, "transcript commit failed, poisoning");
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Computes the reader context of a prospective child: parent contexts
    /// merged preferring the causally greater entry, the parents themselves
    /// overlaid, restricted to the child's readers.
    fn child_context(
        &self,
        msg: &TranscriptMessage,
        parent_idxs: &[Idx],
    ) -> HashMap<String, Option<Idx>> {
        let mut merged: HashMap<String, Option<Idx>> = HashMap::new();
        let mut offer = |merged: &mut HashMap<String, Option<Idx>>,
                         pid: &str,
                         candidate: Option<Idx>| {
            match (merged.get(pid).copied().flatten(), candidate) {
                (None, _) => {
                    merged.insert(pid.to_string(), candidate);
                }
                (Some(current), Some(new)) => {
                    // Both are by `pid`, so their chain positions decide.
                    if self.node(new).author_seq > self.node(current).author_seq {
                        merged.insert(pid.to_string(), Some(new));
                    }
                }
                (Some(_), None) => {}
            }
        };
        for &p in parent_idxs {
            for (pid, &entry) in &self.node(p).context {
                offer(&mut merged, pid, entry);
            }
        }
        for &p in parent_idxs {
            let author = self.node(p).msg.author.clone();
            offer(&mut merged, &author, Some(p));
        }
        msg.readers
            .iter()
            .map(|r| (r.clone(), merged.get(r).copied().flatten()))
            .collect()
    }

    fn commit(
        &mut self,
        msg: TranscriptMessage,
        parent_idxs: Vec<Idx>,
        context: HashMap<String, Option<Idx>>,
    ) -> Result<Vec<MessageId>> {
        let idx = self.nodes.len() as Idx;
        let author = msg.author.clone();
        let unackby = msg.readers.clone();

        for &p in &parent_idxs {
            self.nodes[p as usize].successors.insert(idx);
        }
        let chain = self.by_author.entry(author.clone()).or_default();
        let author_seq = chain.len() as u32;
        chain.push(idx);
        if !unackby.is_empty() {
            self.pending.insert(idx);
        }
        self.nodes.push(Node {
            msg,
            author_seq,
            parents: parent_idxs.iter().copied().collect(),
            successors: BTreeSet::new(),
            context,
            unackby,
        });
        if self
            .index
            .insert(self.nodes[idx as usize].msg.id.clone(), idx)
            .is_some()
        {
            return Err(ConclaveError::InvalidState(
                "Message index corrupted during commit".to_string(),
            ));
        }

        self.cache_by.borrow_mut().remove(&author);
        *self.cache_unacked.borrow_mut() = None;

        // Acknowledgement propagation: the new message implicitly acks
        // every ancestor reachable through messages its author had not yet
        // acknowledged.
        let mut queue: VecDeque<Idx> = parent_idxs.into_iter().collect();
        let mut seen: HashSet<Idx> = queue.iter().copied().collect();
        let mut newly_acked: Vec<Idx> = Vec::new();
        while let Some(n) = queue.pop_front() {
            if !self.nodes[n as usize].unackby.remove(&author) {
                continue;
            }
            if self.nodes[n as usize].unackby.is_empty() {
                self.pending.remove(&n);
                newly_acked.push(n);
            }
            let parents: Vec<Idx> =
                self.nodes[n as usize].parents.iter().copied().collect();
            for p in parents {
                if seen.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        newly_acked.sort_unstable();

        debug!(
            id = %self.nodes[idx as usize].msg.id,
            author = %author,
            accepted = self.nodes.len(),
            newly_acked = newly_acked.len(),
            "message accepted"
        );
        Ok(newly_acked
            .into_iter()
            .map(|n| self.node(n).msg.id.clone())
            .collect())
    }

    fn le_idx(&self, a: Idx, b: Idx) -> bool {
        if a == b {
            return true;
        }
        let node_a = self.node(a);
        let node_b = self.node(b);
        if node_a.msg.author == node_b.msg.author {
            return node_a.author_seq <= node_b.author_seq;
        }
        if node_b.msg.readers.contains(&node_a.msg.author) {
            // The context entry is the latest message by a's author that
            // precedes b; a precedes b iff it is no later than that entry.
            return match node_b.context.get(&node_a.msg.author) {
                Some(Some(v)) => node_a.author_seq <= self.node(*v).author_seq,
                _ => false,
            };
        }
        if a > b {
            // Accept order is a linear extension of causal order.
            return false;
        }
        let mut queue: VecDeque<Idx> = node_b.parents.iter().copied().collect();
        let mut seen: HashSet<Idx> = queue.iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if n == a {
                return true;
            }
            if n < a {
                continue;
            }
            for &p in &self.node(n).parents {
                if seen.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        false
    }

    #[cfg(test)]
    fn poison_for_test(&mut self) {
        self.poisoned = true;
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("size", &self.nodes.len())
            .field("pending", &self.pending.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

struct TranscriptView<'a> {
    transcript: &'a Transcript,
}

impl CausalView for TranscriptView<'_> {
    type Node = Idx;

    fn le(&self, a: Idx, b: Idx) -> bool {
        self.transcript.le_idx(a, b)
    }

    fn members(&self, node: Idx) -> BTreeSet<String> {
        self.transcript.node(node).msg.members()
    }
}
