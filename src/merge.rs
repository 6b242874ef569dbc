//! Causal-order-aware membership merging.
//!
//! When a message has several parents, the member set in effect at that
//! message is composed from the parents' member sets. Membership changes
//! are only well-defined when they are causally ordered: if two concurrent
//! parents disagree about the member set, there is no single history that
//! explains both, and the merge must fail.

use std::collections::BTreeSet;

use crate::types::{ConclaveError, Result};

/// The slice of a causal graph the merger needs to see.
///
/// `Node` is whatever handle the graph uses internally; the merger never
/// inspects it beyond equality and the operations below.
pub trait CausalView {
    type Node: Copy + Eq;

    /// Causal less-or-equal: does `a` precede (or equal) `b`?
    fn le(&self, a: Self::Node, b: Self::Node) -> bool;

    /// The member set in effect at `node`.
    fn members(&self, node: Self::Node) -> BTreeSet<String>;
}

/// Merges parent member sets under a [`CausalView`].
pub struct MembershipMerger<'a, V: CausalView> {
    view: &'a V,
}

impl<'a, V: CausalView> MembershipMerger<'a, V> {
    pub fn new(view: &'a V) -> Self {
        Self { view }
    }

    /// Composes the member set resulting from the given parents.
    ///
    /// All parents whose member sets differ must be totally ordered by the
    /// causal relation; the causally greatest set wins. Two concurrent
    /// parents with different member sets are a conflict and fail with
    /// `InvalidState`.
    pub fn merge(&self, parents: &[V::Node]) -> Result<BTreeSet<String>> {
        let Some(&first) = parents.first() else {
            return Err(ConclaveError::InvalidInput(
                "Cannot merge an empty parent set".to_string(),
            ));
        };

        let mut greatest = first;
        let mut greatest_members = self.view.members(first);

        for &parent in &parents[1..] {
            let members = self.view.members(parent);
            if members == greatest_members {
                continue;
            }
            // Sets differ: the parents must be causally ordered.
            if self.view.le(greatest, parent) {
                greatest = parent;
                greatest_members = members;
            } else if !self.view.le(parent, greatest) {
                return Err(ConclaveError::InvalidState(
                    "Concurrent conflicting membership change".to_string(),
                ));
            }
        }

        // The winner must dominate every parent it disagrees with, not just
        // the ones seen before it took the lead.
        for &parent in parents {
            if self.view.members(parent) != greatest_members
                && !self.view.le(parent, greatest)
            {
                return Err(ConclaveError::InvalidState(
                    "Concurrent conflicting membership change".to_string(),
                ));
            }
        }

        Ok(greatest_members)
    }
}
