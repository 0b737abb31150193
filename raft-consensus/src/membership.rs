//! Static cluster membership and quorum arithmetic.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// The ordered set of voting members, fixed at bootstrap.
///
/// An empty or single-node membership is degenerate but valid: its quorum is 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    members: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    /// Members with sequential IDs `1..=size`.
    pub fn sequential(size: usize) -> Self {
        Self::new(1..=size as NodeId)
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Every member except `id`.
    pub fn peers_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |&m| m != id)
    }

    /// floor(N/2) + 1.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Returns true if the distinct members among `votes` form a quorum.
    /// Non-members are ignored.
    pub fn is_majority<'a>(&self, votes: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let counted: BTreeSet<NodeId> = votes
            .into_iter()
            .copied()
            .filter(|id| self.members.contains(id))
            .collect();
        counted.len() >= self.quorum_size()
    }
}
