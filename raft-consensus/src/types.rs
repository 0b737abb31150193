//! Core identifiers and records shared by every consensus component.

use serde::{Deserialize, Serialize};

/// A node ID. Unique within a cluster and stable for the lifetime of a member.
pub type NodeId = u64;

/// A leader term number. Increases monotonically on every node.
pub type Term = u64;

/// A log position. Index 0 is a sentinel with term 0; real entries start at 1.
pub type Index = u64;

/// A replicated log entry.
///
/// The payload is opaque to the consensus core. An empty payload marks the
/// no-op entry a new leader appends on accession; appliers skip those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: Index, term: Term, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }

    /// Returns true for the empty entry appended by a newly elected leader.
    pub fn is_noop(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The role a node currently holds. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateRole {
    Follower,
    Candidate,
    Leader,
}

/// Node state that must survive a crash: term, vote, and commit index.
///
/// Losing `term` or `voted_for` across a restart would let a node vote twice
/// in one term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit: Index,
}
