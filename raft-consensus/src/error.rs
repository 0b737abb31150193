//! Error types for the consensus core.
//!
//! Every error here is recoverable. `NotLeader`, `ProposalDropped`,
//! `QuorumLost` and `Timeout` reach external callers, who should treat them
//! as "retry later". `StaleTerm` and `LogMismatch` are produced and handled
//! inside a node (stale replies, log backtracking) and never escape it.

use std::time::Duration;

use thiserror::Error;

use crate::types::{Index, NodeId, Term};

/// Consensus error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("stale term {stale} from node {from}, current term is {current}")]
    StaleTerm {
        from: NodeId,
        stale: Term,
        current: Term,
    },

    #[error("log mismatch at index {index} (expected term {term})")]
    LogMismatch { index: Index, term: Term },

    #[error("quorum lost: {active} of {quorum} required nodes active")]
    QuorumLost { active: usize, quorum: usize },

    #[error("proposal at index {index} was replaced before it committed")]
    ProposalDropped { index: Index },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("node {0} has shut down")]
    Shutdown(NodeId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

impl RaftError {
    /// Returns true if the caller should retry later, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::ProposalDropped { .. }
                | RaftError::QuorumLost { .. }
                | RaftError::Timeout { .. }
        )
    }

    /// The leader hint carried by a `NotLeader` error.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            RaftError::NotLeader { leader_hint } => *leader_hint,
            _ => None,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        RaftError::Timeout {
            what: what.into(),
            after,
        }
    }
}

/// Result alias for consensus operations.
pub type Result<T, E = RaftError> = std::result::Result<T, E>;
