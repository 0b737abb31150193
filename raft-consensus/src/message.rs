//! Messages exchanged between consensus nodes.
//!
//! The wire encoding is outside the consensus core; the types derive serde so
//! any transport can pick a format.

use serde::{Deserialize, Serialize};

use crate::types::{Index, LogEntry, NodeId, Term};

/// A routed message. `term` is the sender's term, except for pre-vote
/// requests, which carry the term the candidate would campaign in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates solicit votes. `pre_vote` asks without changing any
    /// term; `force` is set by operator-triggered campaigns and bypasses
    /// leader leases.
    RequestVote {
        last_log_index: Index,
        last_log_term: Term,
        pre_vote: bool,
        force: bool,
    },

    /// Reply to `RequestVote`.
    Vote { granted: bool, pre_vote: bool },

    /// Leaders replicate entries following `prev_log_index`. An empty
    /// `entries` is a heartbeat.
    AppendEntries {
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
    },

    /// Reply to `AppendEntries`. On success `index` is the last index known
    /// to match the leader; on rejection it echoes the rejected
    /// `prev_log_index`. `last_log_index` lets the leader skip back quickly.
    AppendResponse {
        success: bool,
        index: Index,
        last_log_index: Index,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote { pre_vote: true, .. } => "pre-vote",
            Message::RequestVote { .. } => "request-vote",
            Message::Vote { .. } => "vote",
            Message::AppendEntries { entries, .. } if entries.is_empty() => "heartbeat",
            Message::AppendEntries { .. } => "append-entries",
            Message::AppendResponse { .. } => "append-response",
        }
    }
}
