//! Replicated consensus core for a distributed key-value store.
//!
//! A cluster of nodes agrees on one sequence of committed log entries despite
//! crashes and network partitions, using Raft: terms and randomized election
//! timeouts, log replication with majority commit, and a quorum check plus
//! pre-vote so a partitioned minority cannot unseat a healthy leader.
//!
//! # Architecture
//!
//! - **[`node::RaftNode`]**: a pure state machine driven by `tick()` and
//!   `step()`, producing outbound messages and committed entries
//! - **Worker thread** ([`runtime`]): one per node, owns the node and
//!   processes one event at a time from crossbeam channels
//! - **[`transport::Network`]**: in-process inboxes behind a shared
//!   [`transport::LinkMatrix`], which the [`partition::PartitionController`]
//!   flips to model partitions
//!
//! The storage engine, the state machine the entries feed, and the wire
//! encoding live outside this crate; [`storage::Storage`] is the seam.
//!
//! # Modules
//!
//! - [`types`], [`error`], [`membership`], [`config`]: data model and setup
//! - [`storage`]: storage contract and an in-memory engine
//! - [`message`], [`transport`], [`partition`]: messaging and faults
//! - [`node`], [`replication`]: elections, roles and log replication
//! - [`runtime`], [`liveness`], [`cluster`]: threaded nodes and the harness
//! - [`sim`]: deterministic simulator for property tests
//! - [`protocol`]: console command parsing

pub mod cluster;
pub mod config;
pub mod error;
pub mod liveness;
pub mod membership;
pub mod message;
pub mod node;
pub mod partition;
pub mod protocol;
pub mod replication;
pub mod runtime;
pub mod sim;
pub mod storage;
pub mod transport;
pub mod types;

pub use error::{RaftError, Result};
pub use types::{HardState, Index, LogEntry, NodeId, StateRole, Term};
