//! Deterministic cluster simulator.
//!
//! Drives [`RaftNode`]s directly by logical ticks, without threads or wall
//! clock time. Messages travel through one FIFO queue, subject to the same
//! [`LinkMatrix`] the threaded transport uses and an optional random loss
//! rate. After every step the simulator checks the safety invariants and
//! records any violation instead of panicking, so property tests can report
//! the whole history.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::membership::Membership;
use crate::message::Envelope;
use crate::node::RaftNode;
use crate::partition::PartitionController;
use crate::storage::MemStorage;
use crate::transport::LinkMatrix;
use crate::types::{Index, LogEntry, NodeId, Term};

/// Deliveries allowed in one `deliver_all` before giving up on quiescence.
const MAX_DELIVERIES: usize = 1_000_000;

pub struct Simulation {
    membership: Membership,
    options: RaftOptions,
    nodes: BTreeMap<NodeId, RaftNode>,
    storages: BTreeMap<NodeId, MemStorage>,
    links: Arc<LinkMatrix>,
    in_flight: VecDeque<Envelope>,
    rng: StdRng,
    drop_rate: f64,
    restarts: u64,
    applied: BTreeMap<NodeId, Vec<LogEntry>>,
    leaders_by_term: BTreeMap<Term, NodeId>,
    last_terms: BTreeMap<NodeId, Term>,
    last_commits: BTreeMap<NodeId, Index>,
    committed: BTreeMap<Index, LogEntry>,
    violations: Vec<String>,
}

impl Simulation {
    /// Creates `size` nodes with ids `1..=size`. Timeouts are seeded from
    /// `options.seed` (0 if unset), so equal inputs replay identically.
    pub fn new(size: usize, options: RaftOptions) -> Result<Self> {
        let seed = options.seed.unwrap_or(0);
        let options = options.with_seed(seed);
        let membership = Membership::sequential(size);
        let mut sim = Self {
            membership,
            options,
            nodes: BTreeMap::new(),
            storages: BTreeMap::new(),
            links: Arc::new(LinkMatrix::new()),
            in_flight: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate: 0.0,
            restarts: 0,
            applied: BTreeMap::new(),
            leaders_by_term: BTreeMap::new(),
            last_terms: BTreeMap::new(),
            last_commits: BTreeMap::new(),
            committed: BTreeMap::new(),
            violations: Vec::new(),
        };
        for id in sim.ids() {
            let storage = MemStorage::new();
            let node = RaftNode::new(
                id,
                sim.membership.clone(),
                sim.options.clone(),
                Arc::new(storage.clone()),
            )?;
            sim.storages.insert(id, storage);
            sim.applied.insert(id, Vec::new());
            sim.nodes.insert(id, node);
        }
        sim.collect()?;
        Ok(sim)
    }

    /// Drops each delivered message with probability `rate`.
    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.membership.members().iter().copied().collect()
    }

    /// Ids of nodes that have not crashed.
    pub fn live_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&RaftNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut RaftNode> {
        self.nodes.get_mut(&id)
    }

    pub fn links(&self) -> Arc<LinkMatrix> {
        Arc::clone(&self.links)
    }

    pub fn partition(&self) -> PartitionController {
        PartitionController::new(self.links())
    }

    /// Entries applied by `id` since it last started.
    pub fn applied(&self, id: NodeId) -> &[LogEntry] {
        self.applied.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Invariant violations observed so far.
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Live nodes holding the leader role, in id order.
    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_leader())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Ticks every live node once, then delivers until quiet.
    pub fn tick(&mut self) -> Result<()> {
        for node in self.nodes.values_mut() {
            node.tick()?;
        }
        self.deliver_all()?;
        Ok(())
    }

    pub fn run_ticks(&mut self, ticks: usize) -> Result<()> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    /// Ticks until `done` holds, at most `max_ticks` times. Returns whether
    /// it held.
    pub fn run_until(&mut self, max_ticks: usize, done: impl Fn(&Self) -> bool) -> Result<bool> {
        for _ in 0..max_ticks {
            if done(self) {
                return Ok(true);
            }
            self.tick()?;
        }
        Ok(done(self))
    }

    /// Delivers queued messages, and the messages they cause, until none
    /// remain. Returns how many reached a node.
    pub fn deliver_all(&mut self) -> Result<usize> {
        self.collect()?;
        let mut delivered = 0;
        while let Some(envelope) = self.in_flight.pop_front() {
            if delivered >= MAX_DELIVERIES {
                warn!(queued = self.in_flight.len() + 1, "simulation did not quiesce");
                self.in_flight.clear();
                break;
            }
            if !self.links.is_reachable(envelope.from, envelope.to) {
                continue;
            }
            if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
                continue;
            }
            let to = envelope.to;
            let Some(node) = self.nodes.get_mut(&to) else {
                continue;
            };
            node.step(envelope)?;
            delivered += 1;
            self.observe(to)?;
        }
        Ok(delivered)
    }

    pub fn campaign(&mut self, id: NodeId) -> Result<()> {
        self.live_node(id)?.campaign()?;
        self.observe(id)
    }

    pub fn propose(&mut self, id: NodeId, payload: Vec<u8>) -> Result<Index> {
        let index = self.live_node(id)?.propose(payload)?;
        self.observe(id)?;
        Ok(index)
    }

    /// Stops `id`, discarding its volatile state. Its storage survives and
    /// messages addressed to it are lost.
    pub fn crash(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    /// Brings `id` back on its storage, crashing it first if it is live.
    /// The node re-applies its committed log from index 1.
    pub fn restart(&mut self, id: NodeId) -> Result<()> {
        self.crash(id);
        let storage = self.storages.get(&id).cloned().ok_or(RaftError::UnknownNode(id))?;
        self.restarts += 1;
        let seed = self.options.seed.unwrap_or(0).wrapping_add(self.restarts.wrapping_mul(0x5851_F42D));
        let node = RaftNode::new(
            id,
            self.membership.clone(),
            self.options.clone().with_seed(seed),
            Arc::new(storage),
        )?;
        self.nodes.insert(id, node);
        self.applied.insert(id, Vec::new());
        self.observe(id)
    }

    fn live_node(&mut self, id: NodeId) -> Result<&mut RaftNode> {
        if !self.membership.contains(id) {
            return Err(RaftError::UnknownNode(id));
        }
        self.nodes.get_mut(&id).ok_or(RaftError::Shutdown(id))
    }

    fn collect(&mut self) -> Result<()> {
        for id in self.live_ids() {
            self.observe(id)?;
        }
        Ok(())
    }

    /// Checks `id` against the invariants and drains its output.
    fn observe(&mut self, id: NodeId) -> Result<()> {
        let Some(node) = self.nodes.get_mut(&id) else {
            return Ok(());
        };
        let term = node.term();
        let commit = node.commit_index();
        let is_leader = node.is_leader();
        let ready = node.poll_ready()?;

        let last_term = self.last_terms.insert(id, term).unwrap_or(0);
        if term < last_term {
            self.violations
                .push(format!("node {id} term went back from {last_term} to {term}"));
        }
        let last_commit = self.last_commits.insert(id, commit).unwrap_or(0);
        if commit < last_commit {
            self.violations
                .push(format!("node {id} commit went back from {last_commit} to {commit}"));
        }
        if is_leader {
            let leader = *self.leaders_by_term.entry(term).or_insert(id);
            if leader != id {
                self.violations
                    .push(format!("nodes {leader} and {id} both led term {term}"));
            }
        }

        let Some(ready) = ready else {
            return Ok(());
        };
        for envelope in ready.messages {
            // A cut link drops at send time; nothing is held back for later.
            if self.links.is_reachable(envelope.from, envelope.to) {
                self.in_flight.push_back(envelope);
            }
        }
        let applied = self.applied.entry(id).or_default();
        for entry in ready.committed {
            let expected = applied.len() as Index + 1;
            if entry.index != expected {
                self.violations.push(format!(
                    "node {id} applied index {} where {expected} was next",
                    entry.index
                ));
            }
            match self.committed.get(&entry.index) {
                Some(existing) if *existing != entry => self.violations.push(format!(
                    "node {id} committed {:?} at index {} but {:?} was committed there",
                    entry, entry.index, existing
                )),
                Some(_) => {}
                None => {
                    self.committed.insert(entry.index, entry.clone());
                }
            }
            applied.push(entry);
        }
        Ok(())
    }
}
