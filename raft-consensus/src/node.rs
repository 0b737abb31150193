//! Core Raft node: terms, elections, and the role state machine.
//!
//! [`RaftNode`] is a synchronous state machine. It is driven by two inputs:
//! - `tick()` advances its logical clock (election and heartbeat timers)
//! - `step()` processes one inbound message
//!
//! Neither performs I/O. Outbound messages and newly committed entries pile up
//! inside the node and are collected with `poll_ready()`, which keeps the node
//! free of threads and locks. The runtime owns one node per worker thread;
//! the simulator drives many of them deterministically.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::membership::Membership;
use crate::message::{Envelope, Message};
use crate::replication::LeaderState;
use crate::storage::Storage;
use crate::types::{HardState, Index, LogEntry, NodeId, StateRole, Term};

/// Role-specific state. Leader bookkeeping lives only in the leader variant.
enum Role {
    Follower {
        leader: Option<NodeId>,
    },
    Candidate {
        /// True while probing with pre-votes, before the term is bumped.
        pre_vote: bool,
        votes: HashMap<NodeId, bool>,
    },
    Leader(LeaderState),
}

/// Output collected from a node by [`RaftNode::poll_ready`].
pub struct Ready {
    /// Messages to hand to the transport.
    pub messages: Vec<Envelope>,
    /// Entries that became committed since the last poll, in index order.
    pub committed: Vec<LogEntry>,
}

/// A single consensus participant.
pub struct RaftNode {
    id: NodeId,
    membership: Membership,
    options: RaftOptions,
    storage: Arc<dyn Storage>,
    term: Term,
    voted_for: Option<NodeId>,
    commit_index: Index,
    last_applied: Index,
    role: Role,
    /// Leader heard from in this term, kept after the hint lapses so the
    /// lease still covers the whole minimum election timeout.
    lease_holder: Option<NodeId>,
    /// Ticks since the last reset; doubles as the time since the leader was
    /// last heard from.
    election_elapsed: u32,
    election_timeout: u32,
    rng: StdRng,
    outbox: Vec<Envelope>,
}

impl RaftNode {
    /// Creates a node that resumes from whatever `storage` holds.
    ///
    /// The node starts as a leaderless follower. A single-node cluster
    /// elects itself immediately.
    pub fn new(
        id: NodeId,
        membership: Membership,
        options: RaftOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        options.validate()?;
        if !membership.contains(id) {
            return Err(RaftError::Config(format!(
                "node {id} is not in the membership {:?}",
                membership.members()
            )));
        }
        let hard_state = storage.hard_state()?;
        let commit_index = hard_state.commit.min(storage.last_index()?);
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        };
        let mut node = Self {
            id,
            membership,
            options,
            storage,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            commit_index,
            last_applied: 0,
            role: Role::Follower { leader: None },
            lease_holder: None,
            election_elapsed: 0,
            election_timeout: 0,
            rng,
            outbox: Vec::new(),
        };
        node.reset_election_timer();
        if node.membership.len() == 1 {
            node.start_campaign(node.options.pre_vote, false)?;
        }
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn role(&self) -> StateRole {
        match self.role {
            Role::Follower { .. } => StateRole::Follower,
            Role::Candidate { .. } => StateRole::Candidate,
            Role::Leader(_) => StateRole::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    /// The leader this node currently recognizes, itself included.
    pub fn leader(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower { leader } => *leader,
            Role::Candidate { .. } => None,
            Role::Leader(_) => Some(self.id),
        }
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    pub fn last_index(&self) -> Result<Index> {
        self.storage.last_index()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn options(&self) -> &RaftOptions {
        &self.options
    }

    /// Leader-side replication cursors, for diagnostics.
    pub fn leader_state(&self) -> Option<&LeaderState> {
        match &self.role {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    /// Advances the logical clock by one tick.
    ///
    /// Followers forget a leader that went quiet, and followers and
    /// candidates campaign when their election timeout expires. Leaders send
    /// heartbeats and step down once a quorum has been silent for the
    /// minimum election timeout.
    pub fn tick(&mut self) -> Result<()> {
        if let Role::Leader(state) = &mut self.role {
            state.tick();
            state.heartbeat_elapsed += 1;
            if self.options.check_quorum {
                let window = self.options.election_timeout_ticks.start;
                if let Err(err) = state.check_quorum(self.id, &self.membership, window) {
                    warn!(node = self.id, term = self.term, %err, "leader stepping down");
                    return self.become_follower(self.term, None);
                }
            }
            if state.heartbeat_elapsed >= self.options.heartbeat_ticks {
                state.heartbeat_elapsed = 0;
                let peers: Vec<NodeId> = state.peers().collect();
                for peer in peers {
                    state.resume(peer);
                }
                self.broadcast_append()?;
            }
            return Ok(());
        }

        self.election_elapsed += 1;
        let silence = self.options.leader_silence_ticks();
        if let Role::Follower { leader } = &mut self.role {
            if leader.is_some() && self.election_elapsed >= silence {
                debug!(node = self.id, term = self.term, ?leader, "leader went quiet");
                *leader = None;
            }
        }
        if self.election_elapsed >= self.election_timeout {
            debug!(node = self.id, term = self.term, "election timeout");
            self.start_campaign(self.options.pre_vote, false)?;
        }
        Ok(())
    }

    /// Starts an election right away, skipping the pre-vote and overriding
    /// leader leases on the voters. Used by operators to move leadership.
    pub fn campaign(&mut self) -> Result<()> {
        info!(node = self.id, term = self.term, role = ?self.role(), "forced campaign");
        self.start_campaign(false, true)
    }

    /// Appends `payload` to the log if this node is the leader.
    ///
    /// Returns the index the entry was appended at. Appending is not
    /// committing: watch the committed entries for that index.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<Index> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader(),
            });
        }
        self.append_entry(payload)
    }

    /// Processes one inbound message.
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            from,
            to,
            term,
            message,
        } = envelope;
        if to != self.id || from == self.id || !self.membership.contains(from) {
            warn!(node = self.id, from, to, "dropping misrouted message");
            return Ok(());
        }

        match term.cmp(&self.term) {
            Ordering::Greater => match &message {
                Message::RequestVote {
                    pre_vote, force, ..
                } => {
                    if !force && self.in_lease() {
                        debug!(
                            node = self.id,
                            candidate = from,
                            term,
                            "rejecting vote request inside leader lease"
                        );
                        let pre_vote = *pre_vote;
                        self.send(from, self.term, Message::Vote {
                            granted: false,
                            pre_vote,
                        });
                        return Ok(());
                    }
                    // A pre-vote never moves the voter's term.
                    if !pre_vote {
                        self.become_follower(term, None)?;
                    }
                }
                // Granted pre-votes carry the term the candidate proposed.
                Message::Vote {
                    granted: true,
                    pre_vote: true,
                } => {}
                Message::AppendEntries { .. } => self.become_follower(term, Some(from))?,
                _ => self.become_follower(term, None)?,
            },
            Ordering::Less => {
                let stale = RaftError::StaleTerm {
                    from,
                    stale: term,
                    current: self.term,
                };
                debug!(node = self.id, kind = message.kind(), %stale, "stale message");
                match message {
                    // Tell a deposed leader about the newer term so it steps down.
                    Message::AppendEntries { .. } => {
                        let last_log_index = self.storage.last_index()?;
                        self.send(from, self.term, Message::AppendResponse {
                            success: false,
                            index: 0,
                            last_log_index,
                        });
                    }
                    Message::RequestVote { pre_vote: true, .. } => {
                        self.send(from, self.term, Message::Vote {
                            granted: false,
                            pre_vote: true,
                        });
                    }
                    _ => {}
                }
                return Ok(());
            }
            Ordering::Equal => {}
        }

        match message {
            Message::RequestVote {
                last_log_index,
                last_log_term,
                pre_vote,
                ..
            } => self.handle_request_vote(from, term, last_log_index, last_log_term, pre_vote),
            Message::Vote { granted, pre_vote } => self.handle_vote(from, term, granted, pre_vote),
            Message::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(from, prev_log_index, prev_log_term, &entries, leader_commit),
            Message::AppendResponse {
                success,
                index,
                last_log_index,
            } => self.handle_append_response(from, success, index, last_log_index),
        }
    }

    /// Collects pending outbound messages and newly committed entries.
    ///
    /// Returns `None` when there is nothing to do.
    pub fn poll_ready(&mut self) -> Result<Option<Ready>> {
        let committed = if self.commit_index > self.last_applied {
            let entries = self
                .storage
                .entries(self.last_applied + 1, self.commit_index)?;
            self.last_applied = self.commit_index;
            entries
        } else {
            Vec::new()
        };
        if self.outbox.is_empty() && committed.is_empty() {
            return Ok(None);
        }
        Ok(Some(Ready {
            messages: std::mem::take(&mut self.outbox),
            committed,
        }))
    }

    fn handle_request_vote(
        &mut self,
        from: NodeId,
        term: Term,
        last_log_index: Index,
        last_log_term: Term,
        pre_vote: bool,
    ) -> Result<()> {
        let own = (self.storage.last_term()?, self.storage.last_index()?);
        let up_to_date = (last_log_term, last_log_index) >= own;

        if pre_vote {
            let granted = term > self.term && up_to_date;
            let reply_term = if granted { term } else { self.term };
            debug!(node = self.id, candidate = from, term, granted, "pre-vote");
            self.send(from, reply_term, Message::Vote {
                granted,
                pre_vote: true,
            });
            return Ok(());
        }

        let can_vote = self.voted_for.map_or(true, |voted| voted == from);
        let granted = can_vote && up_to_date;
        if granted {
            self.voted_for = Some(from);
            self.persist()?;
            self.reset_election_timer();
        }
        info!(node = self.id, candidate = from, term, granted, "vote");
        self.send(from, self.term, Message::Vote {
            granted,
            pre_vote: false,
        });
        Ok(())
    }

    fn handle_vote(&mut self, from: NodeId, term: Term, granted: bool, pre_vote: bool) -> Result<()> {
        let Role::Candidate {
            pre_vote: probing,
            votes,
        } = &mut self.role
        else {
            return Ok(());
        };
        if *probing != pre_vote {
            return Ok(());
        }
        if pre_vote && granted && term != self.term + 1 {
            return Ok(());
        }
        votes.insert(from, granted);
        self.poll_election()
    }

    fn handle_append_entries(
        &mut self,
        from: NodeId,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: &[LogEntry],
        leader_commit: Index,
    ) -> Result<()> {
        match &self.role {
            Role::Leader(_) => {
                warn!(node = self.id, other = from, term = self.term, "second leader in term, ignoring");
                return Ok(());
            }
            Role::Follower { leader: Some(leader) } if *leader == from => {}
            _ => self.become_follower(self.term, Some(from))?,
        }
        self.election_elapsed = 0;
        self.lease_holder = Some(from);

        match self.append_from_leader(prev_log_index, prev_log_term, entries) {
            Ok(last_new) => {
                let commit = leader_commit.min(last_new);
                if commit > self.commit_index {
                    self.commit_index = commit;
                    self.persist()?;
                }
                let last_log_index = self.storage.last_index()?;
                self.send(from, self.term, Message::AppendResponse {
                    success: true,
                    index: last_new,
                    last_log_index,
                });
            }
            Err(RaftError::LogMismatch { index, term }) => {
                let last_log_index = self.storage.last_index()?;
                debug!(node = self.id, index, term, last_log_index, "rejecting append: log mismatch");
                self.send(from, self.term, Message::AppendResponse {
                    success: false,
                    index: prev_log_index,
                    last_log_index,
                });
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Appends leader entries after checking the `prev_log_*` anchor.
    /// Returns the index of the last entry the leader sent.
    fn append_from_leader(
        &mut self,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: &[LogEntry],
    ) -> Result<Index> {
        if self.storage.term(prev_log_index)? != Some(prev_log_term) {
            return Err(RaftError::LogMismatch {
                index: prev_log_index,
                term: prev_log_term,
            });
        }
        for (i, entry) in entries.iter().enumerate() {
            match self.storage.term(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(RaftError::Storage(format!(
                            "leader entry at committed index {} conflicts with local log",
                            entry.index
                        )));
                    }
                    debug!(node = self.id, index = entry.index, "truncating conflicting suffix");
                    self.storage.truncate_from(entry.index)?;
                    self.storage.append(&entries[i..])?;
                    break;
                }
                None => {
                    self.storage.append(&entries[i..])?;
                    break;
                }
            }
        }
        Ok(prev_log_index + entries.len() as Index)
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        success: bool,
        index: Index,
        last_log_index: Index,
    ) -> Result<()> {
        let Role::Leader(state) = &mut self.role else {
            return Ok(());
        };
        state.mark_active(from);

        if !success {
            if state.on_append_reject(from, index, last_log_index) {
                debug!(node = self.id, peer = from, rejected = index, last_log_index, "backtracking");
                self.send_append(from)?;
            }
            return Ok(());
        }

        if state.on_append_success(from, index) {
            self.maybe_commit()?;
        }
        let own_last = self.storage.last_index()?;
        let behind = self
            .leader_state()
            .and_then(|state| state.progress(from))
            .is_some_and(|progress| progress.next_index <= own_last);
        if behind {
            self.send_append(from)?;
        }
        Ok(())
    }

    fn start_campaign(&mut self, pre_vote: bool, force: bool) -> Result<()> {
        self.reset_election_timer();
        let request_term = if pre_vote {
            self.term + 1
        } else {
            self.term += 1;
            self.voted_for = Some(self.id);
            self.persist()?;
            self.term
        };
        info!(node = self.id, term = request_term, pre_vote, "starting election");

        self.role = Role::Candidate {
            pre_vote,
            votes: HashMap::from([(self.id, true)]),
        };
        let last_log_index = self.storage.last_index()?;
        let last_log_term = self.storage.last_term()?;
        let peers: Vec<NodeId> = self.membership.peers_of(self.id).collect();
        for peer in peers {
            self.send(peer, request_term, Message::RequestVote {
                last_log_index,
                last_log_term,
                pre_vote,
                force,
            });
        }
        self.poll_election()
    }

    /// Tallies votes: wins the phase on a quorum of grants, gives up on a
    /// quorum of rejections.
    fn poll_election(&mut self) -> Result<()> {
        let Role::Candidate { pre_vote, votes } = &self.role else {
            return Ok(());
        };
        let pre_vote = *pre_vote;
        let granted: Vec<NodeId> = votes.iter().filter(|&(_, &g)| g).map(|(&id, _)| id).collect();
        let rejected: Vec<NodeId> = votes.iter().filter(|&(_, &g)| !g).map(|(&id, _)| id).collect();

        if self.membership.is_majority(&granted) {
            if pre_vote {
                debug!(node = self.id, term = self.term, "pre-vote succeeded");
                return self.start_campaign(false, false);
            }
            return self.become_leader();
        }
        if self.membership.is_majority(&rejected) {
            info!(node = self.id, term = self.term, pre_vote, "lost election");
            return self.become_follower(self.term, None);
        }
        Ok(())
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        let previous = self.role();
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist()?;
        }
        self.role = Role::Follower { leader };
        self.lease_holder = leader;
        self.reset_election_timer();
        info!(node = self.id, term = self.term, ?leader, ?previous, "became follower");
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        let last_index = self.storage.last_index()?;
        self.role = Role::Leader(LeaderState::new(self.membership.peers_of(self.id), last_index));
        info!(node = self.id, term = self.term, "became leader");
        // A no-op in the new term lets earlier entries commit.
        self.append_entry(Vec::new())?;
        Ok(())
    }

    fn append_entry(&mut self, payload: Vec<u8>) -> Result<Index> {
        let index = self.storage.last_index()? + 1;
        self.storage
            .append(&[LogEntry::new(index, self.term, payload)])?;
        self.maybe_commit()?;
        self.broadcast_append()?;
        Ok(index)
    }

    fn broadcast_append(&mut self) -> Result<()> {
        let peers: Vec<NodeId> = match &self.role {
            Role::Leader(state) => state.peers().collect(),
            _ => return Ok(()),
        };
        for peer in peers {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Sends everything from the peer's `next_index`, or a heartbeat if it
    /// is caught up. Does nothing while a search append to the peer is outstanding.
    fn send_append(&mut self, to: NodeId) -> Result<()> {
        let Some(progress) = self.leader_state().and_then(|state| state.progress(to)) else {
            return Ok(());
        };
        if progress.is_paused() {
            return Ok(());
        }
        let next_index = progress.next_index;
        let prev_log_index = next_index - 1;
        let prev_log_term = self.storage.term(prev_log_index)?.ok_or_else(|| {
            RaftError::Storage(format!("no term for index {prev_log_index}"))
        })?;
        let entries = self
            .storage
            .entries(next_index, prev_log_index + self.options.max_append_entries as Index)?;
        if let Role::Leader(state) = &mut self.role {
            state.on_sent(to, entries.last().map(|entry| entry.index));
        }
        self.send(to, self.term, Message::AppendEntries {
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        });
        Ok(())
    }

    /// Advances the commit index to the highest index held by a quorum,
    /// but only if that entry belongs to the current term. Older entries
    /// commit indirectly once a current-term entry above them does.
    fn maybe_commit(&mut self) -> Result<()> {
        let last_index = self.storage.last_index()?;
        let Role::Leader(state) = &self.role else {
            return Ok(());
        };
        let quorum_index = state.quorum_match_index(self.id, last_index, &self.membership);
        if quorum_index <= self.commit_index {
            return Ok(());
        }
        if self.storage.term(quorum_index)? != Some(self.term) {
            return Ok(());
        }
        debug!(node = self.id, term = self.term, commit = quorum_index, "commit advanced");
        self.commit_index = quorum_index;
        self.persist()
    }

    /// True while this node should refuse to help unseat the current leader:
    /// a leader that has not failed its quorum check, or a follower that
    /// heard from its leader within the minimum election timeout.
    fn in_lease(&self) -> bool {
        if !self.options.check_quorum {
            return false;
        }
        match &self.role {
            Role::Leader(_) => true,
            Role::Follower { .. } => {
                self.lease_holder.is_some()
                    && self.election_elapsed < self.options.election_timeout_ticks.start
            }
            Role::Candidate { .. } => false,
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = self
            .rng
            .gen_range(self.options.election_timeout_ticks.clone());
    }

    fn persist(&self) -> Result<()> {
        self.storage.set_hard_state(HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit: self.commit_index,
        })
    }

    fn send(&mut self, to: NodeId, term: Term, message: Message) {
        self.outbox.push(Envelope {
            from: self.id,
            to,
            term,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulation;
    use crate::storage::MemStorage;

    fn options() -> RaftOptions {
        RaftOptions::for_testing().with_seed(7)
    }

    fn new_node(id: NodeId, size: usize, storage: MemStorage) -> RaftNode {
        RaftNode::new(id, Membership::sequential(size), options(), Arc::new(storage)).expect("node")
    }

    fn drain(node: &mut RaftNode) -> Vec<Envelope> {
        node.poll_ready()
            .expect("poll")
            .map(|ready| ready.messages)
            .unwrap_or_default()
    }

    fn envelope(from: NodeId, to: NodeId, term: Term, message: Message) -> Envelope {
        Envelope {
            from,
            to,
            term,
            message,
        }
    }

    fn request_vote(last_log_index: Index, last_log_term: Term) -> Message {
        Message::RequestVote {
            last_log_index,
            last_log_term,
            pre_vote: false,
            force: false,
        }
    }

    fn log(terms: &[Term]) -> Vec<LogEntry> {
        terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry::new(i as Index + 1, term, format!("e{}", i + 1).into_bytes()))
            .collect()
    }

    /// Verifies exactly one leader exists and returns its ID.
    fn assert_single_leader(sim: &Simulation) -> NodeId {
        let leaders = sim.leaders();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, found: {leaders:?}");
        leaders[0]
    }

    /// Verifies all live nodes agree on the same leader.
    fn assert_leader_consensus(sim: &Simulation, expected: NodeId) {
        for id in sim.live_ids() {
            let leader = sim.node(id).and_then(RaftNode::leader);
            assert_eq!(leader, Some(expected), "node {id} sees leader {leader:?}");
        }
    }

    #[test]
    fn test_basic_three_node_election() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        for id in 1..=3 {
            assert_eq!(sim.node(id).unwrap().role(), StateRole::Follower);
            assert_eq!(sim.node(id).unwrap().leader(), None);
        }

        sim.campaign(1)?;
        sim.deliver_all()?;

        assert_eq!(assert_single_leader(&sim), 1);
        assert_leader_consensus(&sim, 1);
        assert!(sim.violations().is_empty());
        Ok(())
    }

    #[test]
    fn test_election_by_timeout() -> Result<()> {
        let mut sim = Simulation::new(5, options())?;
        let elected = sim.run_until(100, |sim| sim.leaders().len() == 1)?;
        assert!(elected, "a leader should emerge within 100 ticks");
        let leader = assert_single_leader(&sim);
        sim.run_ticks(5)?;
        assert_leader_consensus(&sim, leader);
        Ok(())
    }

    #[test]
    fn test_single_node_elects_itself_immediately() -> Result<()> {
        let mut node = new_node(1, 1, MemStorage::new());
        assert_eq!(node.role(), StateRole::Leader);
        assert_eq!(node.term(), 1);

        let index = node.propose(b"solo".to_vec())?;
        assert_eq!(node.commit_index(), index);
        let ready = node.poll_ready()?.expect("committed entries");
        assert_eq!(ready.committed.len(), 2);
        assert!(ready.committed[0].is_noop());
        Ok(())
    }

    #[test]
    fn test_follower_timeout_election() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        assert_eq!(assert_single_leader(&sim), 1);

        sim.crash(1);
        let elected = sim.run_until(100, |sim| sim.leaders().len() == 1)?;
        assert!(elected);
        let leader = assert_single_leader(&sim);
        assert!(leader == 2 || leader == 3, "new leader should be node 2 or 3");
        Ok(())
    }

    #[test]
    fn test_forced_campaign_from_follower() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;

        sim.campaign(2)?;
        sim.deliver_all()?;
        sim.run_ticks(20)?;

        let leader = assert_single_leader(&sim);
        assert!(leader == 1 || leader == 2, "leader should be node 1 or 2, got {leader}");
        Ok(())
    }

    #[test]
    fn test_forced_campaign_from_leader() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        let term = sim.node(1).unwrap().term();

        sim.campaign(1)?;
        sim.deliver_all()?;
        sim.run_ticks(20)?;

        let leader = assert_single_leader(&sim);
        assert_leader_consensus(&sim, leader);
        assert!(sim.node(leader).unwrap().term() > term);
        Ok(())
    }

    #[test]
    fn test_no_split_brain_during_forced_campaign() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;

        sim.campaign(2)?;
        for _ in 0..40 {
            sim.tick()?;
            let leaders = sim.leaders();
            let terms: Vec<Term> = leaders
                .iter()
                .filter_map(|&id| sim.node(id).map(RaftNode::term))
                .collect();
            let mut distinct = terms.clone();
            distinct.sort_unstable();
            distinct.dedup();
            assert_eq!(terms.len(), distinct.len(), "two leaders share a term: {leaders:?}");
        }
        assert!(sim.violations().is_empty(), "{:?}", sim.violations());
        assert_single_leader(&sim);
        Ok(())
    }

    #[test]
    fn test_leader_steps_down_on_higher_term() -> Result<()> {
        let mut node = new_node(1, 3, MemStorage::new());
        node.campaign()?;
        node.step(envelope(2, 1, 1, Message::Vote {
            granted: true,
            pre_vote: false,
        }))?;
        assert!(node.is_leader());
        drain(&mut node);

        // A follower that moved on answers a heartbeat with its newer term.
        node.step(envelope(3, 1, 4, Message::AppendResponse {
            success: false,
            index: 0,
            last_log_index: 0,
        }))?;
        assert_eq!(node.role(), StateRole::Follower);
        assert_eq!(node.term(), 4);
        assert_eq!(node.voted_for(), None);
        Ok(())
    }

    #[test]
    fn test_vote_granted_at_most_once_per_term() -> Result<()> {
        let mut node = new_node(1, 3, MemStorage::new());
        node.step(envelope(2, 1, 1, request_vote(0, 0)))?;
        node.step(envelope(3, 1, 1, request_vote(0, 0)))?;
        // Re-delivery to the same candidate is still granted.
        node.step(envelope(2, 1, 1, request_vote(0, 0)))?;

        let votes: Vec<(NodeId, bool)> = drain(&mut node)
            .into_iter()
            .filter_map(|env| match env.message {
                Message::Vote { granted, .. } => Some((env.to, granted)),
                _ => None,
            })
            .collect();
        assert_eq!(votes, vec![(2, true), (3, false), (2, true)]);
        assert_eq!(node.voted_for(), Some(2));
        Ok(())
    }

    #[test]
    fn test_vote_rejected_for_stale_log() -> Result<()> {
        let storage = MemStorage::with_entries(
            HardState {
                term: 2,
                ..HardState::default()
            },
            log(&[1, 2]),
        )?;
        let mut node = new_node(1, 3, storage);

        // Longer log but older last term loses.
        node.step(envelope(2, 1, 3, request_vote(5, 1)))?;
        // Same last term but shorter log loses.
        node.step(envelope(3, 1, 3, request_vote(1, 2)))?;
        let granted: Vec<bool> = drain(&mut node)
            .into_iter()
            .filter_map(|env| match env.message {
                Message::Vote { granted, .. } => Some(granted),
                _ => None,
            })
            .collect();
        assert_eq!(granted, vec![false, false]);
        assert_eq!(node.term(), 3);
        assert_eq!(node.voted_for(), None);
        Ok(())
    }

    #[test]
    fn test_vote_survives_restart() -> Result<()> {
        let storage = MemStorage::new();
        let mut node = new_node(1, 3, storage.clone());
        node.step(envelope(2, 1, 5, request_vote(0, 0)))?;
        assert_eq!(node.voted_for(), Some(2));
        drop(node);

        let mut restarted = new_node(1, 3, storage);
        assert_eq!(restarted.term(), 5);
        restarted.step(envelope(3, 1, 5, request_vote(0, 0)))?;
        let messages = drain(&mut restarted);
        assert!(matches!(
            messages.as_slice(),
            [Envelope {
                message: Message::Vote { granted: false, .. },
                ..
            }]
        ));
        Ok(())
    }

    #[test]
    fn test_append_rejects_mismatch_then_truncates_conflict() -> Result<()> {
        let storage = MemStorage::with_entries(
            HardState {
                term: 2,
                ..HardState::default()
            },
            log(&[1, 1, 2]),
        )?;
        let mut node = new_node(2, 3, storage.clone());

        node.step(envelope(1, 2, 3, Message::AppendEntries {
            prev_log_index: 3,
            prev_log_term: 3,
            entries: vec![],
            leader_commit: 0,
        }))?;
        assert_eq!(node.leader(), Some(1));
        let reply = drain(&mut node);
        assert_eq!(reply[0].message, Message::AppendResponse {
            success: false,
            index: 3,
            last_log_index: 3,
        });

        let replacement = vec![
            LogEntry::new(3, 3, b"x".to_vec()),
            LogEntry::new(4, 3, b"y".to_vec()),
        ];
        node.step(envelope(1, 2, 3, Message::AppendEntries {
            prev_log_index: 2,
            prev_log_term: 1,
            entries: replacement,
            leader_commit: 4,
        }))?;
        assert_eq!(storage.term(3)?, Some(3));
        assert_eq!(storage.last_index()?, 4);
        assert_eq!(node.commit_index(), 4);

        let ready = node.poll_ready()?.expect("ready");
        assert_eq!(ready.messages[0].message, Message::AppendResponse {
            success: true,
            index: 4,
            last_log_index: 4,
        });
        assert_eq!(ready.committed.len(), 4);
        assert_eq!(ready.committed[3].payload, b"y".to_vec());
        Ok(())
    }

    #[test]
    fn test_commit_index_never_regresses_on_follower() -> Result<()> {
        let mut node = new_node(2, 3, MemStorage::with_entries(HardState::default(), log(&[1, 1, 1]))?);
        let heartbeat = |commit| Message::AppendEntries {
            prev_log_index: 3,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: commit,
        };
        node.step(envelope(1, 2, 1, heartbeat(3)))?;
        assert_eq!(node.commit_index(), 3);
        node.step(envelope(1, 2, 1, heartbeat(1)))?;
        assert_eq!(node.commit_index(), 3);
        Ok(())
    }

    #[test]
    fn test_leader_commits_only_current_term_entries() -> Result<()> {
        let storage = MemStorage::with_entries(
            HardState {
                term: 2,
                ..HardState::default()
            },
            log(&[1, 2]),
        )?;
        let mut node = new_node(1, 3, storage.clone());
        node.campaign()?;
        node.step(envelope(2, 1, 3, Message::Vote {
            granted: true,
            pre_vote: false,
        }))?;
        assert!(node.is_leader());
        assert_eq!(storage.last_index()?, 3, "leader appends a no-op");
        drain(&mut node);

        // A quorum holds index 2, but it was appended in term 2.
        node.step(envelope(2, 1, 3, Message::AppendResponse {
            success: true,
            index: 2,
            last_log_index: 2,
        }))?;
        assert_eq!(node.commit_index(), 0);

        node.step(envelope(2, 1, 3, Message::AppendResponse {
            success: true,
            index: 3,
            last_log_index: 3,
        }))?;
        assert_eq!(node.commit_index(), 3);
        Ok(())
    }

    #[test]
    fn test_follower_rejects_proposals_with_hint() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;

        let err = sim.propose(2, b"nope".to_vec()).unwrap_err();
        assert_eq!(err, RaftError::NotLeader { leader_hint: Some(1) });
        Ok(())
    }

    #[test]
    fn test_replication_commits_everywhere() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        for i in 0..5 {
            sim.propose(1, format!("put-{i}").into_bytes())?;
        }
        sim.run_ticks(5)?;

        for id in 1..=3 {
            let payloads: Vec<&[u8]> = sim
                .applied(id)
                .iter()
                .filter(|entry| !entry.is_noop())
                .map(|entry| entry.payload.as_slice())
                .collect();
            assert_eq!(payloads.len(), 5, "node {id} applied {payloads:?}");
            assert_eq!(payloads[4], b"put-4");
        }
        assert!(sim.violations().is_empty());
        Ok(())
    }

    #[test]
    fn test_lagging_follower_catches_up_by_backtracking() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;

        sim.partition().isolate(3, &[1, 2, 3]);
        for i in 0..10 {
            sim.propose(1, vec![i])?;
        }
        sim.run_ticks(5)?;
        assert!(sim.node(3).unwrap().commit_index() < sim.node(1).unwrap().commit_index());

        sim.partition().heal_all();
        let caught_up = sim.run_until(100, |sim| sim.applied(3).len() == sim.applied(1).len())?;
        assert!(caught_up);
        assert_eq!(sim.leaders(), vec![1]);
        Ok(())
    }

    #[test]
    fn test_deposed_leader_discards_divergent_suffix() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        sim.propose(1, b"base".to_vec())?;
        sim.run_ticks(2)?;
        assert_eq!(sim.node(1).unwrap().commit_index(), 2);

        // The old leader keeps accepting writes it can never commit.
        sim.partition().isolate(1, &[1, 2, 3]);
        for i in 0..5 {
            sim.propose(1, format!("lost-{i}").into_bytes())?;
        }
        assert_eq!(sim.node(1).unwrap().last_index()?, 7);

        let elected = sim.run_until(200, |sim| sim.leaders().iter().any(|&id| id != 1))?;
        assert!(elected, "the majority side never elected a leader");
        let leader = sim.leaders().into_iter().find(|&id| id != 1).unwrap();
        for i in 0..5 {
            sim.propose(leader, format!("kept-{i}").into_bytes())?;
        }
        sim.run_ticks(5)?;

        sim.partition().heal_all();
        let marker = sim.propose(leader, b"marker".to_vec())?;
        let caught_up = sim.run_until(100, |sim| {
            sim.node(1).is_some_and(|node| node.commit_index() >= marker)
        })?;
        let progress = sim
            .node(leader)
            .and_then(RaftNode::leader_state)
            .and_then(|state| state.progress(1).copied());
        assert!(caught_up, "node 1 never committed index {marker}: {progress:?}");

        let applied: Vec<String> = sim
            .applied(1)
            .iter()
            .filter(|entry| !entry.is_noop())
            .map(|entry| String::from_utf8_lossy(&entry.payload).into_owned())
            .collect();
        let expected: Vec<String> = std::iter::once("base".to_string())
            .chain((0..5).map(|i| format!("kept-{i}")))
            .chain(std::iter::once("marker".to_string()))
            .collect();
        assert_eq!(applied, expected);
        assert!(sim.violations().is_empty(), "{:?}", sim.violations());
        Ok(())
    }

    #[test]
    fn test_follower_forgets_quiet_leader_but_keeps_lease() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        let term = sim.node(2).unwrap().term();

        sim.partition().isolate(2, &[1, 2, 3]);
        let silence = options().leader_silence_ticks() as usize;
        sim.run_ticks(silence)?;
        let follower = sim.node_mut(2).unwrap();
        assert_eq!(follower.leader(), None, "hint must lapse after {silence} quiet ticks");
        assert_eq!(follower.role(), StateRole::Follower);

        // Still inside the lease: a disruptive candidate is turned away.
        follower.step(envelope(3, 2, term + 1, request_vote(100, term)))?;
        assert_eq!(follower.term(), term);
        Ok(())
    }

    #[test]
    fn test_isolated_leader_steps_down() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;

        sim.partition().isolate(1, &[1, 2, 3]);
        let window = options().election_timeout_ticks.start as usize;
        let stepped_down = sim.run_until(window, |sim| !sim.node(1).unwrap().is_leader())?;
        assert!(stepped_down, "isolated leader must step down within {window} ticks");
        assert_eq!(sim.node(1).unwrap().leader(), None);
        Ok(())
    }

    #[test]
    fn test_isolated_follower_does_not_inflate_term() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        let term = sim.node(1).unwrap().term();

        sim.partition().isolate(3, &[1, 2, 3]);
        sim.run_ticks(200)?;
        assert_eq!(sim.node(3).unwrap().term(), term, "pre-vote keeps the term still");

        sim.partition().heal_all();
        sim.run_ticks(20)?;
        assert_eq!(sim.leaders(), vec![1]);
        assert_eq!(sim.node(1).unwrap().term(), term);
        assert_eq!(sim.node(3).unwrap().leader(), Some(1));
        Ok(())
    }

    #[test]
    fn test_lease_rejects_disruptive_vote_request() -> Result<()> {
        let mut sim = Simulation::new(3, options())?;
        sim.campaign(1)?;
        sim.deliver_all()?;
        let term = sim.node(2).unwrap().term();

        let follower = sim.node_mut(2).unwrap();
        follower.step(envelope(3, 2, term + 5, request_vote(100, term)))?;
        assert_eq!(follower.term(), term);
        assert_eq!(follower.leader(), Some(1));
        let replies = drain(follower);
        assert!(replies.iter().any(|env| env.message
            == Message::Vote {
                granted: false,
                pre_vote: false
            }));
        Ok(())
    }
}
