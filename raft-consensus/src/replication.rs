//! Leader-side replication tracking.
//!
//! A [`LeaderState`] exists only while a node is leader. It keeps one
//! [`Progress`] cursor per follower, decides which index a quorum has
//! replicated, and runs the periodic quorum check.

use std::collections::BTreeMap;

use crate::error::{RaftError, Result};
use crate::membership::Membership;
use crate::types::{Index, NodeId};

/// How the leader is currently talking to one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// The follower's log position is unknown. One append is outstanding at
    /// a time, and `next_index` moves only when a reply comes back.
    Searching { paused: bool },
    /// The follower matched; appends are pipelined and `next_index` runs
    /// ahead of acknowledgments.
    Replicating,
}

/// Replication cursor for one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next index to send.
    pub next_index: Index,
    /// Highest index known to be replicated on the follower.
    pub match_index: Index,
    pub state: ProgressState,
    /// Leader tick at which the follower last replied.
    pub last_active: u64,
}

impl Progress {
    /// True while a search append is in flight and nothing else should be sent.
    pub fn is_paused(&self) -> bool {
        matches!(self.state, ProgressState::Searching { paused: true })
    }
}

/// Volatile leader state, rebuilt on every accession.
#[derive(Debug, Clone)]
pub struct LeaderState {
    progress: BTreeMap<NodeId, Progress>,
    /// Ticks since accession.
    ticks: u64,
    pub(crate) heartbeat_elapsed: u32,
}

impl LeaderState {
    /// nextIndex = last_index + 1 and matchIndex = 0 for every follower.
    /// Every follower counts as active at accession, since it just voted.
    pub fn new(peers: impl IntoIterator<Item = NodeId>, last_index: Index) -> Self {
        let progress = peers
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index: last_index + 1,
                        match_index: 0,
                        state: ProgressState::Searching { paused: false },
                        last_active: 0,
                    },
                )
            })
            .collect();
        Self {
            progress,
            ticks: 0,
            heartbeat_elapsed: 0,
        }
    }

    pub fn progress(&self, peer: NodeId) -> Option<&Progress> {
        self.progress.get(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.progress.keys().copied()
    }

    pub(crate) fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn mark_active(&mut self, peer: NodeId) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.last_active = self.ticks;
        }
    }

    /// Lets a paused search go out again. Called on heartbeats, so a lost
    /// append or reply is retried.
    pub fn resume(&mut self, peer: NodeId) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            if let ProgressState::Searching { paused } = &mut progress.state {
                *paused = false;
            }
        }
    }

    /// Records an append to `peer` whose last entry is `last_sent`, if any.
    ///
    /// Searching pauses the follower until a reply; replication advances
    /// `next_index` past the batch.
    pub fn on_sent(&mut self, peer: NodeId, last_sent: Option<Index>) {
        let Some(progress) = self.progress.get_mut(&peer) else {
            return;
        };
        match (&mut progress.state, last_sent) {
            (ProgressState::Searching { paused }, _) => *paused = true,
            (ProgressState::Replicating, Some(last)) => {
                progress.next_index = progress.next_index.max(last + 1);
            }
            (ProgressState::Replicating, None) => {}
        }
    }

    /// Handles a successful append. Returns true if the match index advanced.
    pub fn on_append_success(&mut self, peer: NodeId, index: Index) -> bool {
        let Some(progress) = self.progress.get_mut(&peer) else {
            return false;
        };
        if let ProgressState::Searching { .. } = progress.state {
            progress.state = ProgressState::Replicating;
        }
        progress.next_index = progress.next_index.max(index + 1);
        if index > progress.match_index {
            progress.match_index = index;
            return true;
        }
        false
    }

    /// Handles a rejected append whose `prev_log_index` was `rejected`.
    ///
    /// Backs `next_index` up to just past the follower's last entry, but
    /// always by at least one and never to or below `match_index`, and
    /// falls back to searching. While searching only the reply to the
    /// outstanding append counts; while replicating anything at or below
    /// `match_index` is stale. Returns true if the follower should be
    /// sent to again.
    pub fn on_append_reject(&mut self, peer: NodeId, rejected: Index, last_log_index: Index) -> bool {
        let Some(progress) = self.progress.get_mut(&peer) else {
            return false;
        };
        if rejected <= progress.match_index {
            return false;
        }
        if let ProgressState::Searching { .. } = progress.state {
            if rejected + 1 != progress.next_index {
                return false;
            }
        }
        progress.next_index = rejected
            .min(last_log_index + 1)
            .max(progress.match_index + 1);
        progress.state = ProgressState::Searching { paused: false };
        true
    }

    /// The highest index replicated on a quorum, counting the leader's own
    /// `own_last_index`.
    pub fn quorum_match_index(&self, leader: NodeId, own_last_index: Index, membership: &Membership) -> Index {
        let mut matched: Vec<Index> = membership
            .members()
            .iter()
            .map(|&id| {
                if id == leader {
                    own_last_index
                } else {
                    self.progress.get(&id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched
            .get(membership.quorum_size() - 1)
            .copied()
            .unwrap_or(0)
    }

    /// Verifies that a quorum (leader included) replied within the last
    /// `window` ticks.
    pub fn check_quorum(&self, leader: NodeId, membership: &Membership, window: u32) -> Result<()> {
        let mut active: Vec<NodeId> = self
            .progress
            .iter()
            .filter(|(_, p)| self.ticks - p.last_active < u64::from(window))
            .map(|(&id, _)| id)
            .collect();
        active.push(leader);
        if membership.is_majority(&active) {
            Ok(())
        } else {
            Err(RaftError::QuorumLost {
                active: active.len(),
                quorum: membership.quorum_size(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader_of_five() -> (LeaderState, Membership) {
        let membership = Membership::sequential(5);
        (LeaderState::new(membership.peers_of(1), 10), membership)
    }

    fn next(state: &LeaderState, peer: NodeId) -> Index {
        state.progress(peer).unwrap().next_index
    }

    #[test]
    fn test_initial_progress() {
        let (state, _) = leader_of_five();
        let progress = state.progress(2).expect("peer 2");
        assert_eq!(progress.next_index, 11);
        assert_eq!(progress.match_index, 0);
        assert_eq!(progress.state, ProgressState::Searching { paused: false });
        assert!(state.progress(1).is_none());
    }

    #[test]
    fn test_quorum_match_index() {
        let (mut state, membership) = leader_of_five();
        assert_eq!(state.quorum_match_index(1, 12, &membership), 0);

        state.on_append_success(2, 12);
        assert_eq!(state.quorum_match_index(1, 12, &membership), 0);
        state.on_append_success(3, 11);
        // Matches: leader 12, peer2 12, peer3 11 -> third highest is 11.
        assert_eq!(state.quorum_match_index(1, 12, &membership), 11);
        state.on_append_success(4, 12);
        assert_eq!(state.quorum_match_index(1, 12, &membership), 12);
    }

    #[test]
    fn test_success_never_regresses_match() {
        let (mut state, _) = leader_of_five();
        assert!(state.on_append_success(2, 9));
        assert!(!state.on_append_success(2, 5));
        assert_eq!(state.progress(2).unwrap().match_index, 9);
    }

    #[test]
    fn test_search_pauses_until_reply() {
        let (mut state, _) = leader_of_five();
        state.on_sent(2, Some(11));
        assert!(state.progress(2).unwrap().is_paused());
        assert_eq!(next(&state, 2), 11, "searching does not run ahead");

        state.resume(2);
        assert!(!state.progress(2).unwrap().is_paused());

        state.on_append_success(2, 11);
        assert_eq!(state.progress(2).unwrap().state, ProgressState::Replicating);
        state.on_sent(2, Some(20));
        assert_eq!(next(&state, 2), 21);
        assert!(!state.progress(2).unwrap().is_paused());
    }

    #[test]
    fn test_reject_backtracks_to_follower_log_end() {
        let (mut state, _) = leader_of_five();
        // An append with prev=10 rejected by a follower holding only 4 entries.
        state.on_sent(2, Some(11));
        assert!(state.on_append_reject(2, 10, 4));
        assert_eq!(next(&state, 2), 5);

        // A stale rejection of the old append does nothing.
        assert!(!state.on_append_reject(2, 10, 4));

        // Follower has a long divergent log: step back by one.
        assert!(state.on_append_reject(2, 4, 50));
        assert_eq!(next(&state, 2), 4);
    }

    #[test]
    fn test_divergent_follower_backtracks_while_entries_are_sent() {
        // Every retry carries entries; searching keeps next_index in place so
        // the following rejection still lines up with the outstanding append.
        let (mut state, _) = leader_of_five();
        for expected_prev in (3..=10).rev() {
            state.on_sent(2, Some(10));
            assert_eq!(next(&state, 2), expected_prev + 1);
            assert!(state.on_append_reject(2, expected_prev, 12));
        }
        assert_eq!(next(&state, 2), 3);

        state.on_sent(2, Some(10));
        assert!(state.on_append_success(2, 10));
        assert_eq!(state.progress(2).unwrap().match_index, 10);
        assert_eq!(next(&state, 2), 11);
    }

    #[test]
    fn test_replicating_reject_falls_back_to_search() {
        let (mut state, _) = leader_of_five();
        state.on_append_success(3, 6);
        state.on_sent(3, Some(10));
        assert_eq!(next(&state, 3), 11);

        // An old reply below the match is stale.
        assert!(!state.on_append_reject(3, 5, 5));

        // A pipelined batch was lost: the follower only has 6.
        assert!(state.on_append_reject(3, 10, 6));
        assert_eq!(next(&state, 3), 7);
        assert_eq!(state.progress(3).unwrap().state, ProgressState::Searching { paused: false });
    }

    #[test]
    fn test_reject_never_drops_below_match() {
        let (mut state, _) = leader_of_five();
        state.on_append_success(3, 6);
        state.on_sent(3, Some(10));
        assert!(state.on_append_reject(3, 10, 0));
        assert_eq!(next(&state, 3), 7);
    }

    #[test]
    fn test_check_quorum_sliding_window() {
        let (mut state, membership) = leader_of_five();
        // Everyone counts as active at accession.
        assert!(state.check_quorum(1, &membership, 10).is_ok());

        for _ in 0..9 {
            state.tick();
        }
        state.mark_active(2);
        state.mark_active(5);
        state.tick();
        // Peers 3 and 4 went quiet ten ticks ago; 2 and 5 just replied.
        assert!(state.check_quorum(1, &membership, 10).is_ok());

        for _ in 0..9 {
            state.tick();
        }
        state.mark_active(2);
        state.tick();
        assert_eq!(
            state.check_quorum(1, &membership, 10),
            Err(RaftError::QuorumLost { active: 2, quorum: 3 })
        );
    }
}
