//! Read-only liveness queries over running nodes.
//!
//! A node that has shut down counts as knowing no leader.

use std::thread;
use std::time::{Duration, Instant};

use crate::runtime::NodeHandle;
use crate::types::{NodeId, StateRole};

/// How often the waiting helpers re-poll.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `predicate` every `poll` until it returns true or `timeout` elapses.
///
/// The predicate is always evaluated at least once, and once more at the
/// deadline, so a zero timeout is a single check.
pub fn wait_for_condition(timeout: Duration, poll: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(poll.min(deadline - now));
    }
}

/// The leader `node` currently recognizes, if any.
pub fn current_leader(node: &NodeHandle) -> Option<NodeId> {
    node.current_leader().ok().flatten()
}

/// True if any node in `nodes` knows of a leader.
pub fn has_leader(nodes: &[&NodeHandle]) -> bool {
    nodes.iter().any(|node| current_leader(node).is_some())
}

/// Nodes in `nodes` that hold the leader role.
pub fn leaders(nodes: &[&NodeHandle]) -> Vec<NodeId> {
    nodes
        .iter()
        .filter(|node| {
            node.status()
                .is_ok_and(|status| status.role == StateRole::Leader)
        })
        .map(|node| node.id())
        .collect()
}

/// The leader every node in `nodes` agrees on, provided it is one of them.
pub fn agreed_leader(nodes: &[&NodeHandle]) -> Option<NodeId> {
    let mut agreed = None;
    for node in nodes {
        let leader = current_leader(node)?;
        match agreed {
            None => agreed = Some(leader),
            Some(other) if other != leader => return None,
            Some(_) => {}
        }
    }
    agreed.filter(|leader| nodes.iter().any(|node| node.id() == *leader))
}

/// Waits until `nodes` agree on one of them as leader and keep agreeing for
/// `stable_for`. Returns that leader.
pub fn wait_for_stable_leader(nodes: &[&NodeHandle], timeout: Duration, stable_for: Duration) -> Option<NodeId> {
    let mut candidate: Option<(NodeId, Instant)> = None;
    let mut stable = None;
    wait_for_condition(timeout, POLL_INTERVAL, || {
        match (agreed_leader(nodes), candidate) {
            (Some(leader), Some((seen, since))) if leader == seen => {
                if since.elapsed() >= stable_for {
                    stable = Some(leader);
                    return true;
                }
            }
            (Some(leader), _) => candidate = Some((leader, Instant::now())),
            (None, _) => candidate = None,
        }
        false
    });
    stable
}

/// Waits until no node in `nodes` knows of a leader.
pub fn wait_for_no_leader(nodes: &[&NodeHandle], timeout: Duration) -> bool {
    wait_for_condition(timeout, POLL_INTERVAL, || !has_leader(nodes))
}
