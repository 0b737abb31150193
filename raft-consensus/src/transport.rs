//! In-process message transport with controllable reachability.
//!
//! Every node owns an unbounded crossbeam inbox. A [`Transport`] handle sends
//! into peer inboxes after consulting the shared [`LinkMatrix`]; a message on a
//! cut link is dropped silently, the way a real network loses packets. Sends
//! from one node happen on its worker thread in order, and each inbox is FIFO,
//! so messages on one directed pair are never reordered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

use crate::message::Envelope;
use crate::partition::PartitionController;
use crate::types::NodeId;

/// Reachability flag for every ordered pair of nodes.
///
/// Only cut links are stored, so the default is fully connected. Each call
/// takes the lock once, so a multi-pair update is never observed half-applied
/// by a single send.
#[derive(Debug, Default)]
pub struct LinkMatrix {
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LinkMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reachable(&self, src: NodeId, dst: NodeId) -> bool {
        if src == dst {
            return true;
        }
        let cut = self.cut.read().unwrap_or_else(PoisonError::into_inner);
        !cut.contains(&(src, dst))
    }

    pub fn set_reachable(&self, src: NodeId, dst: NodeId, reachable: bool) {
        self.set_pairs([(src, dst)], reachable);
    }

    pub fn set_pairs(&self, pairs: impl IntoIterator<Item = (NodeId, NodeId)>, reachable: bool) {
        let mut cut = self.cut.write().unwrap_or_else(PoisonError::into_inner);
        for (src, dst) in pairs {
            if src == dst {
                continue;
            }
            if reachable {
                cut.remove(&(src, dst));
            } else {
                cut.insert((src, dst));
            }
        }
    }

    pub fn heal_all(&self) {
        self.cut
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Currently unreachable ordered pairs, sorted.
    pub fn cut_links(&self) -> Vec<(NodeId, NodeId)> {
        let cut = self.cut.read().unwrap_or_else(PoisonError::into_inner);
        let mut links: Vec<_> = cut.iter().copied().collect();
        links.sort_unstable();
        links
    }
}

/// Message counters for a network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// A set of node inboxes sharing one [`LinkMatrix`].
///
/// Cloning shares the same inboxes and links.
#[derive(Clone, Default)]
pub struct Network {
    links: Arc<LinkMatrix>,
    inboxes: Arc<RwLock<HashMap<NodeId, Sender<Envelope>>>>,
    counters: Arc<Counters>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links(&self) -> Arc<LinkMatrix> {
        Arc::clone(&self.links)
    }

    pub fn partition_controller(&self) -> PartitionController {
        PartitionController::new(self.links())
    }

    /// Creates the inbox for `id` and returns its transport handle.
    ///
    /// Registering an id again replaces its inbox; anything still queued in
    /// the old one is lost, as it would be when a process restarts.
    pub fn register(&self, id: NodeId) -> Transport {
        let (tx, rx) = unbounded();
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        Transport {
            id,
            network: self.clone(),
            inbox: rx,
        }
    }

    /// Removes the inbox for `id`; later sends to it are dropped.
    pub fn unregister(&self, id: NodeId) {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, envelope: Envelope) {
        if !self.links.is_reachable(envelope.from, envelope.to) {
            self.record_drop(&envelope, "link cut");
            return;
        }
        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.to)
            .cloned();
        match inbox {
            Some(tx) => {
                if let Err(err) = tx.send(envelope) {
                    self.record_drop(&err.0, "inbox closed");
                } else {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => self.record_drop(&envelope, "no inbox"),
        }
    }

    fn record_drop(&self, envelope: &Envelope, reason: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(
            from = envelope.from,
            to = envelope.to,
            kind = envelope.message.kind(),
            reason,
            "dropped message"
        );
    }
}

/// One node's endpoint on a [`Network`].
pub struct Transport {
    id: NodeId,
    network: Network,
    inbox: Receiver<Envelope>,
}

impl Transport {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Best-effort send. Never reports failure to the caller.
    pub fn send(&self, envelope: Envelope) {
        debug_assert_eq!(envelope.from, self.id, "sending on another node's transport");
        self.network.deliver(envelope);
    }

    pub fn inbox(&self) -> &Receiver<Envelope> {
        &self.inbox
    }

    /// Delivery-time check: a message that was queued before its link was
    /// cut is dropped rather than handed to the node.
    pub fn accept(&self, envelope: &Envelope) -> bool {
        if self.network.links.is_reachable(envelope.from, envelope.to) {
            return true;
        }
        self.network.record_drop(envelope, "link cut before delivery");
        false
    }
}
