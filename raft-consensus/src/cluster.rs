//! In-process cluster harness for tests and the operator console.
//!
//! A [`Cluster`] spawns every member on one [`Network`], so partitions can be
//! injected between any groups of nodes. Nodes can be stopped and restarted
//! on their storage to model crashes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::liveness::{self, POLL_INTERVAL};
use crate::membership::Membership;
use crate::partition::PartitionController;
use crate::runtime::{spawn_node, NodeConfig, NodeHandle, NodeStatus};
use crate::storage::{MemStorage, Storage};
use crate::transport::Network;
use crate::types::{LogEntry, NodeId};

/// A set of running nodes sharing one network.
pub struct Cluster {
    membership: Membership,
    options: RaftOptions,
    network: Network,
    nodes: BTreeMap<NodeId, NodeHandle>,
    /// Storage of stopped nodes, kept for restarts.
    stopped: BTreeMap<NodeId, Arc<dyn Storage>>,
    writes: AtomicU64,
}

impl Cluster {
    /// Spawns `size` nodes with ids `1..=size`.
    pub fn spawn(size: usize, options: RaftOptions) -> Result<Self> {
        Self::with_membership(Membership::sequential(size), options)
    }

    pub fn with_membership(membership: Membership, options: RaftOptions) -> Result<Self> {
        options.validate()?;
        if membership.is_empty() {
            return Err(RaftError::Config("cluster needs at least one member".into()));
        }
        let mut cluster = Self {
            membership,
            options,
            network: Network::new(),
            nodes: BTreeMap::new(),
            stopped: BTreeMap::new(),
            writes: AtomicU64::new(0),
        };
        for id in cluster.ids() {
            cluster.start(id, Arc::new(MemStorage::new()))?;
        }
        info!(members = ?cluster.ids(), "cluster started");
        Ok(cluster)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.membership.members().iter().copied().collect()
    }

    /// Ids of nodes that are currently running.
    pub fn running(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn options(&self) -> &RaftOptions {
        &self.options
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeHandle> {
        match self.nodes.get(&id) {
            Some(node) => Ok(node),
            None if self.membership.contains(id) => Err(RaftError::Shutdown(id)),
            None => Err(RaftError::UnknownNode(id)),
        }
    }

    fn handles(&self, ids: &[NodeId]) -> Result<Vec<&NodeHandle>> {
        ids.iter().map(|&id| self.node(id)).collect()
    }

    pub fn status(&self) -> Vec<Result<NodeStatus>> {
        self.nodes.values().map(NodeHandle::status).collect()
    }

    /// Upper bound of the election timeout window, for sizing waits.
    pub fn election_timeout(&self) -> Duration {
        self.options.election_timeout()
    }

    pub fn partition(&self) -> PartitionController {
        self.network.partition_controller()
    }

    pub fn inject_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.partition().inject_partition(group_a, group_b);
    }

    pub fn recover_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.partition().recover_partition(group_a, group_b);
    }

    /// Nodes that currently hold the leader role.
    pub fn leaders(&self) -> Vec<NodeId> {
        let handles: Vec<&NodeHandle> = self.nodes.values().collect();
        liveness::leaders(&handles)
    }

    /// Waits for all running nodes to agree on a stable leader.
    pub fn wait_leader(&self, timeout: Duration) -> Result<NodeId> {
        self.wait_members_for_leader(&self.running(), timeout)
    }

    /// Waits until every node in `members` recognizes the same member as
    /// leader for at least one heartbeat interval.
    pub fn wait_members_for_leader(&self, members: &[NodeId], timeout: Duration) -> Result<NodeId> {
        let handles = self.handles(members)?;
        liveness::wait_for_stable_leader(&handles, timeout, self.options.heartbeat_interval())
            .ok_or_else(|| RaftError::timeout(format!("leader among {members:?}"), timeout))
    }

    /// Waits until no node in `members` knows of a leader.
    pub fn wait_no_leader(&self, members: &[NodeId], timeout: Duration) -> Result<()> {
        let handles = self.handles(members)?;
        if liveness::wait_for_no_leader(&handles, timeout) {
            Ok(())
        } else {
            Err(RaftError::timeout(format!("no leader among {members:?}"), timeout))
        }
    }

    /// Commits a uniquely tagged write through whichever member leads, then
    /// waits for every node in `members` to apply it.
    ///
    /// Retries while no leader is known or the proposal is lost to a leader
    /// change. Returns the committed entry.
    pub fn must_progress(&self, members: &[NodeId], timeout: Duration) -> Result<LogEntry> {
        let deadline = Instant::now() + timeout;
        let seq = self.writes.fetch_add(1, Ordering::Relaxed);
        let payload = format!("progress-{seq}").into_bytes();
        let handles = self.handles(members)?;

        let entry = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RaftError::timeout("write to commit", timeout));
            }
            let leader = liveness::leaders(&handles).first().copied();
            let Some(leader) = leader else {
                thread::sleep(POLL_INTERVAL);
                continue;
            };
            let attempt = remaining.min(self.election_timeout() * 2);
            match self.node(leader)?.propose(payload.clone(), attempt) {
                Ok(entry) => break entry,
                Err(err) if err.is_retryable() => {
                    debug!(leader, %err, "retrying progress write");
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let applied_everywhere = liveness::wait_for_condition(remaining, POLL_INTERVAL, || {
            handles.iter().all(|node| {
                matches!(node.committed_entries(entry.index).next(), Some(Ok(ref applied)) if *applied == entry)
            })
        });
        if !applied_everywhere {
            return Err(RaftError::timeout(
                format!("entry {} to apply on {members:?}", entry.index),
                timeout,
            ));
        }
        Ok(entry)
    }

    /// Stops a node, keeping its storage. Messages to it are dropped.
    pub fn stop(&mut self, id: NodeId) -> Result<()> {
        let Some(mut node) = self.nodes.remove(&id) else {
            return Err(if self.membership.contains(id) {
                RaftError::Shutdown(id)
            } else {
                RaftError::UnknownNode(id)
            });
        };
        let storage = node.storage();
        node.shutdown()?;
        self.stopped.insert(id, storage);
        Ok(())
    }

    /// Restarts a node on the storage it had when it stopped. A running node
    /// is stopped first.
    pub fn restart(&mut self, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            self.stop(id)?;
        }
        let storage = self.stopped.remove(&id).ok_or(RaftError::UnknownNode(id))?;
        info!(node = id, "restarting node");
        self.start(id, storage)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        for id in self.running() {
            self.stop(id)?;
        }
        Ok(())
    }

    fn start(&mut self, id: NodeId, storage: Arc<dyn Storage>) -> Result<()> {
        let handle = spawn_node(
            NodeConfig {
                id,
                membership: self.membership.clone(),
                options: self.options.clone(),
                storage,
            },
            &self.network,
        )?;
        self.nodes.insert(id, handle);
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
