//! Partition controller: flips reachability between groups of nodes.

use std::sync::Arc;

use tracing::info;

use crate::transport::LinkMatrix;
use crate::types::NodeId;

/// Mutates a [`LinkMatrix`] to model network partitions.
///
/// Only the pairs between the two groups change. Links inside a group and
/// links to third parties keep whatever state they had. All operations are
/// idempotent.
#[derive(Clone)]
pub struct PartitionController {
    links: Arc<LinkMatrix>,
}

impl PartitionController {
    pub fn new(links: Arc<LinkMatrix>) -> Self {
        Self { links }
    }

    /// Cuts every link between `group_a` and `group_b`, in both directions.
    pub fn inject_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        info!(?group_a, ?group_b, "injecting partition");
        self.links.set_pairs(cross_pairs(group_a, group_b), false);
    }

    /// Restores every link between `group_a` and `group_b`, in both directions.
    pub fn recover_partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        info!(?group_a, ?group_b, "recovering partition");
        self.links.set_pairs(cross_pairs(group_a, group_b), true);
    }

    /// Cuts the single directed link `src -> dst`.
    pub fn cut_link(&self, src: NodeId, dst: NodeId) {
        info!(src, dst, "cutting one-way link");
        self.links.set_reachable(src, dst, false);
    }

    pub fn restore_link(&self, src: NodeId, dst: NodeId) {
        self.links.set_reachable(src, dst, true);
    }

    /// Separates `node` from every other node in `members`.
    pub fn isolate(&self, node: NodeId, members: &[NodeId]) {
        let others: Vec<NodeId> = members.iter().copied().filter(|&m| m != node).collect();
        self.inject_partition(&[node], &others);
    }

    pub fn heal_all(&self) {
        info!("healing all links");
        self.links.heal_all();
    }

    pub fn is_reachable(&self, src: NodeId, dst: NodeId) -> bool {
        self.links.is_reachable(src, dst)
    }
}

fn cross_pairs(group_a: &[NodeId], group_b: &[NodeId]) -> Vec<(NodeId, NodeId)> {
    group_a
        .iter()
        .flat_map(|&a| group_b.iter().flat_map(move |&b| [(a, b), (b, a)]))
        .collect()
}
