//! Integration tests for leader election with threaded nodes.
//!
//! Every node runs its own worker thread and talks to its peers through the
//! in-process network, so timing is real and elections race.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use raft_consensus::cluster::Cluster;
use raft_consensus::config::RaftOptions;
use raft_consensus::types::{NodeId, StateRole, Term};

const TIMEOUT: Duration = Duration::from_secs(5);

fn spawn(n: usize) -> Result<Cluster> {
    Ok(Cluster::spawn(n, RaftOptions::for_testing())?)
}

/// Waits for a specific node to become leader.
fn wait_for_node_to_become_leader(cluster: &Cluster, id: NodeId, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            bail!("timeout waiting for node {id} to become leader");
        }
        if let Ok(status) = cluster.node(id)?.status() {
            if status.role == StateRole::Leader {
                return Ok(());
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits for exactly one leader among running nodes.
fn wait_for_single_leader(cluster: &Cluster, timeout: Duration) -> Result<NodeId> {
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            bail!("timeout waiting for leader election");
        }
        let leaders = cluster.leaders();
        if leaders.len() == 1 {
            return Ok(leaders[0]);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_integration_basic_election() -> Result<()> {
    let mut cluster = spawn(3)?;

    cluster.node(1)?.campaign()?;
    wait_for_node_to_become_leader(&cluster, 1, TIMEOUT)?;
    assert_eq!(cluster.wait_leader(TIMEOUT)?, 1);

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_election_without_campaign() -> Result<()> {
    let mut cluster = spawn(5)?;

    let leader = cluster.wait_leader(TIMEOUT)?;
    assert!(cluster.ids().contains(&leader));
    assert_eq!(cluster.leaders(), vec![leader]);

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_single_node_elects_itself() -> Result<()> {
    let mut cluster = spawn(1)?;

    // No election timeout has to pass.
    let status = cluster.node(1)?.status()?;
    assert_eq!(status.role, StateRole::Leader);
    assert_eq!(status.leader_id, Some(1));

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_follower_timeout() -> Result<()> {
    let mut cluster = spawn(3)?;

    cluster.node(1)?.campaign()?;
    wait_for_node_to_become_leader(&cluster, 1, TIMEOUT)?;

    // Simulate leader failure.
    cluster.stop(1)?;

    let new_leader = wait_for_single_leader(&cluster, TIMEOUT)?;
    assert!(new_leader == 2 || new_leader == 3, "new leader should be node 2 or 3");

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_forced_campaign_follower() -> Result<()> {
    let mut cluster = spawn(3)?;

    cluster.node(1)?.campaign()?;
    wait_for_node_to_become_leader(&cluster, 1, TIMEOUT)?;

    cluster.node(2)?.campaign()?;
    thread::sleep(cluster.election_timeout() * 2);

    let leader = wait_for_single_leader(&cluster, TIMEOUT)?;
    assert!(leader == 1 || leader == 2, "leader should be node 1 or 2");

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_forced_campaign_leader() -> Result<()> {
    let mut cluster = spawn(3)?;

    cluster.node(1)?.campaign()?;
    wait_for_node_to_become_leader(&cluster, 1, TIMEOUT)?;
    let term = cluster.node(1)?.current_term()?;

    // The leader steps down and campaigns in a new term.
    cluster.node(1)?.campaign()?;
    thread::sleep(cluster.election_timeout() * 2);

    let leader = wait_for_single_leader(&cluster, TIMEOUT)?;
    assert!(cluster.node(leader)?.current_term()? > term);

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_no_split_brain() -> Result<()> {
    let mut cluster = spawn(3)?;

    cluster.node(1)?.campaign()?;
    wait_for_node_to_become_leader(&cluster, 1, TIMEOUT)?;

    cluster.node(2)?.campaign()?;

    // Poll during the election: two nodes may briefly both think they lead,
    // but never in the same term.
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(1) {
        let mut leaders: Vec<(NodeId, Term)> = Vec::new();
        for id in 1..=3 {
            if let Ok(status) = cluster.node(id)?.status() {
                if status.role == StateRole::Leader {
                    leaders.push((id, status.term));
                }
            }
        }
        for (i, (a, term_a)) in leaders.iter().enumerate() {
            for (b, term_b) in &leaders[i + 1..] {
                assert_ne!(term_a, term_b, "SPLIT BRAIN: nodes {a} and {b} lead term {term_a}");
            }
        }
        thread::sleep(Duration::from_millis(10));
    }

    wait_for_single_leader(&cluster, TIMEOUT)?;

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_leader_step_down() -> Result<()> {
    let mut cluster = spawn(3)?;

    cluster.node(1)?.campaign()?;
    wait_for_node_to_become_leader(&cluster, 1, TIMEOUT)?;
    let initial_term = cluster.node(1)?.current_term()?;

    cluster.node(2)?.campaign()?;
    thread::sleep(cluster.election_timeout() * 2);

    let final_term = cluster.node(1)?.current_term()?;
    assert!(
        final_term > initial_term,
        "node 1 term should have updated: {initial_term} -> {final_term}"
    );

    let leader = wait_for_single_leader(&cluster, TIMEOUT)?;
    assert_eq!(cluster.wait_leader(TIMEOUT)?, leader);

    cluster.shutdown()?;
    Ok(())
}

#[test]
fn test_integration_restarted_node_keeps_term() -> Result<()> {
    let mut cluster = spawn(3)?;

    let leader = cluster.wait_leader(TIMEOUT)?;
    let follower = cluster.ids().into_iter().find(|&id| id != leader).expect("a follower");
    let term = cluster.node(follower)?.current_term()?;

    cluster.restart(follower)?;
    assert!(cluster.node(follower)?.current_term()? >= term);

    assert_eq!(cluster.wait_leader(TIMEOUT)?, leader);

    cluster.shutdown()?;
    Ok(())
}
