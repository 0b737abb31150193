//! Interactive in-process cluster.
//!
//! Starts every member of a cluster in this process on one simulated network
//! and reads console commands from stdin. Partitions, forced campaigns and
//! restarts can be driven by hand while the tracing output shows elections
//! and role changes.
//!
//! ```bash
//! RUST_LOG=info cargo run --bin cluster -- --nodes 5
//! cargo run --bin cluster -- --config cluster.json
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use raft_consensus::cluster::Cluster;
use raft_consensus::config::{ClusterFile, RaftOptions};
use raft_consensus::membership::Membership;
use raft_consensus::protocol::{ConsoleCommand, HELP};

/// Command-line arguments for the cluster shell.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run an in-process consensus cluster with an interactive shell")]
struct Args {
    /// Number of nodes, with ids 1..=N
    #[arg(long, default_value_t = 3, conflicts_with = "config")]
    nodes: usize,

    /// JSON cluster file with members and timing
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Override the logical tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let (membership, mut options) = match &args.config {
        Some(path) => {
            let file = ClusterFile::load(path)
                .with_context(|| format!("failed to load cluster file {}", path.display()))?;
            (file.membership()?, file.options()?)
        }
        None => (Membership::sequential(args.nodes), RaftOptions::default()),
    };
    if let Some(ms) = args.tick_ms {
        options.tick_interval = Duration::from_millis(ms);
    }

    let mut cluster = Cluster::with_membership(membership, options).context("failed to start cluster")?;
    println!("Cluster {:?} running. {HELP}", cluster.ids());

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => {
                if let Err(err) = execute(&mut cluster, command) {
                    println!("error: {err:#}");
                }
            }
            Err(err) => println!("error: {err}"),
        }
    }

    cluster.shutdown().context("failed to stop cluster")?;
    Ok(())
}

fn execute(cluster: &mut Cluster, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Put { payload } => {
            let timeout = cluster.election_timeout() * 4;
            let leader = cluster
                .wait_leader(timeout)
                .context("no leader available")?;
            let entry = cluster
                .node(leader)?
                .propose(payload.into_bytes(), timeout)
                .with_context(|| format!("write through leader {leader} failed"))?;
            println!("committed at index {} (term {}) via node {leader}", entry.index, entry.term);
        }
        ConsoleCommand::Status => {
            for status in cluster.status() {
                match status {
                    Ok(s) => println!(
                        "node {}: {:?} term={} leader={} commit={} applied={} last={}",
                        s.node_id,
                        s.role,
                        s.term,
                        s.leader_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                        s.commit_index,
                        s.last_applied,
                        s.last_index
                    ),
                    Err(err) => println!("{err}"),
                }
            }
            let links = cluster.network().links().cut_links();
            if !links.is_empty() {
                println!("cut links: {links:?}");
            }
            let stats = cluster.network().stats();
            println!("messages: sent={} dropped={}", stats.sent, stats.dropped);
        }
        ConsoleCommand::Partition { group_a, group_b } => {
            cluster.inject_partition(&group_a, &group_b);
            println!("partitioned {group_a:?} from {group_b:?}");
        }
        ConsoleCommand::Heal { groups: Some((group_a, group_b)) } => {
            cluster.recover_partition(&group_a, &group_b);
            println!("healed {group_a:?} <-> {group_b:?}");
        }
        ConsoleCommand::Heal { groups: None } => {
            cluster.partition().heal_all();
            println!("healed all links");
        }
        ConsoleCommand::Campaign { node } => {
            cluster.node(node)?.campaign()?;
            println!("node {node} is campaigning");
        }
        ConsoleCommand::Restart { node } => {
            cluster.restart(node)?;
            println!("node {node} restarted");
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Exit => {}
    }
    Ok(())
}
