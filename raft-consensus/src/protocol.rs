//! Console command parsing for the interactive cluster shell.
//!
//! Commands are case-insensitive and most have a one-letter alias:
//! - `PUT <payload>` (alias: `p`) - commit a write through the leader
//! - `STATUS` (alias: `s`) - show every node's role, leader, term and log
//! - `PARTITION <ids> <ids>` - cut all links between two comma-separated groups
//! - `HEAL [<ids> <ids>]` - restore links between two groups, or all links
//! - `CAMPAIGN <id>` (alias: `c`) - force a node to start an election
//! - `RESTART <id>` (alias: `r`) - crash a node and start it on its storage
//! - `HELP` (alias: `h`), `EXIT` (alias: `e`)

use anyhow::{anyhow, Context, Result};

use crate::types::NodeId;

pub const HELP: &str = "Commands: PUT/p <payload>, STATUS/s, PARTITION <a,b> <c,d>, \
HEAL [<a,b> <c,d>], CAMPAIGN/c <id>, RESTART/r <id>, HELP/h, EXIT/e";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Put { payload: String },
    Status,
    Partition { group_a: Vec<NodeId>, group_b: Vec<NodeId> },
    /// `None` heals every link.
    Heal { groups: Option<(Vec<NodeId>, Vec<NodeId>)> },
    Campaign { node: NodeId },
    Restart { node: NodeId },
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of shell input.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "P" => "PUT",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "R" => "RESTART",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };
        let args = &parts[1..];

        match (normalized, args.len()) {
            ("EXIT", 0) => Ok(ConsoleCommand::Exit),
            ("HELP", 0) => Ok(ConsoleCommand::Help),
            ("STATUS", 0) => Ok(ConsoleCommand::Status),
            ("PUT", n) if n > 0 => Ok(ConsoleCommand::Put {
                payload: args.join(" "),
            }),
            ("PARTITION", 2) => {
                let (group_a, group_b) = parse_groups(args[0], args[1])?;
                Ok(ConsoleCommand::Partition { group_a, group_b })
            }
            ("HEAL", 0) => Ok(ConsoleCommand::Heal { groups: None }),
            ("HEAL", 2) => Ok(ConsoleCommand::Heal {
                groups: Some(parse_groups(args[0], args[1])?),
            }),
            ("CAMPAIGN", 1) => Ok(ConsoleCommand::Campaign {
                node: parse_id(args[0])?,
            }),
            ("RESTART", 1) => Ok(ConsoleCommand::Restart {
                node: parse_id(args[0])?,
            }),
            ("PUT", _) => Err(anyhow!("PUT requires a payload: PUT <payload>")),
            ("PARTITION", _) => Err(anyhow!("PARTITION requires two groups: PARTITION 1,2 3,4,5")),
            ("HEAL", _) => Err(anyhow!("HEAL takes no groups or two: HEAL 1,2 3,4,5")),
            ("CAMPAIGN", _) | ("RESTART", _) => Err(anyhow!("{normalized} requires a node id")),
            _ => Err(anyhow!("invalid command. {HELP}")),
        }
    }
}

fn parse_id(raw: &str) -> Result<NodeId> {
    raw.parse()
        .with_context(|| format!("invalid node id '{raw}'"))
}

fn parse_group(raw: &str) -> Result<Vec<NodeId>> {
    let ids = raw
        .split(',')
        .filter(|part| !part.is_empty())
        .map(parse_id)
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() {
        return Err(anyhow!("empty node group '{raw}'"));
    }
    Ok(ids)
}

fn parse_groups(a: &str, b: &str) -> Result<(Vec<NodeId>, Vec<NodeId>)> {
    let group_a = parse_group(a)?;
    let group_b = parse_group(b)?;
    if let Some(id) = group_a.iter().find(|id| group_b.contains(id)) {
        return Err(anyhow!("node {id} is in both groups"));
    }
    Ok((group_a, group_b))
}
