//! Bootstrap configuration: timing options and the JSON cluster file.
//!
//! Timing is expressed in logical ticks. The runtime advances each node by one
//! tick every `tick_interval`, so with the defaults:
//! - election timeout: 10-20 ticks = 1-2 seconds, re-randomized on every reset
//! - heartbeat: 3 ticks = 300ms

use std::fs;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::membership::Membership;
use crate::types::NodeId;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_ELECTION_TIMEOUT_TICKS: Range<u32> = 10..20;
pub const DEFAULT_HEARTBEAT_TICKS: u32 = 3;
pub const DEFAULT_MAX_APPEND_ENTRIES: usize = 64;

/// Per-node consensus options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftOptions {
    /// Wall-clock length of one logical tick.
    pub tick_interval: Duration,
    /// Window the randomized election timeout is drawn from, in ticks.
    pub election_timeout_ticks: Range<u32>,
    /// Ticks between leader heartbeats. Must be below the window start.
    pub heartbeat_ticks: u32,
    /// Maximum entries carried by one AppendEntries message.
    pub max_append_entries: usize,
    /// Ask for a quorum before bumping the term.
    pub pre_vote: bool,
    /// Leaders step down without quorum contact; followers honor leader leases.
    pub check_quorum: bool,
    /// Seed for the election timeout generator. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            election_timeout_ticks: DEFAULT_ELECTION_TIMEOUT_TICKS,
            heartbeat_ticks: DEFAULT_HEARTBEAT_TICKS,
            max_append_entries: DEFAULT_MAX_APPEND_ENTRIES,
            pre_vote: true,
            check_quorum: true,
            seed: None,
        }
    }
}

impl RaftOptions {
    /// A fast profile for tests: 10ms ticks, 100-200ms elections, 20ms heartbeats.
    pub fn for_testing() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            election_timeout_ticks: 10..20,
            heartbeat_ticks: 2,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(RaftError::Config("tick interval must be non-zero".into()));
        }
        let window = &self.election_timeout_ticks;
        if window.start == 0 || window.is_empty() {
            return Err(RaftError::Config(format!(
                "election timeout window {}..{} must be non-empty and start above 0",
                window.start, window.end
            )));
        }
        if self.heartbeat_ticks == 0 || self.heartbeat_ticks >= window.start {
            return Err(RaftError::Config(format!(
                "heartbeat ({} ticks) must be shorter than the election timeout ({} ticks)",
                self.heartbeat_ticks, window.start
            )));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::Config("max_append_entries must be positive".into()));
        }
        Ok(())
    }

    /// Upper bound of the election timeout window as wall-clock time.
    ///
    /// Tests use this to size their waits.
    pub fn election_timeout(&self) -> Duration {
        self.tick_interval * self.election_timeout_ticks.end
    }

    /// Lower bound of the election timeout window; also the leader lease length.
    pub fn min_election_timeout(&self) -> Duration {
        self.tick_interval * self.election_timeout_ticks.start
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.tick_interval * self.heartbeat_ticks
    }

    /// Ticks of silence after which a follower forgets its leader: half the
    /// minimum election timeout, but always more than one heartbeat.
    pub fn leader_silence_ticks(&self) -> u32 {
        (self.election_timeout_ticks.start / 2).max(self.heartbeat_ticks + 1)
    }
}

/// JSON cluster bootstrap file.
///
/// ```json
/// { "members": [1, 2, 3], "tick_interval_ms": 50, "election_timeout_min_ms": 500 }
/// ```
///
/// Millisecond values are rounded up to whole ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterFile {
    pub members: Vec<NodeId>,
    pub tick_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_append_entries: usize,
    pub pre_vote: bool,
    pub check_quorum: bool,
}

impl Default for ClusterFile {
    fn default() -> Self {
        let opts = RaftOptions::default();
        Self {
            members: vec![1, 2, 3],
            tick_interval_ms: opts.tick_interval.as_millis() as u64,
            election_timeout_min_ms: opts.min_election_timeout().as_millis() as u64,
            election_timeout_max_ms: opts.election_timeout().as_millis() as u64,
            heartbeat_interval_ms: opts.heartbeat_interval().as_millis() as u64,
            max_append_entries: opts.max_append_entries,
            pre_vote: opts.pre_vote,
            check_quorum: opts.check_quorum,
        }
    }
}

impl ClusterFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| RaftError::Config(format!("read {}: {err}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| RaftError::Config(format!("parse cluster file: {err}")))
    }

    pub fn membership(&self) -> Result<Membership> {
        let membership = Membership::new(self.members.iter().copied());
        if membership.len() != self.members.len() {
            return Err(RaftError::Config("duplicate member ids".into()));
        }
        if membership.is_empty() {
            return Err(RaftError::Config("cluster needs at least one member".into()));
        }
        Ok(membership)
    }

    pub fn options(&self) -> Result<RaftOptions> {
        if self.tick_interval_ms == 0 {
            return Err(RaftError::Config("tick_interval_ms must be positive".into()));
        }
        let ticks = |field: &str, ms: u64| -> Result<u32> {
            u32::try_from(ms.div_ceil(self.tick_interval_ms)).map_err(|_| {
                RaftError::Config(format!(
                    "{field} of {ms}ms is too many {}ms ticks",
                    self.tick_interval_ms
                ))
            })
        };
        let options = RaftOptions {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            election_timeout_ticks: ticks("election_timeout_min_ms", self.election_timeout_min_ms)?
                ..ticks("election_timeout_max_ms", self.election_timeout_max_ms)?,
            heartbeat_ticks: ticks("heartbeat_interval_ms", self.heartbeat_interval_ms)?,
            max_append_entries: self.max_append_entries,
            pre_vote: self.pre_vote,
            check_quorum: self.check_quorum,
            seed: None,
        };
        options.validate()?;
        Ok(options)
    }
}
