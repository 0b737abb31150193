//! Worker runtime for consensus nodes.
//!
//! Each node runs as an actor on its own thread:
//!
//! - **Worker thread**: owns the [`RaftNode`], processes one event at a time
//! - **Transport inbox**: peer messages arrive on a crossbeam channel
//! - **[`NodeHandle`]**: callers talk to the worker through a request channel
//!
//! The node is never shared, so it needs no locks. The only shared state is
//! the storage engine, which observers read, and the network's link matrix.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::membership::Membership;
use crate::node::RaftNode;
use crate::storage::Storage;
use crate::transport::{Network, Transport};
use crate::types::{Index, LogEntry, NodeId, StateRole, Term};

/// Upper bound on how long a handle waits for the worker to answer a
/// request that does not involve consensus.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for spawning a node.
pub struct NodeConfig {
    pub id: NodeId,
    pub membership: Membership,
    pub options: RaftOptions,
    /// Shared with the handle so committed entries can be read without the
    /// worker, and reused across restarts.
    pub storage: Arc<dyn Storage>,
}

/// Snapshot of a node's volatile state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: StateRole,
    pub leader_id: Option<NodeId>,
    pub term: Term,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_index: Index,
}

/// Requests sent from a [`NodeHandle`] to its worker.
enum ClientRequest {
    Append {
        payload: Vec<u8>,
        respond_to: Sender<Result<Index>>,
    },
    Propose {
        payload: Vec<u8>,
        respond_to: Sender<Result<LogEntry>>,
    },
    Status {
        respond_to: Sender<Result<NodeStatus>>,
    },
    Campaign {
        respond_to: Sender<Result<()>>,
    },
    Shutdown,
}

/// A proposal waiting for its index to commit.
///
/// Matching on index alone is not enough: after a leader change the index
/// may commit with another leader's entry. The term tells them apart.
struct PendingProposal {
    term: Term,
    respond_to: Sender<Result<LogEntry>>,
}

/// Handle for talking to a running node.
///
/// Dropping the handle shuts the worker down.
pub struct NodeHandle {
    id: NodeId,
    request_tx: Sender<ClientRequest>,
    storage: Arc<dyn Storage>,
    applied: Arc<AtomicU64>,
    election_timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Appends `payload` if this node is the leader and returns its index
    /// without waiting for it to commit.
    pub fn append(&self, payload: Vec<u8>) -> Result<Index> {
        self.call(|respond_to| ClientRequest::Append { payload, respond_to })
    }

    /// Appends `payload` and blocks until it commits.
    ///
    /// # Errors
    /// - `NotLeader` if this node does not lead
    /// - `ProposalDropped` if another entry committed at the same index
    /// - `Timeout` if nothing committed there within `timeout`
    pub fn propose(&self, payload: Vec<u8>, timeout: Duration) -> Result<LogEntry> {
        self.call_within(
            |respond_to| ClientRequest::Propose { payload, respond_to },
            timeout,
            "proposal to commit",
        )
    }

    pub fn status(&self) -> Result<NodeStatus> {
        self.call(|respond_to| ClientRequest::Status { respond_to })
    }

    /// The leader this node recognizes. `None` means "retry later".
    pub fn current_leader(&self) -> Result<Option<NodeId>> {
        Ok(self.status()?.leader_id)
    }

    pub fn current_term(&self) -> Result<Term> {
        Ok(self.status()?.term)
    }

    /// Forces this node to start an election.
    ///
    /// A follower or candidate campaigns in a new term; a leader steps down
    /// and campaigns again. Leader leases on the voters are overridden.
    pub fn campaign(&self) -> Result<()> {
        self.call(|respond_to| ClientRequest::Campaign { respond_to })
    }

    /// Committed entries starting at `from`, in index order.
    ///
    /// The iterator reads the shared storage and ends at the current commit
    /// point. Call again with [`CommittedEntries::position`] to resume.
    pub fn committed_entries(&self, from: Index) -> CommittedEntries {
        CommittedEntries {
            storage: Arc::clone(&self.storage),
            applied: Arc::clone(&self.applied),
            next: from.max(1),
        }
    }

    /// Upper bound of this node's election timeout window.
    pub fn election_timeout(&self) -> Duration {
        self.election_timeout
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stops the worker and waits for it to exit. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.request_tx.send(ClientRequest::Shutdown);
        worker.join().map_err(|_| {
            error!(node = self.id, "raft worker panicked");
            RaftError::Shutdown(self.id)
        })
    }

    fn call<T>(&self, request: impl FnOnce(Sender<Result<T>>) -> ClientRequest) -> Result<T> {
        self.call_within(request, REQUEST_TIMEOUT, "worker reply")
    }

    fn call_within<T>(
        &self,
        request: impl FnOnce(Sender<Result<T>>) -> ClientRequest,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = bounded(1);
        self.request_tx
            .send(request(resp_tx))
            .map_err(|_| RaftError::Shutdown(self.id))?;
        match resp_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RaftError::timeout(what, timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RaftError::Shutdown(self.id)),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Lazy, restartable stream of committed entries.
pub struct CommittedEntries {
    storage: Arc<dyn Storage>,
    applied: Arc<AtomicU64>,
    next: Index,
}

impl CommittedEntries {
    /// Index of the next entry the iterator will yield.
    pub fn position(&self) -> Index {
        self.next
    }
}

impl Iterator for CommittedEntries {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.applied.load(Ordering::Acquire) {
            return None;
        }
        match self.storage.entry(self.next) {
            Ok(Some(entry)) => {
                self.next += 1;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Spawns a node on `network` and returns a handle to it.
///
/// The node's inbox is registered before the worker starts, replacing any
/// inbox left by an earlier incarnation of the same id.
///
/// # Errors
/// Returns an error if the options are invalid, the id is not a member, the
/// storage cannot be read, or the worker thread cannot be spawned.
pub fn spawn_node(config: NodeConfig, network: &Network) -> Result<NodeHandle> {
    let NodeConfig {
        id,
        membership,
        options,
        storage,
    } = config;
    let election_timeout = options.election_timeout();
    let tick_interval = options.tick_interval;
    let node = RaftNode::new(id, membership, options, Arc::clone(&storage))?;

    let (request_tx, request_rx) = unbounded();
    let applied = Arc::new(AtomicU64::new(0));
    let mut worker = Worker::new(
        node,
        network.register(id),
        network.clone(),
        request_rx,
        Arc::clone(&applied),
        tick_interval,
    );

    let join = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node = id, %err, "raft worker crashed");
            }
        })
        .map_err(|err| {
            error!(node = id, %err, "failed to spawn raft worker");
            RaftError::Shutdown(id)
        })?;
    info!(node = id, "node started");

    Ok(NodeHandle {
        id,
        request_tx,
        storage,
        applied,
        election_timeout,
        worker: Some(join),
    })
}

/// The event loop that owns a [`RaftNode`].
struct Worker {
    node: RaftNode,
    transport: Transport,
    network: Network,
    request_rx: Receiver<ClientRequest>,
    applied: Arc<AtomicU64>,
    tick_interval: Duration,
    pending: BTreeMap<Index, PendingProposal>,
    last_role: StateRole,
    last_leader: Option<NodeId>,
}

impl Worker {
    fn new(
        node: RaftNode,
        transport: Transport,
        network: Network,
        request_rx: Receiver<ClientRequest>,
        applied: Arc<AtomicU64>,
        tick_interval: Duration,
    ) -> Self {
        let last_role = node.role();
        let last_leader = node.leader();
        Self {
            node,
            transport,
            network,
            request_rx,
            applied,
            tick_interval,
            pending: BTreeMap::new(),
            last_role,
            last_leader,
        }
    }

    /// Runs until shutdown is requested or every handle is gone.
    ///
    /// Each iteration waits for a request or a message until the next tick
    /// is due, ticks if it is, then flushes whatever the node produced.
    fn run(&mut self) -> Result<()> {
        let requests = self.request_rx.clone();
        let inbox = self.transport.inbox().clone();
        let mut last_tick = Instant::now();
        // Flush anything produced at construction (a single-node election).
        self.process_ready()?;

        loop {
            let timeout = self.tick_interval.saturating_sub(last_tick.elapsed());
            crossbeam_channel::select! {
                recv(requests) -> req => match req {
                    Ok(req) => {
                        if !self.handle_client_request(req) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(inbox) -> msg => {
                    if let Ok(envelope) = msg {
                        if self.transport.accept(&envelope) {
                            if let Err(err) = self.node.step(envelope) {
                                warn!(node = self.node.id(), %err, "failed to process message");
                            }
                        }
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick()?;
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.log_role_change();
        }

        self.shut_down();
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> bool {
        match req {
            ClientRequest::Append { payload, respond_to } => {
                let _ = respond_to.send(self.node.propose(payload));
            }
            ClientRequest::Propose { payload, respond_to } => match self.node.propose(payload) {
                Ok(index) => {
                    debug!(node = self.node.id(), index, "proposal appended");
                    self.pending.insert(index, PendingProposal {
                        term: self.node.term(),
                        respond_to,
                    });
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            ClientRequest::Campaign { respond_to } => {
                let _ = respond_to.send(self.node.campaign());
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus {
            node_id: self.node.id(),
            role: self.node.role(),
            leader_id: self.node.leader(),
            term: self.node.term(),
            commit_index: self.node.commit_index(),
            last_applied: self.node.last_applied(),
            last_index: self.node.last_index()?,
        })
    }

    /// Drains everything the node has produced: messages go to the
    /// transport, committed entries advance the applied watermark and
    /// resolve waiting proposals.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(ready) = self.node.poll_ready()? {
            for envelope in ready.messages {
                self.transport.send(envelope);
            }
            for entry in ready.committed {
                self.apply(entry);
            }
        }
        Ok(())
    }

    fn apply(&mut self, entry: LogEntry) {
        debug!(
            node = self.node.id(),
            index = entry.index,
            term = entry.term,
            noop = entry.is_noop(),
            "applied"
        );
        self.applied.store(entry.index, Ordering::Release);
        if let Some(pending) = self.pending.remove(&entry.index) {
            let result = if pending.term == entry.term {
                Ok(entry)
            } else {
                Err(RaftError::ProposalDropped { index: entry.index })
            };
            let _ = pending.respond_to.send(result);
        }
    }

    fn log_role_change(&mut self) {
        let role = self.node.role();
        let leader = self.node.leader();
        if role != self.last_role || leader != self.last_leader {
            info!(
                node = self.node.id(),
                term = self.node.term(),
                from = ?self.last_role,
                to = ?role,
                ?leader,
                "role changed"
            );
            self.last_role = role;
            self.last_leader = leader;
        }
    }

    fn shut_down(&mut self) {
        let id = self.node.id();
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.respond_to.send(Err(RaftError::Shutdown(id)));
        }
        self.network.unregister(id);
        info!(node = id, "node stopped");
    }
}
