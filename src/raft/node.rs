use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TicketError;
use crate::state_machine::{CommandOutcome, StateMachine};

use super::transport::{AppendReply, AppendRequest, Entry, PeerTransport, VoteReply, VoteRequest};
use super::{LogEntry, NodeId, NodeRole};

#[derive(Debug, Clone)]
pub struct RaftTiming {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub submit_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for RaftTiming {
    fn default() -> Self {
        RaftTiming {
            election_timeout_min: Duration::from_secs(5),
            election_timeout_max: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            submit_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

impl RaftTiming {
    pub fn from_config(config: &Config) -> Self {
        RaftTiming {
            election_timeout_min: Duration::from_secs_f64(config.election_timeout_min),
            election_timeout_max: Duration::from_secs_f64(config.election_timeout_max),
            heartbeat_interval: config.heartbeat(),
            submit_timeout: config.submit_deadline(),
            ..RaftTiming::default()
        }
    }
}

/// Point-in-time view of the consensus state, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub term: u64,
    pub commit_index: i64,
    pub last_applied: i64,
    pub log_len: usize,
    pub leader_hint: Option<NodeId>,
}

struct NodeInner {
    role: NodeRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: i64,
    last_applied: i64,
    election_deadline: Instant,
    leader_hint: Option<NodeId>,
    // Leader bookkeeping, discarded on step-down.
    next_index: HashMap<NodeId, usize>,
    match_index: HashMap<NodeId, i64>,
    // Submitters waiting for their entry to be applied, keyed by log index.
    waiters: HashMap<usize, oneshot::Sender<Result<CommandOutcome, TicketError>>>,
}

/// A single consensus replica: election, log replication and commit
/// advancement over a `PeerTransport`.
///
/// One mutex guards all consensus state. It is never held across a peer RPC:
/// callers snapshot what the outgoing call needs, release, call, then
/// reacquire and re-check that role and term are still what they snapshotted.
pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    cluster_size: usize,
    transport: Arc<dyn PeerTransport>,
    state_machine: Arc<StateMachine>,
    timing: RaftTiming,
    inner: Mutex<NodeInner>,
    commit_ready: Notify,
    shutdown: AtomicBool,
}

impl RaftNode {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        transport: Arc<dyn PeerTransport>,
        state_machine: Arc<StateMachine>,
        timing: RaftTiming,
    ) -> Arc<Self> {
        let cluster_size = peers.len() + 1;
        let deadline = Instant::now() + random_timeout(&timing);
        let node = RaftNode {
            id,
            peers,
            cluster_size,
            transport,
            state_machine,
            timing,
            inner: Mutex::new(NodeInner {
                role: NodeRole::Follower,
                current_term: 0,
                voted_for: None,
                log: Vec::new(),
                commit_index: -1,
                last_applied: -1,
                election_deadline: deadline,
                leader_hint: None,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                waiters: HashMap::new(),
            }),
            commit_ready: Notify::new(),
            shutdown: AtomicBool::new(false),
        };
        info!(node = %node.id, "initialized as follower");
        Arc::new(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the election monitor, heartbeat dispatcher and applier tasks.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.election_loop().await });
        let node = Arc::clone(self);
        tokio::spawn(async move { node.heartbeat_loop().await });
        let node = Arc::clone(self);
        tokio::spawn(async move { node.applier_loop().await });
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.commit_ready.notify_waiters();
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.role == NodeRole::Leader
    }

    pub async fn status(&self) -> RaftStatus {
        let inner = self.inner.lock().await;
        RaftStatus {
            node_id: self.id.clone(),
            role: inner.role,
            term: inner.current_term,
            commit_index: inner.commit_index,
            last_applied: inner.last_applied,
            log_len: inner.log.len(),
            leader_hint: inner.leader_hint.clone(),
        }
    }

    /// Append a command to the log and wait until the applier has run it.
    ///
    /// Returns the state machine's outcome, or `NotLeader` / `LostLeadership`
    /// / `ReplicationTimeout`. After the latter two the command may or may
    /// not have been applied; retries must reuse the same request id.
    pub async fn submit(self: &Arc<Self>, command: Bytes) -> Result<CommandOutcome, TicketError> {
        let (index, rx) = {
            let mut inner = self.inner.lock().await;
            if inner.role != NodeRole::Leader {
                return Err(TicketError::NotLeader {
                    hint: inner.leader_hint.clone(),
                });
            }
            let term = inner.current_term;
            inner.log.push(LogEntry {
                term,
                command,
                result: None,
            });
            let index = inner.log.len() - 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(index, tx);
            debug!(node = %self.id, index, term, "command appended to log");
            // A single-node cluster commits on its own majority.
            self.advance_commit(&mut inner);
            (index, rx)
        };

        self.broadcast_append();

        match timeout(self.timing.submit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TicketError::LostLeadership),
            Err(_) => {
                self.inner.lock().await.waiters.remove(&index);
                warn!(node = %self.id, index, "replication timeout");
                Err(TicketError::ReplicationTimeout)
            }
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn election_loop(self: Arc<Self>) {
        // Roughly a tenth of the shortest election window, so short test
        // timeouts are still detected promptly.
        let tick = (self.timing.election_timeout_min / 10).max(Duration::from_millis(10));
        let mut ticker = interval(tick);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let due = {
                let inner = self.inner.lock().await;
                inner.role != NodeRole::Leader && Instant::now() >= inner.election_deadline
            };
            if due {
                self.run_election().await;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(self.timing.heartbeat_interval);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.inner.lock().await.role == NodeRole::Leader {
                self.broadcast_append();
            }
        }
    }

    async fn applier_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            loop {
                // Snapshot the next committed-but-unapplied entry under the
                // node lock, then apply with only the state machine's own
                // lock held.
                let next = {
                    let inner = self.inner.lock().await;
                    if inner.last_applied < inner.commit_index {
                        let index = (inner.last_applied + 1) as usize;
                        Some((index, inner.log[index].command.clone()))
                    } else {
                        None
                    }
                };
                let Some((index, command)) = next else { break };

                let outcome = self.state_machine.apply(&command);

                let mut inner = self.inner.lock().await;
                inner.last_applied = index as i64;
                inner.log[index].result = Some(outcome.clone());
                if let Some(tx) = inner.waiters.remove(&index) {
                    let _ = tx.send(Ok(outcome));
                }
                debug!(node = %self.id, index, "applied log entry");
            }
            self.commit_ready.notified().await;
        }
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    async fn run_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut inner = self.inner.lock().await;
            if inner.role == NodeRole::Leader {
                return;
            }
            inner.role = NodeRole::Candidate;
            inner.current_term += 1;
            inner.voted_for = Some(self.id.clone());
            inner.leader_hint = None;
            inner.election_deadline = Instant::now() + random_timeout(&self.timing);
            info!(node = %self.id, term = inner.current_term, "election timeout, standing for election");
            (
                inner.current_term,
                inner.log.len() as i64 - 1,
                inner.log.last().map(|e| e.term).unwrap_or(0),
            )
        };

        let mut calls = FuturesUnordered::new();
        for peer in &self.peers {
            let request = VoteRequest {
                from: self.id.clone(),
                to: peer.clone(),
                term,
                last_log_index,
                last_log_term,
            };
            let transport = Arc::clone(&self.transport);
            let peer = peer.clone();
            let rpc_timeout = self.timing.rpc_timeout;
            calls.push(async move {
                match timeout(rpc_timeout, transport.request_vote(&peer, request)).await {
                    Ok(Ok(reply)) => Some(reply),
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "vote request failed");
                        None
                    }
                    Err(_) => {
                        debug!(peer = %peer, "vote request timed out");
                        None
                    }
                }
            });
        }

        let mut votes = 1usize;
        let majority = self.cluster_size / 2 + 1;

        // Single-node cluster: our own vote is the majority.
        if votes >= majority {
            let mut inner = self.inner.lock().await;
            if inner.role == NodeRole::Candidate && inner.current_term == term {
                self.become_leader(&mut inner);
                drop(inner);
                self.broadcast_append();
            }
            return;
        }

        while let Some(reply) = calls.next().await {
            let Some(reply) = reply else { continue };
            let mut inner = self.inner.lock().await;
            if reply.term > inner.current_term {
                info!(node = %self.id, term = reply.term, peer = %reply.from, "higher term in vote reply, stepping down");
                self.step_down(&mut inner, reply.term);
                return;
            }
            if inner.role != NodeRole::Candidate || inner.current_term != term {
                return;
            }
            if reply.vote_granted {
                votes += 1;
                debug!(node = %self.id, votes, majority, peer = %reply.from, "vote granted");
                if votes >= majority {
                    self.become_leader(&mut inner);
                    drop(inner);
                    self.broadcast_append();
                    return;
                }
            }
        }

        debug!(node = %self.id, term, votes, majority, "election round ended without majority");
    }

    fn become_leader(&self, inner: &mut NodeInner) {
        info!(node = %self.id, term = inner.current_term, "became leader");
        inner.role = NodeRole::Leader;
        inner.leader_hint = Some(self.id.clone());
        let log_len = inner.log.len();
        for peer in &self.peers {
            inner.next_index.insert(peer.clone(), log_len);
            inner.match_index.insert(peer.clone(), -1);
        }
    }

    /// Adopt a higher term and revert to follower.
    fn step_down(&self, inner: &mut NodeInner, term: u64) {
        let was_leader = inner.role == NodeRole::Leader;
        inner.role = NodeRole::Follower;
        inner.current_term = term;
        inner.voted_for = None;
        inner.leader_hint = None;
        inner.next_index.clear();
        inner.match_index.clear();
        inner.election_deadline = Instant::now() + random_timeout(&self.timing);
        if was_leader {
            for (_, tx) in inner.waiters.drain() {
                let _ = tx.send(Err(TicketError::LostLeadership));
            }
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Fire one replication round at every peer, in parallel.
    fn broadcast_append(self: &Arc<Self>) {
        for peer in self.peers.clone() {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.replicate_to(&peer).await });
        }
    }

    async fn replicate_to(&self, peer: &NodeId) {
        let request = {
            let inner = self.inner.lock().await;
            if inner.role != NodeRole::Leader {
                return;
            }
            let next = (*inner.next_index.get(peer).unwrap_or(&inner.log.len())).min(inner.log.len());
            let prev_index = next as i64 - 1;
            let prev_term = if prev_index >= 0 {
                inner.log[prev_index as usize].term
            } else {
                0
            };
            let entries = inner.log[next..]
                .iter()
                .map(|e| Entry {
                    term: e.term,
                    command: e.command.clone(),
                })
                .collect();
            AppendRequest {
                from: self.id.clone(),
                to: peer.clone(),
                term: inner.current_term,
                prev_index,
                prev_term,
                commit_index: inner.commit_index,
                entries,
            }
        };
        let term = request.term;

        let reply = match timeout(
            self.timing.rpc_timeout,
            self.transport.append_entries(peer, request),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!(node = %self.id, peer = %peer, error = %e, "append entries failed");
                return;
            }
            Err(_) => {
                debug!(node = %self.id, peer = %peer, "append entries timed out");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if reply.term > inner.current_term {
            info!(node = %self.id, term = reply.term, peer = %peer, "higher term in append reply, stepping down");
            self.step_down(&mut inner, reply.term);
            return;
        }
        if inner.role != NodeRole::Leader || inner.current_term != term {
            return;
        }
        if reply.entry_appended {
            inner.match_index.insert(peer.clone(), reply.match_index);
            inner
                .next_index
                .insert(peer.clone(), (reply.match_index + 1).max(0) as usize);
            self.advance_commit(&mut inner);
        } else {
            // Walk back one entry; the next heartbeat retries from there.
            let next = inner.next_index.entry(peer.clone()).or_insert(0);
            *next = next.saturating_sub(1);
        }
    }

    /// Advance `commit_index` to the largest index replicated on a majority.
    ///
    /// Only entries from the current term commit by counting; earlier-term
    /// entries commit implicitly once a current-term entry does.
    fn advance_commit(&self, inner: &mut NodeInner) {
        if inner.role != NodeRole::Leader {
            return;
        }
        let majority = self.cluster_size / 2 + 1;
        let mut n = inner.log.len() as i64 - 1;
        while n > inner.commit_index {
            if inner.log[n as usize].term == inner.current_term {
                let replicas = 1 + self
                    .peers
                    .iter()
                    .filter(|p| *inner.match_index.get(*p).unwrap_or(&-1) >= n)
                    .count();
                if replicas >= majority {
                    debug!(node = %self.id, commit_index = n, "commit index advanced");
                    inner.commit_index = n;
                    self.commit_ready.notify_one();
                    break;
                }
            }
            n -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Peer RPC handlers
    // ------------------------------------------------------------------

    pub async fn handle_request_vote(&self, request: VoteRequest) -> VoteReply {
        let mut inner = self.inner.lock().await;
        if request.term > inner.current_term {
            self.step_down(&mut inner, request.term);
        }

        let mut vote_granted = false;
        if request.term == inner.current_term {
            let can_vote = inner.voted_for.is_none()
                || inner.voted_for.as_deref() == Some(request.from.as_str());
            let last_log_index = inner.log.len() as i64 - 1;
            let last_log_term = inner.log.last().map(|e| e.term).unwrap_or(0);
            let log_ok = request.last_log_term > last_log_term
                || (request.last_log_term == last_log_term
                    && request.last_log_index >= last_log_index);
            if can_vote && log_ok {
                vote_granted = true;
                inner.voted_for = Some(request.from.clone());
                inner.election_deadline = Instant::now() + random_timeout(&self.timing);
                info!(node = %self.id, candidate = %request.from, term = request.term, "granted vote");
            }
        }

        VoteReply {
            from: self.id.clone(),
            to: request.from,
            term: inner.current_term,
            vote_granted,
        }
    }

    pub async fn handle_append_entries(&self, request: AppendRequest) -> AppendReply {
        let mut inner = self.inner.lock().await;

        if request.term < inner.current_term {
            return AppendReply {
                from: self.id.clone(),
                to: request.from,
                term: inner.current_term,
                entry_appended: false,
                match_index: -1,
            };
        }
        if request.term > inner.current_term {
            self.step_down(&mut inner, request.term);
        }

        // Valid leader for this term: record contact and yield candidacy.
        if inner.role == NodeRole::Candidate {
            inner.role = NodeRole::Follower;
        }
        inner.leader_hint = Some(request.from.clone());
        inner.election_deadline = Instant::now() + random_timeout(&self.timing);

        let prev_ok = request.prev_index == -1
            || (request.prev_index < inner.log.len() as i64
                && inner.log[request.prev_index as usize].term == request.prev_term);
        if !prev_ok {
            debug!(
                node = %self.id,
                prev_index = request.prev_index,
                log_len = inner.log.len(),
                "log consistency check failed"
            );
            return AppendReply {
                from: self.id.clone(),
                to: request.from,
                term: inner.current_term,
                entry_appended: false,
                match_index: -1,
            };
        }

        let mut index = (request.prev_index + 1) as usize;
        for entry in &request.entries {
            if index < inner.log.len() {
                if inner.log[index].term != entry.term {
                    inner.log.truncate(index);
                    inner.log.push(LogEntry {
                        term: entry.term,
                        command: entry.command.clone(),
                        result: None,
                    });
                }
            } else {
                inner.log.push(LogEntry {
                    term: entry.term,
                    command: entry.command.clone(),
                    result: None,
                });
            }
            index += 1;
        }

        let match_index = request.prev_index + request.entries.len() as i64;
        if request.commit_index > inner.commit_index {
            inner.commit_index = request.commit_index.min(match_index);
            self.commit_ready.notify_one();
        }

        AppendReply {
            from: self.id.clone(),
            to: request.from,
            term: inner.current_term,
            entry_appended: true,
            match_index,
        }
    }
}

fn random_timeout(timing: &RaftTiming) -> Duration {
    let min = timing.election_timeout_min.as_secs_f64();
    let max = timing.election_timeout_max.as_secs_f64();
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
}
