//! Multi-node consensus integration tests (§4.8, §8 invariants 7/8): leader
//! uniqueness across a real three-node cluster and follower write refusal.
//!
//! Real components wired end to end, gated behind the `integration-tests`
//! feature so they don't run in a default `cargo test`.

use opengslb::config::ConsensusConfig;
use opengslb::consensus::{self, ReplicatedFsm};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn free_addr() -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);
	addr.to_string()
}

fn consensus_config(node_id: &str, raft_addr: &str, api_addr: &str, bootstrap: bool, join: Vec<String>, data_dir: &std::path::Path) -> ConsensusConfig {
	ConsensusConfig {
		node_id: node_id.to_string(),
		raft_bind_addr: raft_addr.to_string(),
		api_bind_addr: api_addr.to_string(),
		bootstrap,
		join,
		heartbeat: Duration::from_millis(50),
		election_timeout: Duration::from_millis(300),
		leader_lease: Duration::from_millis(40),
		snapshot_interval: Duration::from_secs(120),
		snapshot_log_threshold: 10_000,
		join_max_attempts: 10,
		join_backoff_cap: Duration::from_millis(200),
		data_dir: data_dir.to_path_buf(),
	}
}

struct RunningNode {
	raft: Arc<consensus::RaftNode>,
	_servers: Vec<tokio::task::JoinHandle<()>>,
	_timers: tokio::task::JoinHandle<()>,
}

async fn spawn_node(id: u64, config: ConsensusConfig) -> RunningNode {
	let fsm = Arc::new(ReplicatedFsm::new());
	let raft_addr = config.raft_bind_addr.clone();
	let api_addr = config.api_bind_addr.clone();
	let raft = Arc::new(consensus::RaftNode::new(id, config, fsm).unwrap());

	let raft_listener = TcpListener::bind(&raft_addr).await.unwrap();
	let rpc_task = {
		let raft = raft.clone();
		tokio::spawn(async move {
			let _ = axum::serve(raft_listener, consensus::raft_router(raft)).await;
		})
	};

	let api_listener = TcpListener::bind(&api_addr).await.unwrap();
	let join_task = {
		let raft = raft.clone();
		tokio::spawn(async move {
			let _ = axum::serve(api_listener, consensus::join::router(raft)).await;
		})
	};

	let timers = raft.spawn_timers();

	RunningNode {
		raft,
		_servers: vec![rpc_task, join_task],
		_timers: timers,
	}
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn three_node_cluster_has_exactly_one_leader() {
	let dir1 = tempfile::tempdir().unwrap();
	let dir2 = tempfile::tempdir().unwrap();
	let dir3 = tempfile::tempdir().unwrap();

	let raft1 = free_addr().await;
	let api1 = free_addr().await;
	let raft2 = free_addr().await;
	let api2 = free_addr().await;
	let raft3 = free_addr().await;
	let api3 = free_addr().await;

	let node1 = spawn_node(1, consensus_config("n1", &raft1, &api1, true, vec![], dir1.path())).await;
	node1.raft.bootstrap().unwrap();

	let node2 = spawn_node(2, consensus_config("n2", &raft2, &api2, false, vec![api1.clone()], dir2.path())).await;
	node2.raft.join().await.unwrap();

	let node3 = spawn_node(3, consensus_config("n3", &raft3, &api3, false, vec![api1.clone()], dir3.path())).await;
	node3.raft.join().await.unwrap();

	tokio::time::sleep(Duration::from_millis(300)).await;

	let leaders = [&node1, &node2, &node3]
		.iter()
		.filter(|n| n.raft.is_leader())
		.count();
	assert_eq!(leaders, 1, "exactly one node must hold leadership");
	assert!(node1.raft.is_leader(), "bootstrap node should remain leader absent any failure");
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn follower_apply_is_refused_with_not_leader() {
	let dir1 = tempfile::tempdir().unwrap();
	let dir2 = tempfile::tempdir().unwrap();

	let raft1 = free_addr().await;
	let api1 = free_addr().await;
	let raft2 = free_addr().await;
	let api2 = free_addr().await;

	let node1 = spawn_node(1, consensus_config("n1", &raft1, &api1, true, vec![], dir1.path())).await;
	node1.raft.bootstrap().unwrap();

	let node2 = spawn_node(2, consensus_config("n2", &raft2, &api2, false, vec![api1.clone()], dir2.path())).await;
	node2.raft.join().await.unwrap();

	tokio::time::sleep(Duration::from_millis(150)).await;

	let result = node2
		.raft
		.apply(consensus::Command::Set {
			key: b"k".to_vec(),
			value: b"v".to_vec(),
		})
		.await;
	assert!(matches!(result, Err(opengslb::error::AppError::NotLeader)));

	node1
		.raft
		.apply(consensus::Command::Set {
			key: b"k".to_vec(),
			value: b"v".to_vec(),
		})
		.await
		.unwrap();
}
