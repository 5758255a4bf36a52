//! Replicated state plane (C8/C9): leader-based consensus over a durable
//! log, exposed through a small key/value FSM.

pub mod fsm;
pub mod join;
pub mod node;
pub mod store;

pub use fsm::{Command, ReplicatedFsm, WatchEvent};
pub use node::{AppendEntriesArgs, AppendEntriesReply, LeaderObserver, RaftNode, RequestVoteArgs, RequestVoteReply, Role};
pub use store::{HardState, LogEntry, LogStore};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

/// The internal Raft RPC surface (`request_vote` / `append_entries`),
/// served on `raft_bind_addr` and distinct from the public join API.
pub fn raft_router(node: Arc<RaftNode>) -> Router {
	Router::new()
		.route("/raft/request_vote", post(request_vote_handler))
		.route("/raft/append_entries", post(append_entries_handler))
		.with_state(node)
}

async fn request_vote_handler(
	State(node): State<Arc<RaftNode>>,
	Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteReply> {
	Json(node.handle_request_vote(args))
}

async fn append_entries_handler(
	State(node): State<Arc<RaftNode>>,
	Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesReply> {
	Json(node.handle_append_entries(args))
}
