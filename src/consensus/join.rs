//! Join endpoint and client (§4.8/§6): a node without `bootstrap` set POSTs
//! its identity to a configured peer's API address; a follower redirects to
//! the current leader rather than answering itself.
//!
//! A thin axum handler taking `State<...>` and returning a `Response`.

use super::node::{JoinOutcome, RaftNode};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
	pub node_id: u64,
	pub node_name: String,
	pub raft_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
	pub success: bool,
	pub message: String,
	pub leader_id: Option<u64>,
	pub leader_address: Option<String>,
}

pub fn router(node: Arc<RaftNode>) -> Router {
	Router::new()
		.route("/api/v1/cluster/join", post(handle_join))
		.with_state(node)
}

async fn handle_join(State(node): State<Arc<RaftNode>>, Json(req): Json<JoinRequest>) -> Response {
	if !node.is_leader() {
		let leader_addr = node.leader_api_addr();
		return match leader_addr {
			Some(addr) => {
				let mut resp = StatusCode::TEMPORARY_REDIRECT.into_response();
				if let Ok(value) = HeaderValue::from_str(&addr) {
					resp.headers_mut().insert("Location", value);
				}
				*resp.body_mut() = axum::body::Body::from(
					serde_json::to_vec(&JoinResponse {
						success: false,
						message: "not the leader".to_string(),
						leader_id: None,
						leader_address: Some(addr),
					})
					.unwrap_or_default(),
				);
				resp
			}
			None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
		};
	}

	match node.add_voter(
		req.node_id,
		req.node_name,
		req.raft_address.clone(),
		req.raft_address,
	) {
		Ok(()) => Json(JoinResponse {
			success: true,
			message: "joined".to_string(),
			leader_id: Some(node.node_id()),
			leader_address: None,
		})
		.into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}

/// Issue a single join attempt against `api_addr`. Returns `Ok(())` on
/// acceptance, `Err(Redirect)` with the leader's address on a 307, or
/// `Err(Retryable)` for anything else (connection refused, timeout, 5xx).
pub async fn send_join_request(
	client: &reqwest::Client,
	api_addr: &str,
	node_id: u64,
	node_name: &str,
	raft_address: &str,
) -> Result<(), JoinOutcome> {
	let url = format!("http://{api_addr}/api/v1/cluster/join");
	let resp = client
		.post(url)
		.json(&JoinRequest {
			node_id,
			node_name: node_name.to_string(),
			raft_address: raft_address.to_string(),
		})
		.timeout(std::time::Duration::from_secs(5))
		.send()
		.await
		.map_err(|e| JoinOutcome::Retryable(e.to_string()))?;

	match resp.status() {
		StatusCode::OK => {
			let body: JoinResponse = resp
				.json()
				.await
				.map_err(|e| JoinOutcome::Retryable(format!("decoding accept body: {e}")))?;
			if body.success {
				Ok(())
			} else {
				Err(JoinOutcome::Retryable(body.message))
			}
		}
		StatusCode::TEMPORARY_REDIRECT => {
			let body: JoinResponse = resp
				.json()
				.await
				.map_err(|e| JoinOutcome::Retryable(format!("decoding redirect body: {e}")))?;
			let leader_address = body
				.leader_address
				.ok_or_else(|| JoinOutcome::Retryable("redirect missing leader_address".to_string()))?;
			Err(JoinOutcome::Redirect(leader_address))
		}
		status => Err(JoinOutcome::Retryable(format!("unexpected status {status}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn join_request_roundtrips_through_json() {
		let req = JoinRequest {
			node_id: 2,
			node_name: "n2".into(),
			raft_address: "127.0.0.1:7000".into(),
		};
		let bytes = serde_json::to_vec(&req).unwrap();
		let decoded: JoinRequest = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(decoded.node_id, 2);
		assert_eq!(decoded.raft_address, "127.0.0.1:7000");
	}
}
