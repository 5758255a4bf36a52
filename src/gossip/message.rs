//! Wire types for the gossip protocol (§4.7, §3 data model).

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
	Alive,
	Suspect,
	Dead,
	Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
	Agent,
	Overwatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberMetadata {
	pub role: NodeRole,
	pub region: String,
	pub version: String,
	pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
	pub name: String,
	pub address: String,
	pub port: u16,
	pub liveness: Liveness,
	pub metadata: Option<MemberMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthUpdatePayload {
	pub service: String,
	pub address: String,
	pub region: String,
	pub port: u16,
	pub weight: u32,
	pub healthy: bool,
	pub previous_healthy: bool,
	pub latency_ms: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub check_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictivePayload {
	pub node_id: String,
	pub kind: String,
	pub reason: String,
	pub value: f64,
	pub threshold: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
	ForceUnhealthy,
	Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverridePayload {
	pub addr: String,
	pub action: OverrideAction,
	pub reason: String,
	/// Unix seconds; absent for `clear`.
	pub expiry: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatePayload {
	pub member: Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySubnetEntry {
	pub prefix: String,
	pub ewma_ns: u64,
}

/// Not one of the four wire-level `type` values but shares their shape;
/// `GossipTransport::broadcast_latency_report` is the only way to send one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyReportPayload {
	pub agent_id: String,
	pub backend: String,
	pub region: String,
	pub subnets: Vec<LatencySubnetEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
	HealthUpdate(HealthUpdatePayload),
	Predictive(PredictivePayload),
	Override(OverridePayload),
	NodeState(NodeStatePayload),
	LatencyReport(LatencyReportPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub source_node_id: String,
	pub ts: u64,
	pub payload: Payload,
}

impl Envelope {
	pub fn new(source_node_id: impl Into<String>, payload: Payload) -> Self {
		let ts = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or(Duration::ZERO)
			.as_secs();
		Self {
			source_node_id: source_node_id.into(),
			ts,
			payload,
		}
	}
}

/// Internal control-plane messages alongside user envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WireMessage {
	Join { member: Member },
	Leave { name: String },
	User { envelope: Envelope },
	Ping,
	Pong,
}
