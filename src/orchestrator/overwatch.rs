//! Overwatch orchestrator (C13, §4.13): wires consensus, gossip, the shadow
//! registry, the arbiter, and the cluster-wide latency view into one
//! leader-gated lifecycle.
//!
//! Startup/shutdown sequencing follows the same shape as
//! `orchestrator::agent`; the leader-gated probe cycle hooks
//! `consensus::node::RaftNode::register_leader_observer`.

use crate::arbiter::{Arbiter, AgentClaim, Endpoint};
use crate::config::OverwatchConfig;
use crate::consensus::{Command, RaftNode};
use crate::error::AppResult;
use crate::gossip::message::{HealthUpdatePayload, OverridePayload, PredictivePayload};
use crate::gossip::{Envelope, GossipTransport, Payload};
use crate::health::CheckTarget;
use crate::identity::Identity;
use crate::observability::MetricsRegistry;
use crate::query::{ShadowBackend, ShadowRegistry};
use crate::subnet::SubnetAggregator;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Last predictive signal per node id, as gossiped by agents (§4.4/§4.13).
/// Mirrors `ShadowRegistry`'s "shadow copy, never mutated locally" stance.
#[derive(Debug, Clone)]
pub struct PredictiveRecord {
	pub kind: String,
	pub reason: String,
	pub value: f64,
	pub threshold: f64,
	pub ts: SystemTime,
}

#[derive(Default)]
pub struct PredictiveView {
	by_node: RwLock<HashMap<String, PredictiveRecord>>,
}

impl PredictiveView {
	fn update(&self, node_id: String, record: PredictiveRecord) {
		self.by_node.write().unwrap().insert(node_id, record);
	}

	pub fn get(&self, node_id: &str) -> Option<PredictiveRecord> {
		self.by_node.read().unwrap().get(node_id).cloned()
	}

	pub fn snapshot(&self) -> Vec<(String, PredictiveRecord)> {
		self.by_node
			.read()
			.unwrap()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	}
}

fn parse_endpoint(address: &str, port: u16) -> Option<Endpoint> {
	IpAddr::from_str(address).ok().map(|address| Endpoint { address, port })
}

struct Running {
	probe_task: Option<JoinHandle<()>>,
}

/// Drives one overwatch node's lifecycle. Holds the leader-gated probe
/// cycle: only the elected leader ever runs external validation (§4.10,
/// §4.13), followers only reflect what gossip tells them.
pub struct OverwatchOrchestrator {
	config: OverwatchConfig,
	identity: Identity,
	raft: Arc<RaftNode>,
	transport: Arc<dyn GossipTransport>,
	arbiter: Arc<Arbiter>,
	shadow: Arc<ShadowRegistry>,
	subnets: Arc<SubnetAggregator>,
	predictive: Arc<PredictiveView>,
	running: Mutex<Running>,
	is_leader: AtomicBool,
}

impl OverwatchOrchestrator {
	pub fn new(
		config: OverwatchConfig,
		identity: Identity,
		raft: Arc<RaftNode>,
		transport: Arc<dyn GossipTransport>,
		metrics: Arc<MetricsRegistry>,
	) -> Arc<Self> {
		let arbiter = Arc::new(Arbiter::new(config.arbiter.clone()).with_metrics(metrics.clone()));
		let shadow = Arc::new(ShadowRegistry::new());
		// Cluster-wide latency view has no per-agent notion of "this node's
		// samples", so prefix granularity/TTL reuse the latency defaults but
		// sample/capacity bounds are generous: every agent in the cluster
		// reports into the same table.
		let subnets = Arc::new(SubnetAggregator::new(24, 48, 0.3, std::time::Duration::from_secs(24 * 3600), 1, 1_000_000));
		let predictive = Arc::new(PredictiveView::default());

		let this = Arc::new(Self {
			config,
			identity,
			raft,
			transport,
			arbiter,
			shadow,
			subnets,
			predictive,
			running: Mutex::new(Running { probe_task: None }),
			is_leader: AtomicBool::new(false),
		});

		this.register_gossip_handlers();
		this.register_leader_observer();
		this
	}

	pub fn shadow_registry(&self) -> Arc<ShadowRegistry> {
		self.shadow.clone()
	}

	pub fn arbiter(&self) -> Arc<Arbiter> {
		self.arbiter.clone()
	}

	pub fn subnets(&self) -> Arc<SubnetAggregator> {
		self.subnets.clone()
	}

	pub fn predictive_view(&self) -> Arc<PredictiveView> {
		self.predictive.clone()
	}

	fn register_gossip_handlers(self: &Arc<Self>) {
		let this = self.clone();
		self.transport.register_handler(
			"health_update",
			Arc::new(move |envelope: Envelope| -> AppResult<()> {
				if let Payload::HealthUpdate(payload) = envelope.payload {
					this.on_health_update(payload);
				}
				Ok(())
			}),
		);

		let this = self.clone();
		self.transport.register_handler(
			"override",
			Arc::new(move |envelope: Envelope| -> AppResult<()> {
				if let Payload::Override(payload) = envelope.payload {
					this.on_override(payload);
				}
				Ok(())
			}),
		);

		let this = self.clone();
		self.transport.register_handler(
			"predictive",
			Arc::new(move |envelope: Envelope| -> AppResult<()> {
				if let Payload::Predictive(payload) = envelope.payload {
					this.on_predictive(payload);
				}
				Ok(())
			}),
		);

		let this = self.clone();
		self.transport.register_handler(
			"latency_report",
			Arc::new(move |envelope: Envelope| -> AppResult<()> {
				if let Payload::LatencyReport(payload) = envelope.payload {
					this.on_latency_report(payload);
				}
				Ok(())
			}),
		);
	}

	fn on_health_update(&self, payload: HealthUpdatePayload) {
		let Some(endpoint) = parse_endpoint(&payload.address, payload.port) else {
			warn!(address = %payload.address, "dropping health update with unparseable address");
			return;
		};
		if payload.service.is_empty() {
			// Empty-service health update is an agent deregistration marker
			// (see orchestrator::agent::stop).
			return;
		}
		let check_type = match payload.check_type.as_str() {
			"https" => crate::health::CheckType::Https,
			"tcp" => crate::health::CheckType::Tcp,
			_ => crate::health::CheckType::Http,
		};
		self.shadow.update(
			endpoint,
			ShadowBackend {
				service: payload.service,
				region: payload.region,
				weight: payload.weight,
				healthy: payload.healthy,
				check_type,
				path: String::new(),
				host_header: None,
			},
		);
	}

	fn on_override(&self, payload: OverridePayload) {
		let Some((address, port)) = payload.addr.rsplit_once(':') else {
			warn!(addr = %payload.addr, "dropping override with unparseable endpoint");
			return;
		};
		let Ok(port) = port.parse::<u16>() else {
			warn!(addr = %payload.addr, "dropping override with unparseable port");
			return;
		};
		let Some(endpoint) = parse_endpoint(address, port) else {
			warn!(addr = %payload.addr, "dropping override with unparseable address");
			return;
		};
		self.arbiter.apply_override(endpoint, payload.action, payload.expiry);
	}

	fn on_predictive(&self, payload: PredictivePayload) {
		self.predictive.update(
			payload.node_id,
			PredictiveRecord {
				kind: payload.kind,
				reason: payload.reason,
				value: payload.value,
				threshold: payload.threshold,
				ts: SystemTime::now(),
			},
		);
	}

	fn on_latency_report(&self, payload: crate::gossip::LatencyReportPayload) {
		let now = SystemTime::now();
		for entry in payload.subnets {
			self.subnets.ingest_report_entry(&entry.prefix, entry.ewma_ns, now);
		}
	}

	/// Hook the Raft leadership callback to start/stop the probe cycle; this
	/// is the only place external validation ever runs (§4.10's "runs only
	/// on the consensus leader").
	fn register_leader_observer(self: &Arc<Self>) {
		let this = self.clone();
		self.raft.register_leader_observer(Arc::new(move |is_leader| {
			let this = this.clone();
			if is_leader {
				this.is_leader.store(true, Ordering::SeqCst);
				this.start_probe_cycle();
			} else {
				this.is_leader.store(false, Ordering::SeqCst);
				this.stop_probe_cycle();
			}
		}));
	}

	fn start_probe_cycle(self: &Arc<Self>) {
		let mut running = self.running.lock().unwrap();
		if running.probe_task.is_some() {
			return;
		}
		info!(node_id = %self.identity.node_id(), "became overwatch leader, starting probe cycle");

		let this = self.clone();
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(this.config.arbiter.external_check_interval);
			loop {
				ticker.tick().await;
				if !this.is_leader.load(Ordering::SeqCst) {
					break;
				}
				this.run_probe_cycle().await;
				this.arbiter.cleanup();
			}
		});
		running.probe_task = Some(task);
	}

	fn stop_probe_cycle(&self) {
		let mut running = self.running.lock().unwrap();
		if let Some(task) = running.probe_task.take() {
			task.abort();
			info!("stepped down as overwatch leader, stopped probe cycle");
		}
	}

	async fn run_probe_cycle(&self) {
		for (endpoint, backend) in self.shadow.snapshot_all() {
			let claim = if backend.healthy {
				AgentClaim::Healthy
			} else {
				AgentClaim::Unhealthy
			};
			let target = CheckTarget {
				address: endpoint.address,
				port: endpoint.port,
				check_type: backend.check_type,
				path: backend.path.clone(),
				host_header: backend.host_header.clone(),
				timeout: self.config.arbiter.external_timeout,
				healthy_statuses: 200..300,
			};
			self.arbiter
				.probe_cycle(endpoint, claim, self.transport.as_ref(), &target)
				.await;
		}
	}

	/// Bootstrap or join the Raft cluster per configuration, then start the
	/// gossip transport. Probe-cycle start/stop is entirely leadership-driven
	/// from here on (see `register_leader_observer`).
	pub async fn start(&self) -> AppResult<()> {
		self.transport.start().await?;
		if self.config.consensus.bootstrap {
			self.raft.bootstrap()?;
		} else {
			self.raft.join().await?;
		}
		Ok(())
	}

	/// Flush one barrier command through Raft, useful for tests and for a
	/// management API that wants a linearizable read (§4.9).
	pub async fn barrier(&self) -> AppResult<()> {
		self.raft.barrier().await
	}

	/// Directly write a key through the replicated FSM; a thin pass-through
	/// kept here rather than on `RaftNode` so callers don't need to build
	/// `Command` variants themselves.
	pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> AppResult<()> {
		self.raft.apply(Command::Set { key, value }).await
	}

	pub async fn stop(&self) {
		self.stop_probe_cycle();
		let _ = self.transport.stop().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_endpoint_rejects_garbage_address() {
		assert!(parse_endpoint("not-an-ip", 80).is_none());
	}

	#[test]
	fn parse_endpoint_accepts_v4_and_v6() {
		assert!(parse_endpoint("10.0.0.1", 80).is_some());
		assert!(parse_endpoint("::1", 443).is_some());
	}

	#[test]
	fn predictive_view_tracks_latest_per_node() {
		let view = PredictiveView::default();
		view.update(
			"eu-west-1".into(),
			PredictiveRecord {
				kind: "bleed".into(),
				reason: "cpu_high".into(),
				value: 90.0,
				threshold: 85.0,
				ts: SystemTime::now(),
			},
		);
		assert_eq!(view.get("eu-west-1").unwrap().reason, "cpu_high");
		assert!(view.get("unknown").is_none());
	}
}
