//! Overwatch arbiter (C10): external validation probes and the veto table
//! (§4.10). Runs only on the consensus leader.
//!
//! Grounded on `enrich::resilient_client::CircuitBreaker`'s threshold-based
//! state transitions (a disagreement counter promoted to a veto once it
//! crosses a configured threshold), reworked from a circuit breaker guarding
//! one upstream into a decision matrix that reconciles an agent's claim
//! against an independently observed external probe.

use crate::config::{ArbiterConfig, VetoMode};
use crate::gossip::{GossipTransport, Payload};
use crate::gossip::message::{OverrideAction, OverridePayload};
use crate::health::{CheckTarget, HealthChecker};
use crate::observability::MetricsRegistry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
	pub address: IpAddr,
	pub port: u16,
}

impl std::fmt::Display for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.address, self.port)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentClaim {
	Healthy,
	Unhealthy,
	Unknown,
}

struct VetoEntry {
	expiry: SystemTime,
}

struct ArbiterState {
	disagreements: HashMap<Endpoint, u32>,
	vetoes: HashMap<Endpoint, VetoEntry>,
}

/// Per-backend external validation and veto bookkeeping. One instance is
/// started per leadership term by the overwatch orchestrator (§4.13).
pub struct Arbiter {
	config: ArbiterConfig,
	checker: HealthChecker,
	state: RwLock<ArbiterState>,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl Arbiter {
	pub fn new(config: ArbiterConfig) -> Self {
		Self {
			config,
			checker: HealthChecker::new(),
			state: RwLock::new(ArbiterState {
				disagreements: HashMap::new(),
				vetoes: HashMap::new(),
			}),
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	/// `is_serveable(addr)` is false iff an unexpired veto entry exists (§3, §8 invariant 6).
	pub fn is_serveable(&self, endpoint: &Endpoint) -> bool {
		let state = self.state.read().unwrap();
		match state.vetoes.get(endpoint) {
			Some(entry) => entry.expiry <= SystemTime::now(),
			None => true,
		}
	}

	/// Apply an `Override` envelope received over gossip from the leader
	/// (§4.10/§6): a follower-side overwatch never runs the probe cycle
	/// itself, but still has to reflect the leader's veto table so queries
	/// answered locally agree with it.
	pub fn apply_override(&self, endpoint: Endpoint, action: OverrideAction, expiry_unix: Option<u64>) {
		let mut state = self.state.write().unwrap();
		match action {
			OverrideAction::ForceUnhealthy => {
				let expiry = expiry_unix
					.map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
					.unwrap_or_else(|| SystemTime::now() + 2 * self.config.external_check_interval);
				state.vetoes.insert(endpoint, VetoEntry { expiry });
				info!(%endpoint, "applied remote veto override");
			}
			OverrideAction::Clear => {
				state.vetoes.remove(&endpoint);
				state.disagreements.remove(&endpoint);
				info!(%endpoint, "cleared remote veto override");
			}
		}
	}

	/// Remove veto entries whose expiry has passed (§4.10's periodic cleanup).
	pub fn cleanup(&self) {
		let now = SystemTime::now();
		let mut state = self.state.write().unwrap();
		state.vetoes.retain(|_, entry| entry.expiry > now);
	}

	/// Run one probe cycle for `endpoint`, given the latest agent claim. If
	/// the agent already says unhealthy, the external probe is skipped
	/// entirely (§4.10: "trust the agent's local information").
	pub async fn probe_cycle(
		&self,
		endpoint: Endpoint,
		agent_claim: AgentClaim,
		transport: &dyn GossipTransport,
		target: &CheckTarget,
	) {
		if agent_claim == AgentClaim::Unhealthy {
			debug!(%endpoint, "agent claims unhealthy, skipping external probe");
			return;
		}

		let result = self.checker.check(target).await;
		if let Some(m) = &self.metrics {
			let label = if result.healthy { "healthy" } else { "unhealthy" };
			m.arbiter_probes_total.with_label_values(&[label]).inc();
		}
		self.apply_decision(endpoint, agent_claim, result.healthy, transport)
			.await;
	}

	/// Decision matrix from §4.10's table.
	async fn apply_decision(
		&self,
		endpoint: Endpoint,
		agent_claim: AgentClaim,
		external_healthy: bool,
		transport: &dyn GossipTransport,
	) {
		if external_healthy {
			let had_veto = {
				let mut state = self.state.write().unwrap();
				state.disagreements.remove(&endpoint);
				state.vetoes.remove(&endpoint).is_some()
			};
			if had_veto {
				info!(%endpoint, "external probe passed, clearing veto");
				let broadcast = transport
					.broadcast(Payload::Override(OverridePayload {
						addr: endpoint.to_string(),
						action: OverrideAction::Clear,
						reason: "external probe recovered".to_string(),
						expiry: None,
					}))
					.await;
				if let Err(e) = broadcast {
					if let Some(m) = &self.metrics {
						m.errors_total.with_label_values(&[e.kind()]).inc();
					}
					warn!(%endpoint, error = %e, "failed to broadcast veto clear");
				}
			}
			return;
		}

		if agent_claim == AgentClaim::Unhealthy {
			// Both agree it's unhealthy: no veto needed, reset the counter.
			self.state.write().unwrap().disagreements.remove(&endpoint);
			return;
		}

		// Agent says healthy (or unknown), external probe disagrees.
		let count = {
			let mut state = self.state.write().unwrap();
			let count = state.disagreements.entry(endpoint).or_insert(0);
			*count += 1;
			*count
		};

		if count < self.config.veto_threshold {
			debug!(%endpoint, count, "external probe disagreement, below veto threshold");
			return;
		}

		if self.config.veto_mode == VetoMode::Permissive {
			warn!(%endpoint, count, "disagreement reached threshold but veto_mode is permissive");
			return;
		}

		let expiry = SystemTime::now() + 2 * self.config.external_check_interval;
		self.state.write().unwrap().vetoes.insert(endpoint, VetoEntry { expiry });

		if let Some(m) = &self.metrics {
			let mode = match self.config.veto_mode {
				VetoMode::Strict => "strict",
				VetoMode::Balanced => "balanced",
				VetoMode::Permissive => "permissive",
			};
			m.veto_applications_total.with_label_values(&[mode]).inc();
		}

		let expiry_unix = expiry
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or(Duration::ZERO)
			.as_secs();

		info!(%endpoint, mode = ?self.config.veto_mode, "applying veto");
		let broadcast = transport
			.broadcast(Payload::Override(OverridePayload {
				addr: endpoint.to_string(),
				action: OverrideAction::ForceUnhealthy,
				reason: "external probe disagreement exceeded veto threshold".to_string(),
				expiry: Some(expiry_unix),
			}))
			.await;
		if let Err(e) = broadcast {
			if let Some(m) = &self.metrics {
				m.errors_total.with_label_values(&[e.kind()]).inc();
			}
			warn!(%endpoint, error = %e, "failed to broadcast veto");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gossip::message::{LatencyReportPayload, Member};
	use async_trait::async_trait;
	use std::sync::Arc;

	fn cfg(mode: VetoMode) -> ArbiterConfig {
		ArbiterConfig {
			external_check_interval: Duration::from_millis(10),
			external_timeout: Duration::from_secs(5),
			veto_mode: mode,
			veto_threshold: 3,
		}
	}

	struct FakeTransport {
		broadcasts: Arc<std::sync::Mutex<Vec<Payload>>>,
	}

	#[async_trait]
	impl GossipTransport for FakeTransport {
		async fn start(&self) -> crate::error::AppResult<()> {
			Ok(())
		}
		async fn stop(&self) -> crate::error::AppResult<()> {
			Ok(())
		}
		async fn broadcast(&self, payload: Payload) -> crate::error::AppResult<()> {
			self.broadcasts.lock().unwrap().push(payload);
			Ok(())
		}
		async fn send_to(&self, _member_name: &str, _payload: Payload) -> crate::error::AppResult<()> {
			Ok(())
		}
		async fn broadcast_latency_report(&self, _report: LatencyReportPayload) -> crate::error::AppResult<()> {
			Ok(())
		}
		async fn members(&self) -> Vec<Member> {
			vec![]
		}
		fn register_handler(&self, _variant: &'static str, _handler: crate::gossip::EnvelopeHandler) {}
	}

	fn endpoint() -> Endpoint {
		Endpoint {
			address: "10.0.0.5".parse().unwrap(),
			port: 8080,
		}
	}

	#[tokio::test]
	async fn strict_mode_vetoes_after_threshold_disagreements() {
		let arbiter = Arbiter::new(cfg(VetoMode::Strict));
		let transport = FakeTransport {
			broadcasts: Arc::new(std::sync::Mutex::new(Vec::new())),
		};
		let ep = endpoint();

		for _ in 0..2 {
			arbiter.apply_decision(ep, AgentClaim::Healthy, false, &transport).await;
			assert!(arbiter.is_serveable(&ep));
		}
		arbiter.apply_decision(ep, AgentClaim::Healthy, false, &transport).await;
		assert!(!arbiter.is_serveable(&ep));
		assert_eq!(transport.broadcasts.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn permissive_mode_never_vetoes() {
		let arbiter = Arbiter::new(cfg(VetoMode::Permissive));
		let transport = FakeTransport {
			broadcasts: Arc::new(std::sync::Mutex::new(Vec::new())),
		};
		let ep = endpoint();
		for _ in 0..5 {
			arbiter.apply_decision(ep, AgentClaim::Healthy, false, &transport).await;
		}
		assert!(arbiter.is_serveable(&ep));
		assert!(transport.broadcasts.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn passing_probe_clears_existing_veto() {
		let arbiter = Arbiter::new(cfg(VetoMode::Balanced));
		let transport = FakeTransport {
			broadcasts: Arc::new(std::sync::Mutex::new(Vec::new())),
		};
		let ep = endpoint();
		for _ in 0..3 {
			arbiter.apply_decision(ep, AgentClaim::Healthy, false, &transport).await;
		}
		assert!(!arbiter.is_serveable(&ep));

		arbiter.apply_decision(ep, AgentClaim::Healthy, true, &transport).await;
		assert!(arbiter.is_serveable(&ep));
	}

	#[tokio::test]
	async fn agreement_on_unhealthy_never_vetoes() {
		let arbiter = Arbiter::new(cfg(VetoMode::Strict));
		let transport = FakeTransport {
			broadcasts: Arc::new(std::sync::Mutex::new(Vec::new())),
		};
		let ep = endpoint();
		for _ in 0..5 {
			arbiter.apply_decision(ep, AgentClaim::Unhealthy, false, &transport).await;
		}
		assert!(arbiter.is_serveable(&ep));
		assert!(transport.broadcasts.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn expired_veto_is_removed_by_cleanup() {
		let arbiter = Arbiter::new(cfg(VetoMode::Strict));
		let transport = FakeTransport {
			broadcasts: Arc::new(std::sync::Mutex::new(Vec::new())),
		};
		let ep = endpoint();
		for _ in 0..3 {
			arbiter.apply_decision(ep, AgentClaim::Healthy, false, &transport).await;
		}
		assert!(!arbiter.is_serveable(&ep));

		tokio::time::sleep(Duration::from_millis(30)).await;
		arbiter.cleanup();
		assert!(arbiter.is_serveable(&ep));
	}
}
