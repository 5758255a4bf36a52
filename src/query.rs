//! Serveable-set read API (C13 collaborator surface): a thin read-only
//! facade the DNS front-end (out of scope per §1) consults at query time,
//! combining the Overwatch's shadow backend registry, the veto table, and
//! the subnet aggregator.
//!
//! Deliberately thin: it only snapshots state already owned elsewhere,
//! never mutates.

use crate::arbiter::{Arbiter, Endpoint};
use crate::health::CheckType;
use crate::subnet::SubnetAggregator;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// A shadow copy of one agent-owned backend, as last reported via gossip
/// `HealthUpdate` (§3: "the Overwatch holds only a shadow copy keyed by
/// endpoint").
#[derive(Debug, Clone)]
pub struct ShadowBackend {
	pub service: String,
	pub region: String,
	pub weight: u32,
	pub healthy: bool,
	/// Scheme to use for the arbiter's own external probe of this endpoint
	/// (§4.10); not reported by the agent's hysteresis check, since the
	/// external validator probes independently rather than trusting it.
	pub check_type: CheckType,
	pub path: String,
	pub host_header: Option<String>,
}

#[derive(Default)]
pub struct ShadowRegistry {
	entries: RwLock<HashMap<Endpoint, ShadowBackend>>,
}

impl ShadowRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn update(&self, endpoint: Endpoint, backend: ShadowBackend) {
		self.entries.write().unwrap().insert(endpoint, backend);
	}

	pub fn get(&self, endpoint: &Endpoint) -> Option<ShadowBackend> {
		self.entries.read().unwrap().get(endpoint).cloned()
	}

	pub fn snapshot_for_service(&self, service: &str) -> Vec<(Endpoint, ShadowBackend)> {
		self.entries
			.read()
			.unwrap()
			.iter()
			.filter(|(_, b)| b.service == service)
			.map(|(e, b)| (*e, b.clone()))
			.collect()
	}

	/// All known shadow entries, regardless of service; the overwatch probe
	/// cycle walks this to decide which endpoints to externally validate.
	pub fn snapshot_all(&self) -> Vec<(Endpoint, ShadowBackend)> {
		self.entries
			.read()
			.unwrap()
			.iter()
			.map(|(e, b)| (*e, b.clone()))
			.collect()
	}
}

/// A weighted, healthy backend candidate for a routing algorithm
/// (§4.1 "Design notes": routing algorithms are a collaborator, this struct
/// is the interface boundary they consume).
#[derive(Debug, Clone)]
pub struct ServeableBackend {
	pub address: IpAddr,
	pub port: u16,
	pub weight: u32,
	pub region: String,
}

/// Read-only query surface: combines shadow health, veto overrides, and
/// latency stats into one "what can I serve right now" answer.
pub struct ServeableSet {
	shadow: Arc<ShadowRegistry>,
	arbiter: Arc<Arbiter>,
	subnets: Arc<SubnetAggregator>,
}

impl ServeableSet {
	pub fn new(shadow: Arc<ShadowRegistry>, arbiter: Arc<Arbiter>, subnets: Arc<SubnetAggregator>) -> Self {
		Self {
			shadow,
			arbiter,
			subnets,
		}
	}

	/// Backends for `service` that are both agent-healthy and not vetoed.
	pub fn serveable_backends(&self, service: &str) -> Vec<ServeableBackend> {
		self.shadow
			.snapshot_for_service(service)
			.into_iter()
			.filter(|(endpoint, backend)| backend.healthy && self.arbiter.is_serveable(endpoint))
			.map(|(endpoint, backend)| ServeableBackend {
				address: endpoint.address,
				port: endpoint.port,
				weight: backend.weight,
				region: backend.region,
			})
			.collect()
	}

	/// Best-known latency estimate for a client address, used by a
	/// latency-aware routing algorithm to break ties between otherwise
	/// equal backends.
	pub fn client_latency_estimate(&self, client_addr: IpAddr) -> Option<std::time::Duration> {
		let report = self.subnets.to_report();
		let ipv4_prefix = |s: &str| s.contains('.');
		report
			.into_iter()
			.find(|entry| {
				let net_matches = if ipv4_prefix(&entry.prefix) {
					matches!(client_addr, IpAddr::V4(_)) && entry.prefix.starts_with(&client_subnet_key(client_addr))
				} else {
					matches!(client_addr, IpAddr::V6(_))
				};
				net_matches
			})
			.map(|entry| std::time::Duration::from_nanos(entry.ewma_ns))
	}
}

fn client_subnet_key(addr: IpAddr) -> String {
	match addr {
		IpAddr::V4(v4) => {
			let octets = v4.octets();
			format!("{}.{}.{}.", octets[0], octets[1], octets[2])
		}
		IpAddr::V6(_) => String::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ArbiterConfig;
	use std::time::Duration;

	fn endpoint(addr: &str, port: u16) -> Endpoint {
		Endpoint {
			address: addr.parse().unwrap(),
			port,
		}
	}

	#[test]
	fn unhealthy_shadow_entries_are_excluded() {
		let shadow = Arc::new(ShadowRegistry::new());
		let arbiter = Arc::new(Arbiter::new(ArbiterConfig {
			external_check_interval: Duration::from_secs(10),
			external_timeout: Duration::from_secs(5),
			veto_mode: crate::config::VetoMode::Balanced,
			veto_threshold: 3,
		}));
		let subnets = Arc::new(SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 1, 100));

		shadow.update(
			endpoint("10.0.0.1", 80),
			ShadowBackend {
				service: "web".into(),
				region: "eu-west".into(),
				weight: 100,
				healthy: false,
				check_type: crate::health::CheckType::Tcp,
				path: String::new(),
				host_header: None,
			},
		);
		shadow.update(
			endpoint("10.0.0.2", 80),
			ShadowBackend {
				service: "web".into(),
				region: "eu-west".into(),
				weight: 100,
				healthy: true,
				check_type: crate::health::CheckType::Tcp,
				path: String::new(),
				host_header: None,
			},
		);

		let set = ServeableSet::new(shadow, arbiter, subnets);
		let backends = set.serveable_backends("web");
		assert_eq!(backends.len(), 1);
		assert_eq!(backends[0].address, "10.0.0.2".parse::<IpAddr>().unwrap());
	}
}
