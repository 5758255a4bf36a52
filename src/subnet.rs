//! Subnet aggregator (C6): EWMA per prefix, bounded and TTL-pruned (§4.6).
//!
//! Core algorithm, hand-written; prefix arithmetic grounded in `ipnet`
//! (present in the `vishalbelsare-agentgateway` workspace dependencies).

use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use crate::rtt::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
	V4(Ipv4Net),
	V6(Ipv6Net),
}

impl std::fmt::Display for Prefix {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Prefix::V4(n) => write!(f, "{n}"),
			Prefix::V6(n) => write!(f, "{n}"),
		}
	}
}

fn prefix_of(addr: IpAddr, v4_len: u8, v6_len: u8) -> Prefix {
	match addr {
		IpAddr::V4(v4) => Prefix::V4(Ipv4Net::new(v4, v4_len).unwrap().trunc()),
		IpAddr::V6(v6) => Prefix::V6(Ipv6Net::new(v6, v6_len).unwrap().trunc()),
	}
}

fn parse_prefix(s: &str) -> Option<Prefix> {
	if let Ok(v4) = s.parse::<Ipv4Net>() {
		return Some(Prefix::V4(v4.trunc()));
	}
	if let Ok(v6) = s.parse::<Ipv6Net>() {
		return Some(Prefix::V6(v6.trunc()));
	}
	None
}

#[derive(Debug, Clone)]
pub struct SubnetStats {
	pub ewma: Duration,
	pub min: Duration,
	pub max: Duration,
	pub sample_count: u64,
	pub last_updated: SystemTime,
}

impl SubnetStats {
	fn seed(rtt: Duration, ts: SystemTime) -> Self {
		Self {
			ewma: rtt,
			min: rtt,
			max: rtt,
			sample_count: 1,
			last_updated: ts,
		}
	}

	fn update(&mut self, rtt: Duration, ts: SystemTime, alpha: f64) {
		let old = self.ewma.as_secs_f64();
		let sample = rtt.as_secs_f64();
		let new = alpha * sample + (1.0 - alpha) * old;
		self.ewma = Duration::from_secs_f64(new.max(0.0));
		if rtt < self.min {
			self.min = rtt;
		}
		if rtt > self.max {
			self.max = rtt;
		}
		self.sample_count += 1;
		self.last_updated = ts;
	}
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
	pub prefix: String,
	pub ewma_ns: u64,
	pub min: Duration,
	pub max: Duration,
	pub sample_count: u64,
}

pub struct SubnetAggregator {
	ipv4_prefix: u8,
	ipv6_prefix: u8,
	alpha: f64,
	subnet_ttl: Duration,
	min_samples: u32,
	max_subnets: usize,
	entries: RwLock<HashMap<Prefix, SubnetStats>>,
}

impl SubnetAggregator {
	pub fn new(
		ipv4_prefix: u8,
		ipv6_prefix: u8,
		alpha: f64,
		subnet_ttl: Duration,
		min_samples: u32,
		max_subnets: usize,
	) -> Self {
		Self {
			ipv4_prefix,
			ipv6_prefix,
			alpha,
			subnet_ttl,
			min_samples,
			max_subnets,
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub fn record(&self, obs: &Observation) {
		let prefix = prefix_of(obs.remote_addr, self.ipv4_prefix, self.ipv6_prefix);
		let mut entries = self.entries.write().unwrap();

		if !entries.contains_key(&prefix) && entries.len() >= self.max_subnets {
			if let Some(oldest) = entries
				.iter()
				.min_by_key(|(_, v)| v.last_updated)
				.map(|(k, _)| *k)
			{
				entries.remove(&oldest);
			}
		}

		entries
			.entry(prefix)
			.and_modify(|s| s.update(obs.rtt, obs.ts, self.alpha))
			.or_insert_with(|| SubnetStats::seed(obs.rtt, obs.ts));
	}

	pub fn get_reportable(&self) -> Vec<(Prefix, SubnetStats)> {
		let entries = self.entries.read().unwrap();
		entries
			.iter()
			.filter(|(_, s)| s.sample_count as u32 >= self.min_samples)
			.map(|(k, v)| (*k, v.clone()))
			.collect()
	}

	pub fn prune(&self) {
		let now = SystemTime::now();
		let ttl = self.subnet_ttl;
		let mut entries = self.entries.write().unwrap();
		entries.retain(|_, s| match now.duration_since(s.last_updated) {
			Ok(age) => age < ttl,
			Err(_) => true,
		});
	}

	pub fn clear(&self) {
		self.entries.write().unwrap().clear();
	}

	/// Seed or overwrite one entry from an already-aggregated
	/// `LatencyReportPayload` subnet entry (§4.13: the overwatch's
	/// cluster-wide latency view is fed by agents' pre-computed EWMAs, not
	/// raw RTT observations, so this replaces rather than blends).
	pub fn ingest_report_entry(&self, prefix_str: &str, ewma_ns: u64, ts: SystemTime) -> bool {
		let prefix = match parse_prefix(prefix_str) {
			Some(p) => p,
			None => return false,
		};
		let ewma = Duration::from_nanos(ewma_ns);

		let mut entries = self.entries.write().unwrap();
		if !entries.contains_key(&prefix) && entries.len() >= self.max_subnets {
			if let Some(oldest) = entries
				.iter()
				.min_by_key(|(_, v)| v.last_updated)
				.map(|(k, _)| *k)
			{
				entries.remove(&oldest);
			}
		}
		entries
			.entry(prefix)
			.and_modify(|s| {
				s.ewma = ewma;
				s.sample_count += 1;
				s.last_updated = ts;
				if ewma < s.min {
					s.min = ewma;
				}
				if ewma > s.max {
					s.max = ewma;
				}
			})
			.or_insert_with(|| SubnetStats::seed(ewma, ts));
		true
	}

	/// Sorted-by-prefix list of reportable subnets with EWMA in nanoseconds.
	/// Deterministic ordering is part of the contract per §4.6.
	pub fn to_report(&self) -> Vec<ReportEntry> {
		let mut reportable = self.get_reportable();
		reportable.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
		reportable
			.into_iter()
			.map(|(prefix, stats)| ReportEntry {
				prefix: prefix.to_string(),
				ewma_ns: stats.ewma.as_nanos() as u64,
				min: stats.min,
				max: stats.max,
				sample_count: stats.sample_count,
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.entries.read().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn obs(addr: &str, rtt_ms: u64) -> Observation {
		Observation {
			remote_addr: addr.parse().unwrap(),
			local_port: 443,
			rtt: Duration::from_millis(rtt_ms),
			ts: SystemTime::now(),
		}
	}

	#[test]
	fn first_sample_seeds_ewma_min_max() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 1, 100);
		agg.record(&obs("10.1.2.3", 50));
		let entries = agg.get_reportable();
		assert_eq!(entries.len(), 1);
		let (_, stats) = &entries[0];
		assert_eq!(stats.ewma, Duration::from_millis(50));
		assert_eq!(stats.min, Duration::from_millis(50));
		assert_eq!(stats.max, Duration::from_millis(50));
	}

	#[test]
	fn ewma_update_blends_old_and_new() {
		let agg = SubnetAggregator::new(24, 48, 0.5, Duration::from_secs(3600), 1, 100);
		agg.record(&obs("10.1.2.3", 100));
		agg.record(&obs("10.1.2.4", 200)); // same /24
		let entries = agg.get_reportable();
		let (_, stats) = &entries[0];
		assert_eq!(stats.ewma, Duration::from_millis(150));
		assert_eq!(stats.min, Duration::from_millis(100));
		assert_eq!(stats.max, Duration::from_millis(200));
		assert_eq!(stats.sample_count, 2);
	}

	#[test]
	fn min_samples_filters_get_reportable() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 3, 100);
		agg.record(&obs("10.1.2.3", 50));
		assert!(agg.get_reportable().is_empty());
		agg.record(&obs("10.1.2.3", 50));
		agg.record(&obs("10.1.2.3", 50));
		assert_eq!(agg.get_reportable().len(), 1);
	}

	#[test]
	fn capacity_evicts_oldest_entry() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 1, 2);
		agg.record(&obs("10.1.0.1", 10));
		std::thread::sleep(Duration::from_millis(5));
		agg.record(&obs("10.2.0.1", 10));
		std::thread::sleep(Duration::from_millis(5));
		agg.record(&obs("10.3.0.1", 10)); // should evict 10.1.0.0/24
		assert_eq!(agg.len(), 2);
	}

	#[test]
	fn prune_removes_stale_entries() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_millis(1), 1, 100);
		agg.record(&obs("10.1.2.3", 10));
		std::thread::sleep(Duration::from_millis(20));
		agg.prune();
		assert!(agg.is_empty());
	}

	#[test]
	fn ingest_report_entry_seeds_and_updates_from_prefix_string() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 1, 100);
		assert!(agg.ingest_report_entry("10.1.2.0/24", 50_000_000, SystemTime::now()));
		let report = agg.to_report();
		assert_eq!(report.len(), 1);
		assert_eq!(report[0].ewma_ns, 50_000_000);

		agg.ingest_report_entry("10.1.2.0/24", 80_000_000, SystemTime::now());
		let report = agg.to_report();
		assert_eq!(report[0].ewma_ns, 80_000_000);
		assert_eq!(report[0].sample_count, 2);
	}

	#[test]
	fn ingest_report_entry_rejects_unparseable_prefix() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 1, 100);
		assert!(!agg.ingest_report_entry("not-a-prefix", 1, SystemTime::now()));
	}

	#[test]
	fn to_report_is_sorted_by_prefix_string() {
		let agg = SubnetAggregator::new(24, 48, 0.3, Duration::from_secs(3600), 1, 100);
		agg.record(&obs("10.2.0.1", 10));
		agg.record(&obs("10.1.0.1", 10));
		let report = agg.to_report();
		assert_eq!(report.len(), 2);
		assert!(report[0].prefix < report[1].prefix);
	}
}
