//! Prometheus metrics for both node roles (§7: "metrics counters incremented
//! for every error kind" plus the component-level counters named throughout
//! §4). A single `MetricsRegistry` with a `namespace("opengslb")` per metric
//! and an `encode()` text exporter.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central registry for all Prometheus metrics.
pub struct MetricsRegistry {
	registry: Registry,

	/// Backend health transitions, labeled `healthy`/`unhealthy` (C2, §4.2).
	pub health_transitions_total: IntCounterVec,
	/// Predictive bleed/clear signals raised, labeled by reason (C4, §4.4).
	pub predictive_signals_total: IntCounterVec,
	/// RTT observations dropped because the delivery channel was full (C5, §4.5).
	pub rtt_observations_dropped_total: IntCounter,

	/// Gossip broadcasts, labeled `ok`/`error` (C7, §4.7).
	pub gossip_broadcasts_total: IntCounterVec,
	/// Gossip envelopes received, labeled by payload variant (C7, §4.7).
	pub gossip_envelopes_received_total: IntCounterVec,

	/// Consensus commit latency, leader-side only (C8, §4.8).
	pub consensus_commit_latency_seconds: Histogram,
	/// Leadership transitions, labeled `became_leader`/`stepped_down` (C8, §4.8).
	pub consensus_leadership_transitions_total: IntCounterVec,
	/// Raft log entries applied to the FSM (C9, §4.9).
	pub fsm_applies_total: IntCounter,

	/// Veto applications, labeled by veto mode (C10, §4.10).
	pub veto_applications_total: IntCounterVec,
	/// External validation probes run by the arbiter, labeled `healthy`/`unhealthy` (C10).
	pub arbiter_probes_total: IntCounterVec,

	/// Identity credential rotations, labeled `ok`/`error` (C11, §4.11).
	pub identity_rotations_total: IntCounterVec,

	/// Errors surfaced from `AppError`, labeled by variant name (§7).
	pub errors_total: IntCounterVec,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let health_transitions_total = IntCounterVec::new(
			Opts::new(
				"health_transitions_total",
				"Backend health state transitions",
			)
			.namespace("opengslb"),
			&["status"],
		)
		.unwrap();

		let predictive_signals_total = IntCounterVec::new(
			Opts::new(
				"predictive_signals_total",
				"Predictive bleed/clear signals raised",
			)
			.namespace("opengslb"),
			&["kind", "reason"],
		)
		.unwrap();

		let rtt_observations_dropped_total = IntCounter::with_opts(
			Opts::new(
				"rtt_observations_dropped_total",
				"RTT observations dropped because the collector channel was full",
			)
			.namespace("opengslb"),
		)
		.unwrap();

		let gossip_broadcasts_total = IntCounterVec::new(
			Opts::new("gossip_broadcasts_total", "Gossip broadcast attempts").namespace("opengslb"),
			&["result"],
		)
		.unwrap();

		let gossip_envelopes_received_total = IntCounterVec::new(
			Opts::new(
				"gossip_envelopes_received_total",
				"Gossip envelopes received by payload variant",
			)
			.namespace("opengslb"),
			&["variant"],
		)
		.unwrap();

		let consensus_commit_latency_seconds = Histogram::with_opts(
			HistogramOpts::new(
				"consensus_commit_latency_seconds",
				"Time from apply() call to local commit, leader-side",
			)
			.namespace("opengslb")
			.buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
		)
		.unwrap();

		let consensus_leadership_transitions_total = IntCounterVec::new(
			Opts::new(
				"consensus_leadership_transitions_total",
				"Raft leadership transitions observed by this node",
			)
			.namespace("opengslb"),
			&["transition"],
		)
		.unwrap();

		let fsm_applies_total = IntCounter::with_opts(
			Opts::new("fsm_applies_total", "Replicated log entries applied to the FSM")
				.namespace("opengslb"),
		)
		.unwrap();

		let veto_applications_total = IntCounterVec::new(
			Opts::new("veto_applications_total", "Vetoes applied by the overwatch arbiter")
				.namespace("opengslb"),
			&["veto_mode"],
		)
		.unwrap();

		let arbiter_probes_total = IntCounterVec::new(
			Opts::new("arbiter_probes_total", "External validation probes run by the arbiter")
				.namespace("opengslb"),
			&["result"],
		)
		.unwrap();

		let identity_rotations_total = IntCounterVec::new(
			Opts::new("identity_rotations_total", "Identity credential rotation attempts")
				.namespace("opengslb"),
			&["result"],
		)
		.unwrap();

		let errors_total = IntCounterVec::new(
			Opts::new("errors_total", "AppError occurrences by variant").namespace("opengslb"),
			&["kind"],
		)
		.unwrap();

		registry
			.register(Box::new(health_transitions_total.clone()))
			.unwrap();
		registry
			.register(Box::new(predictive_signals_total.clone()))
			.unwrap();
		registry
			.register(Box::new(rtt_observations_dropped_total.clone()))
			.unwrap();
		registry
			.register(Box::new(gossip_broadcasts_total.clone()))
			.unwrap();
		registry
			.register(Box::new(gossip_envelopes_received_total.clone()))
			.unwrap();
		registry
			.register(Box::new(consensus_commit_latency_seconds.clone()))
			.unwrap();
		registry
			.register(Box::new(consensus_leadership_transitions_total.clone()))
			.unwrap();
		registry.register(Box::new(fsm_applies_total.clone())).unwrap();
		registry
			.register(Box::new(veto_applications_total.clone()))
			.unwrap();
		registry.register(Box::new(arbiter_probes_total.clone())).unwrap();
		registry
			.register(Box::new(identity_rotations_total.clone()))
			.unwrap();
		registry.register(Box::new(errors_total.clone())).unwrap();

		Self {
			registry,
			health_transitions_total,
			predictive_signals_total,
			rtt_observations_dropped_total,
			gossip_broadcasts_total,
			gossip_envelopes_received_total,
			consensus_commit_latency_seconds,
			consensus_leadership_transitions_total,
			fsm_applies_total,
			veto_applications_total,
			arbiter_probes_total,
			identity_rotations_total,
			errors_total,
		}
	}

	/// Encode metrics in Prometheus text format.
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				eprintln!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Initialize the global metrics registry.
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()))
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn metrics_registry_creation() {
		let registry = MetricsRegistry::new();
		assert!(!registry.encode().is_empty());
	}

	#[test]
	fn labeled_counters_increment_independently() {
		let registry = MetricsRegistry::new();
		registry.health_transitions_total.with_label_values(&["healthy"]).inc();
		registry
			.health_transitions_total
			.with_label_values(&["unhealthy"])
			.inc_by(2);
		assert_eq!(registry.health_transitions_total.with_label_values(&["healthy"]).get(), 1);
		assert_eq!(
			registry.health_transitions_total.with_label_values(&["unhealthy"]).get(),
			2
		);
	}
}
