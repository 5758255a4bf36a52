//! Runtime configuration for both node roles.
//!
//! Values load from (in order): an optional `config` file and environment
//! variables prefixed `OGSLB_` (double-underscore separated, e.g.
//! `OGSLB_GOSSIP__BIND_ADDR`), via the `config` crate's file + env overlay.
//! YAML parsing specifics are a collaborator, not specified here.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn secs(s: u64) -> Duration {
	Duration::from_secs(s)
}

fn millis(ms: u64) -> Duration {
	Duration::from_millis(ms)
}

/// Health-check defaults applied to a backend when fields are omitted (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckDefaults {
	#[serde(default = "default_interval", with = "humantime_serde")]
	pub interval: Duration,
	#[serde(default = "default_timeout", with = "humantime_serde")]
	pub timeout: Duration,
	#[serde(default = "default_fail_threshold")]
	pub fail_threshold: u32,
	#[serde(default = "default_pass_threshold")]
	pub pass_threshold: u32,
	#[serde(default = "default_weight")]
	pub weight: u32,
}

fn default_interval() -> Duration {
	secs(30)
}
fn default_timeout() -> Duration {
	secs(5)
}
fn default_fail_threshold() -> u32 {
	3
}
fn default_pass_threshold() -> u32 {
	2
}
fn default_weight() -> u32 {
	100
}

impl Default for HealthCheckDefaults {
	fn default() -> Self {
		Self {
			interval: default_interval(),
			timeout: default_timeout(),
			fail_threshold: default_fail_threshold(),
			pass_threshold: default_pass_threshold(),
			weight: default_weight(),
		}
	}
}

/// Predictor thresholds and cadence (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictorConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_predict_interval", with = "humantime_serde")]
	pub interval: Duration,
	#[serde(default = "default_cpu_threshold")]
	pub cpu_threshold_pct: f64,
	#[serde(default = "default_mem_threshold")]
	pub memory_threshold_pct: f64,
	#[serde(default = "default_error_rate_threshold")]
	pub error_rate_threshold_per_min: f64,
	#[serde(default = "default_error_window", with = "humantime_serde")]
	pub error_window: Duration,
}

fn default_predict_interval() -> Duration {
	secs(5)
}
fn default_cpu_threshold() -> f64 {
	85.0
}
fn default_mem_threshold() -> f64 {
	90.0
}
fn default_error_rate_threshold() -> f64 {
	10.0
}
fn default_error_window() -> Duration {
	secs(60)
}

impl Default for PredictorConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			interval: default_predict_interval(),
			cpu_threshold_pct: default_cpu_threshold(),
			memory_threshold_pct: default_mem_threshold(),
			error_rate_threshold_per_min: default_error_rate_threshold(),
			error_window: default_error_window(),
		}
	}
}

/// Passive latency-learning pipeline knobs (§4.5/§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencyConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_poll_interval", with = "humantime_serde")]
	pub poll_interval: Duration,
	#[serde(default = "default_ipv4_prefix")]
	pub ipv4_prefix: u8,
	#[serde(default = "default_ipv6_prefix")]
	pub ipv6_prefix: u8,
	#[serde(default = "default_alpha")]
	pub alpha: f64,
	#[serde(default = "default_subnet_ttl", with = "humantime_serde")]
	pub subnet_ttl: Duration,
	#[serde(default = "default_min_samples")]
	pub min_samples: u32,
	#[serde(default = "default_max_subnets")]
	pub max_subnets: usize,
	#[serde(default = "default_report_interval", with = "humantime_serde")]
	pub report_interval: Duration,
	/// Restrict observation to these local ports; empty means "all known backend ports".
	#[serde(default)]
	pub ports: Vec<u16>,
}

fn default_poll_interval() -> Duration {
	secs(10)
}
fn default_ipv4_prefix() -> u8 {
	24
}
fn default_ipv6_prefix() -> u8 {
	48
}
fn default_alpha() -> f64 {
	0.3
}
fn default_subnet_ttl() -> Duration {
	Duration::from_secs(168 * 3600)
}
fn default_min_samples() -> u32 {
	5
}
fn default_max_subnets() -> usize {
	100_000
}
fn default_report_interval() -> Duration {
	secs(60)
}

impl Default for LatencyConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			poll_interval: default_poll_interval(),
			ipv4_prefix: default_ipv4_prefix(),
			ipv6_prefix: default_ipv6_prefix(),
			alpha: default_alpha(),
			subnet_ttl: default_subnet_ttl(),
			min_samples: default_min_samples(),
			max_subnets: default_max_subnets(),
			report_interval: default_report_interval(),
			ports: Vec::new(),
		}
	}
}

/// Gossip transport configuration (§4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GossipConfig {
	pub bind_addr: String,
	#[serde(default)]
	pub advertise_addr: Option<String>,
	#[serde(default)]
	pub seeds: Vec<String>,
	/// Base64-encoded 32-byte pre-shared key.
	pub encryption_key: String,
	#[serde(default = "default_gossip_leave_timeout", with = "humantime_serde")]
	pub leave_timeout: Duration,
}

fn default_gossip_leave_timeout() -> Duration {
	secs(5)
}

/// Consensus timeouts (§4.8). Invariant: `leader_lease <= heartbeat <= election`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusConfig {
	pub node_id: String,
	pub raft_bind_addr: String,
	pub api_bind_addr: String,
	#[serde(default)]
	pub bootstrap: bool,
	#[serde(default)]
	pub join: Vec<String>,
	#[serde(default = "default_heartbeat", with = "humantime_serde")]
	pub heartbeat: Duration,
	#[serde(default = "default_election", with = "humantime_serde")]
	pub election_timeout: Duration,
	#[serde(default = "default_leader_lease", with = "humantime_serde")]
	pub leader_lease: Duration,
	#[serde(default = "default_snapshot_interval", with = "humantime_serde")]
	pub snapshot_interval: Duration,
	#[serde(default = "default_snapshot_threshold")]
	pub snapshot_log_threshold: u64,
	#[serde(default = "default_join_attempts")]
	pub join_max_attempts: u32,
	#[serde(default = "default_join_backoff_cap", with = "humantime_serde")]
	pub join_backoff_cap: Duration,
	pub data_dir: std::path::PathBuf,
}

fn default_heartbeat() -> Duration {
	millis(250)
}
fn default_election() -> Duration {
	millis(1000)
}
fn default_leader_lease() -> Duration {
	millis(200)
}
fn default_snapshot_interval() -> Duration {
	secs(120)
}
fn default_snapshot_threshold() -> u64 {
	10_000
}
fn default_join_attempts() -> u32 {
	5
}
fn default_join_backoff_cap() -> Duration {
	secs(30)
}

impl ConsensusConfig {
	pub fn validate(&self) -> Result<()> {
		if self.bootstrap && !self.join.is_empty() {
			anyhow::bail!("exactly one of bootstrap or join may be set, not both");
		}
		if !self.bootstrap && self.join.is_empty() {
			anyhow::bail!("one of bootstrap or join must be set");
		}
		if !(self.leader_lease <= self.heartbeat && self.heartbeat <= self.election_timeout) {
			anyhow::bail!("invariant violated: leader_lease <= heartbeat <= election_timeout");
		}
		Ok(())
	}
}

/// Overwatch veto / external-validation mode (§4.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VetoMode {
	Strict,
	Balanced,
	Permissive,
}

impl Default for VetoMode {
	fn default() -> Self {
		VetoMode::Balanced
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArbiterConfig {
	#[serde(default = "default_external_check_interval", with = "humantime_serde")]
	pub external_check_interval: Duration,
	#[serde(default = "default_external_timeout", with = "humantime_serde")]
	pub external_timeout: Duration,
	#[serde(default)]
	pub veto_mode: VetoMode,
	#[serde(default = "default_veto_threshold")]
	pub veto_threshold: u32,
}

fn default_external_check_interval() -> Duration {
	secs(10)
}
fn default_external_timeout() -> Duration {
	secs(5)
}
fn default_veto_threshold() -> u32 {
	3
}

impl Default for ArbiterConfig {
	fn default() -> Self {
		Self {
			external_check_interval: default_external_check_interval(),
			external_timeout: default_external_timeout(),
			veto_mode: VetoMode::default(),
			veto_threshold: default_veto_threshold(),
		}
	}
}

/// Identity / credential settings (§4.11).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
	pub region: String,
	pub service_token: String,
	#[serde(default = "default_cert_path")]
	pub cert_path: std::path::PathBuf,
	#[serde(default = "default_key_path")]
	pub key_path: std::path::PathBuf,
	#[serde(default = "default_rotation_threshold", with = "humantime_serde")]
	pub rotation_threshold: Duration,
}

fn default_cert_path() -> std::path::PathBuf {
	"opengslb-agent.crt".into()
}
fn default_key_path() -> std::path::PathBuf {
	"opengslb-agent.key".into()
}
fn default_rotation_threshold() -> Duration {
	Duration::from_secs(30 * 24 * 3600)
}

/// Top-level settings for an Agent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
	pub identity: IdentityConfig,
	pub gossip: GossipConfig,
	#[serde(default)]
	pub health_defaults: HealthCheckDefaults,
	#[serde(default)]
	pub predictor: PredictorConfig,
	#[serde(default)]
	pub latency: LatencyConfig,
	#[serde(default = "default_report_interval", with = "humantime_serde")]
	pub health_report_interval: Duration,
	#[serde(default = "default_healthz_addr")]
	pub healthz_addr: String,
}

/// Top-level settings for an Overwatch node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverwatchConfig {
	pub identity: IdentityConfig,
	pub gossip: GossipConfig,
	pub consensus: ConsensusConfig,
	#[serde(default)]
	pub arbiter: ArbiterConfig,
	#[serde(default = "default_healthz_addr")]
	pub healthz_addr: String,
}

fn default_healthz_addr() -> String {
	"127.0.0.1:9090".to_string()
}

/// Load settings from an optional config file plus `OGSLB_`-prefixed
/// environment variables.
pub fn load<T: serde::de::DeserializeOwned>(config_name: &str) -> Result<T> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name(config_name).required(false))
		.add_source(config::Environment::with_prefix("OGSLB").separator("__"));

	let cfg = builder.build()?;
	let settings: T = cfg.try_deserialize()?;
	Ok(settings)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn consensus_config_rejects_both_bootstrap_and_join() {
		let cfg = ConsensusConfig {
			node_id: "n1".into(),
			raft_bind_addr: "127.0.0.1:7000".into(),
			api_bind_addr: "127.0.0.1:7001".into(),
			bootstrap: true,
			join: vec!["127.0.0.1:7001".into()],
			heartbeat: default_heartbeat(),
			election_timeout: default_election(),
			leader_lease: default_leader_lease(),
			snapshot_interval: default_snapshot_interval(),
			snapshot_log_threshold: default_snapshot_threshold(),
			join_max_attempts: default_join_attempts(),
			join_backoff_cap: default_join_backoff_cap(),
			data_dir: std::env::temp_dir(),
		};
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn consensus_config_rejects_timeout_invariant_violation() {
		let mut cfg = ConsensusConfig {
			node_id: "n1".into(),
			raft_bind_addr: "127.0.0.1:7000".into(),
			api_bind_addr: "127.0.0.1:7001".into(),
			bootstrap: true,
			join: vec![],
			heartbeat: secs(2),
			election_timeout: secs(1),
			leader_lease: millis(200),
			snapshot_interval: default_snapshot_interval(),
			snapshot_log_threshold: default_snapshot_threshold(),
			join_max_attempts: default_join_attempts(),
			join_backoff_cap: default_join_backoff_cap(),
			data_dir: std::env::temp_dir(),
		};
		assert!(cfg.validate().is_err());
		cfg.election_timeout = secs(3);
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn health_defaults_match_spec() {
		let d = HealthCheckDefaults::default();
		assert_eq!(d.interval, secs(30));
		assert_eq!(d.timeout, secs(5));
		assert_eq!(d.fail_threshold, 3);
		assert_eq!(d.pass_threshold, 2);
		assert_eq!(d.weight, 100);
	}
}
