//! Backend registry (C2): per-agent backend table with an independent
//! check loop per backend and hysteresis-gated health transitions.
//!
//! An explicit state-enum hysteresis machine, with an independent spawned
//! task per backend entry driving its own check loop.

use crate::config::HealthCheckDefaults;
use crate::error::{AppError, AppResult};
use crate::health::{CheckTarget, CheckType, HealthChecker};
use crate::observability::MetricsRegistry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendKey {
	pub service: String,
	pub address: IpAddr,
	pub port: u16,
}

#[derive(Debug, Clone)]
pub struct BackendSpec {
	pub weight: u32,
	pub check_type: CheckType,
	pub path: String,
	pub host_header: Option<String>,
	pub interval: Duration,
	pub timeout: Duration,
	pub fail_threshold: u32,
	pub pass_threshold: u32,
}

impl BackendSpec {
	pub fn with_defaults(defaults: &HealthCheckDefaults, check_type: CheckType) -> Self {
		Self {
			weight: defaults.weight,
			check_type,
			path: String::new(),
			host_header: None,
			interval: defaults.interval,
			timeout: defaults.timeout,
			fail_threshold: defaults.fail_threshold,
			pass_threshold: defaults.pass_threshold,
		}
	}
}

/// `healthy` flips only after the configured number of consecutive
/// same-direction results (§3 data model). Starts `Unknown`, which is
/// treated as unhealthy for serving purposes but is a distinct state so
/// the first run of consecutive failures still produces a transition
/// (unknown -> unhealthy) rather than being swallowed as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
	Unknown,
	Healthy,
	Unhealthy,
}

impl Status {
	fn is_healthy(self) -> bool {
		matches!(self, Status::Healthy)
	}
}

#[derive(Debug, Clone)]
pub struct HealthState {
	status: Status,
	pub last_check: Option<SystemTime>,
	pub last_healthy: Option<SystemTime>,
	pub consec_fails: u32,
	pub consec_passes: u32,
	pub last_error: Option<String>,
	pub last_latency: Duration,
}

impl Default for HealthState {
	fn default() -> Self {
		Self {
			status: Status::Unknown,
			last_check: None,
			last_healthy: None,
			consec_fails: 0,
			consec_passes: 0,
			last_error: None,
			last_latency: Duration::ZERO,
		}
	}
}

impl HealthState {
	/// Unknown counts as unhealthy for every external consumer (§3).
	pub fn healthy(&self) -> bool {
		self.status.is_healthy()
	}

	/// Apply one probe result. Returns true if the effective healthy/
	/// unhealthy status flipped (including the initial unknown ->
	/// unhealthy or unknown -> healthy transition).
	fn apply(&mut self, ok: bool, latency: Duration, error: Option<String>, ts: SystemTime, spec: &BackendSpec) -> bool {
		self.last_check = Some(ts);
		self.last_latency = latency;
		let was_healthy = self.status.is_healthy();

		if ok {
			self.consec_passes += 1;
			self.consec_fails = 0;
			self.last_error = None;
			self.last_healthy = Some(ts);
			if !matches!(self.status, Status::Healthy) && self.consec_passes >= spec.pass_threshold {
				self.status = Status::Healthy;
			}
		} else {
			self.consec_fails += 1;
			self.consec_passes = 0;
			self.last_error = error;
			if !matches!(self.status, Status::Unhealthy) && self.consec_fails >= spec.fail_threshold {
				self.status = Status::Unhealthy;
			}
		}

		was_healthy != self.status.is_healthy()
	}
}

/// Emitted only on status transitions (§4.2).
#[derive(Debug, Clone)]
pub struct HealthEvent {
	pub service: String,
	pub address: IpAddr,
	pub port: u16,
	pub weight: u32,
	pub check_type: CheckType,
	pub healthy: bool,
	pub previous_healthy: bool,
	pub latency: Duration,
	pub error: Option<String>,
	pub ts: SystemTime,
}

struct BackendEntry {
	spec: BackendSpec,
	state: Arc<Mutex<HealthState>>,
	task: JoinHandle<()>,
}

/// Per-agent backend table. `add_backend` spawns an independent check loop
/// that probes immediately, then every `spec.interval`.
pub struct BackendRegistry {
	checker: Arc<HealthChecker>,
	entries: Arc<RwLock<HashMap<BackendKey, BackendEntry>>>,
	callback: Arc<Mutex<Option<mpsc::Sender<HealthEvent>>>>,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl BackendRegistry {
	pub fn new(checker: Arc<HealthChecker>) -> Self {
		Self {
			checker,
			entries: Arc::new(RwLock::new(HashMap::new())),
			callback: Arc::new(Mutex::new(None)),
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	/// Register the single callback channel health events are relayed to.
	pub async fn set_callback(&self, sender: mpsc::Sender<HealthEvent>) {
		*self.callback.lock().await = Some(sender);
	}

	pub async fn add_backend(&self, key: BackendKey, spec: BackendSpec) -> AppResult<()> {
		let mut entries = self.entries.write().await;
		if entries.contains_key(&key) {
			return Err(AppError::ConfigInvalid(format!(
				"backend {}:{}:{} already registered",
				key.service, key.address, key.port
			)));
		}

		let state = Arc::new(Mutex::new(HealthState::default()));
		let task = self.spawn_check_loop(key.clone(), spec.clone(), state.clone());

		entries.insert(
			key,
			BackendEntry {
				spec,
				state,
				task,
			},
		);
		Ok(())
	}

	pub async fn remove_backend(&self, key: &BackendKey) -> AppResult<()> {
		let mut entries = self.entries.write().await;
		match entries.remove(key) {
			Some(entry) => {
				entry.task.abort();
				Ok(())
			}
			None => Err(AppError::ConfigInvalid(format!(
				"backend {}:{}:{} not registered",
				key.service, key.address, key.port
			))),
		}
	}

	pub async fn snapshot(&self) -> Vec<(BackendKey, BackendSpec, HealthState)> {
		let entries = self.entries.read().await;
		let mut out = Vec::with_capacity(entries.len());
		for (key, entry) in entries.iter() {
			out.push((key.clone(), entry.spec.clone(), entry.state.lock().await.clone()));
		}
		out
	}

	/// Cancel all check loops and wait for completion. Safe to call twice.
	pub async fn stop(&self) {
		let mut entries = self.entries.write().await;
		for (_, entry) in entries.drain() {
			entry.task.abort();
		}
	}

	fn spawn_check_loop(
		&self,
		key: BackendKey,
		spec: BackendSpec,
		state: Arc<Mutex<HealthState>>,
	) -> JoinHandle<()> {
		let checker = self.checker.clone();
		let callback = self.callback.clone();
		let metrics = self.metrics.clone();

		tokio::spawn(async move {
			let mut interval = tokio::time::interval(spec.interval);
			// first tick fires immediately: immediate probe on registration
			loop {
				interval.tick().await;

				let target = CheckTarget {
					address: key.address,
					port: key.port,
					check_type: spec.check_type,
					path: spec.path.clone(),
					host_header: spec.host_header.clone(),
					timeout: spec.timeout,
					healthy_statuses: 200..300,
				};

				let result = checker.check(&target).await;

				let (flipped, event) = {
					let mut s = state.lock().await;
					let previous_healthy = s.healthy();
					let flipped = s.apply(
						result.healthy,
						result.latency,
						result.error.clone(),
						result.ts,
						&spec,
					);
					let event = HealthEvent {
						service: key.service.clone(),
						address: key.address,
						port: key.port,
						weight: spec.weight,
						check_type: spec.check_type,
						healthy: s.healthy(),
						previous_healthy,
						latency: result.latency,
						error: result.error.clone(),
						ts: result.ts,
					};
					(flipped, event)
				};

				if flipped {
					debug!(service = %key.service, address = %key.address, port = key.port, healthy = event.healthy, "backend health transition");
					if let Some(m) = &metrics {
						let status = if event.healthy { "healthy" } else { "unhealthy" };
						m.health_transitions_total.with_label_values(&[status]).inc();
					}
					let cb = callback.lock().await.clone();
					if let Some(sender) = cb {
						let _ = sender.try_send(event);
					}
				}
			}
		})
	}
}

impl Drop for BackendRegistry {
	fn drop(&mut self) {
		info!("backend registry dropped");
	}
}
