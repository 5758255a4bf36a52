//! Agent orchestrator (C12, §4.12): wires identity, the backend registry,
//! the system monitor/predictor, and (where supported) the latency pipeline
//! into one lifecycle, relaying everything to gossip.
//!
//! Startup/shutdown sequencing: init components in dependency order, spawn
//! a driving loop fed by a stop channel, stop components in reverse order.

use crate::config::AgentConfig;
use crate::error::AppResult;
use crate::gossip::message::{HealthUpdatePayload, LatencySubnetEntry, PredictivePayload};
use crate::gossip::{GossipTransport, LatencyReportPayload, Payload, TcpGossipTransport};
use crate::health::{CheckType, HealthChecker};
use crate::identity::Identity;
use crate::observability::MetricsRegistry;
use crate::predictor::{Predictor, Reason, SignalKind};
use crate::registry::{BackendKey, BackendRegistry, HealthEvent};
use crate::rtt::{RttCollector, RttCollectorError};
use crate::subnet::SubnetAggregator;
use crate::sysmon::SystemMonitor;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn reason_tag(reason: Reason) -> &'static str {
	match reason {
		Reason::CpuHigh => "cpu_high",
		Reason::MemoryHigh => "memory_high",
		Reason::ErrorRateHigh => "error_rate_high",
		Reason::Recovered => "recovered",
	}
}

fn check_type_tag(check_type: CheckType) -> &'static str {
	match check_type {
		CheckType::Http => "http",
		CheckType::Https => "https",
		CheckType::Tcp => "tcp",
	}
}

struct Running {
	health_task: JoinHandle<()>,
	predictor_task: JoinHandle<()>,
	report_task: JoinHandle<()>,
	rtt_task: Option<JoinHandle<()>>,
	stop_tx: oneshot::Sender<()>,
}

/// Drives one agent node's lifecycle. Not `Clone`; `start`/`stop` are each
/// meant to be called once.
pub struct AgentOrchestrator {
	config: AgentConfig,
	/// Behind a lock because `rotate()` replaces credentials in place at
	/// runtime (§4.11); every broadcast must read the live identity rather
	/// than the one captured at construction time.
	identity: std::sync::RwLock<Identity>,
	registry: Arc<BackendRegistry>,
	monitor: Arc<SystemMonitor>,
	predictor: Arc<Predictor>,
	subnets: Option<Arc<SubnetAggregator>>,
	transport: Arc<dyn GossipTransport>,
	metrics: Arc<MetricsRegistry>,
	running: std::sync::Mutex<Option<Running>>,
}

impl AgentOrchestrator {
	pub fn new(
		config: AgentConfig,
		identity: Identity,
		transport: Arc<dyn GossipTransport>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		let monitor = Arc::new(SystemMonitor::new(config.predictor.error_window));
		let predictor = Arc::new(
			Predictor::new(config.predictor.clone(), monitor.clone()).with_metrics(metrics.clone()),
		);
		let registry = Arc::new(BackendRegistry::new(Arc::new(HealthChecker::new())).with_metrics(metrics.clone()));
		let subnets = config.latency.enabled.then(|| {
			Arc::new(SubnetAggregator::new(
				config.latency.ipv4_prefix,
				config.latency.ipv6_prefix,
				config.latency.alpha,
				config.latency.subnet_ttl,
				config.latency.min_samples,
				config.latency.max_subnets,
			))
		});

		Self {
			config,
			identity: std::sync::RwLock::new(identity),
			registry,
			monitor,
			predictor,
			subnets,
			transport,
			metrics,
			running: std::sync::Mutex::new(None),
		}
	}

	pub fn registry(&self) -> Arc<BackendRegistry> {
		self.registry.clone()
	}

	/// Register the agent's initial backend set (management API is a
	/// collaborator per §4.12; this seeds the table the agent owns).
	pub async fn register_backends(
		&self,
		backends: Vec<(BackendKey, crate::registry::BackendSpec)>,
	) -> AppResult<()> {
		for (key, spec) in backends {
			self.registry.add_backend(key, spec).await?;
		}
		Ok(())
	}

	/// Start all components and the periodic report/rotation loop.
	pub async fn start(self: &Arc<Self>) -> AppResult<()> {
		let node_id = self.identity.read().unwrap().node_id();
		info!(node_id = %node_id, "starting agent orchestrator");

		let (health_tx, mut health_rx) = mpsc::channel::<HealthEvent>(256);
		self.registry.set_callback(health_tx).await;

		let transport = self.transport.clone();
		let health_task = {
			let transport = transport.clone();
			let region = self.config.identity.region.clone();
			let metrics = self.metrics.clone();
			tokio::spawn(async move {
				while let Some(event) = health_rx.recv().await {
					let payload = Payload::HealthUpdate(HealthUpdatePayload {
						service: event.service.clone(),
						address: event.address.to_string(),
						region: region.clone(),
						port: event.port,
						weight: event.weight,
						healthy: event.healthy,
						previous_healthy: event.previous_healthy,
						latency_ms: event.latency.as_millis() as u64,
						error: event.error.clone(),
						check_type: check_type_tag(event.check_type).to_string(),
					});
					if let Err(e) = transport.broadcast(payload).await {
						metrics.errors_total.with_label_values(&[e.kind()]).inc();
						warn!(error = %e, "failed to broadcast health update");
					}
				}
			})
		};

		let (predictive_tx, mut predictive_rx) = mpsc::channel(16);
		let predictor_task = self.predictor.clone().spawn(predictive_tx);
		let predictor_relay = {
			let transport = transport.clone();
			let this = self.clone();
			tokio::spawn(async move {
				while let Some(signal) = predictive_rx.recv().await {
					let payload = Payload::Predictive(PredictivePayload {
						node_id: this.identity.read().unwrap().node_id(),
						kind: match signal.kind {
							SignalKind::Bleed => "bleed".to_string(),
							SignalKind::Clear => "clear".to_string(),
						},
						reason: reason_tag(signal.reason).to_string(),
						value: signal.value,
						threshold: signal.threshold,
					});
					if let Err(e) = transport.broadcast(payload).await {
						this.metrics.errors_total.with_label_values(&[e.kind()]).inc();
						warn!(error = %e, "failed to broadcast predictive signal");
					}
				}
			})
		};

		let rtt_task = self.spawn_latency_pipeline();

		let (stop_tx, mut stop_rx) = oneshot::channel();
		let report_task = {
			let this = self.clone();
			tokio::spawn(async move {
				let mut ticker = tokio::time::interval(this.config.health_report_interval);
				loop {
					tokio::select! {
						_ = ticker.tick() => this.send_full_snapshot().await,
						_ = &mut stop_rx => break,
					}
				}
			})
		};

		*self.running.lock().unwrap() = Some(Running {
			health_task,
			predictor_task: tokio::spawn(async move {
				let _ = predictor_task.await;
				let _ = predictor_relay.await;
			}),
			report_task,
			rtt_task,
			stop_tx,
		});

		Ok(())
	}

	fn spawn_latency_pipeline(self: &Arc<Self>) -> Option<JoinHandle<()>> {
		let subnets = self.subnets.clone()?;
		let collector = match RttCollector::new(crate::rtt::collector::RttCollectorConfig {
			poll_interval: self.config.latency.poll_interval,
			ports: self.config.latency.ports.clone(),
		}) {
			Ok(c) => Arc::new(c),
			Err(RttCollectorError::PlatformNotSupported(reason)) => {
				info!(reason, "latency pipeline disabled: platform not supported");
				return None;
			}
			Err(e) => {
				warn!(error = %e, "failed to start rtt collector");
				return None;
			}
		};

		let (mut rx, poll_handle) = collector.start()?;
		let this = self.clone();
		Some(tokio::spawn(async move {
			let mut report_ticker = tokio::time::interval(this.config.latency.report_interval);
			let mut last_dropped = 0u64;
			loop {
				tokio::select! {
					Some(obs) = rx.recv() => subnets.record(&obs),
					_ = report_ticker.tick() => {
						this.broadcast_latency_report().await;
						let dropped = collector.metrics.dropped.load(AtomicOrdering::SeqCst);
						if dropped > last_dropped {
							this.metrics.rtt_observations_dropped_total.inc_by(dropped - last_dropped);
							last_dropped = dropped;
						}
					}
					else => break,
				}
			}
			poll_handle.abort();
		}))
	}

	async fn broadcast_latency_report(&self) {
		let Some(subnets) = &self.subnets else { return };
		let entries = subnets.to_report();
		subnets.prune();
		if entries.is_empty() {
			return;
		}
		let report = LatencyReportPayload {
			agent_id: self.identity.read().unwrap().node_id(),
			backend: self.config.identity.region.clone(),
			region: self.config.identity.region.clone(),
			subnets: entries
				.into_iter()
				.map(|e| LatencySubnetEntry {
					prefix: e.prefix,
					ewma_ns: e.ewma_ns,
				})
				.collect(),
		};
		if let Err(e) = self.transport.broadcast_latency_report(report).await {
			self.metrics.errors_total.with_label_values(&[e.kind()]).inc();
			warn!(error = %e, "failed to broadcast latency report");
		}
	}

	async fn send_full_snapshot(&self) {
		let region = self.config.identity.region.clone();
		for (key, spec, state) in self.registry.snapshot().await {
			let payload = Payload::HealthUpdate(HealthUpdatePayload {
				service: key.service,
				address: key.address.to_string(),
				region: region.clone(),
				port: key.port,
				weight: spec.weight,
				healthy: state.healthy(),
				previous_healthy: state.healthy(),
				latency_ms: state.last_latency.as_millis() as u64,
				error: state.last_error.clone(),
				check_type: check_type_tag(spec.check_type).to_string(),
			});
			if let Err(e) = self.transport.broadcast(payload).await {
				self.metrics.errors_total.with_label_values(&[e.kind()]).inc();
				warn!(error = %e, "failed to broadcast periodic health snapshot");
			}
		}

		// §4.12: the periodic snapshot also carries the predictive sub-record,
		// so a joining/recovering overwatch learns this agent's bleed/clear
		// state without waiting for the next edge-triggered broadcast.
		if let Some(signal) = self.predictor.current_signal() {
			let payload = Payload::Predictive(PredictivePayload {
				node_id: self.identity.read().unwrap().node_id(),
				kind: match signal.kind {
					SignalKind::Bleed => "bleed".to_string(),
					SignalKind::Clear => "clear".to_string(),
				},
				reason: reason_tag(signal.reason).to_string(),
				value: signal.value,
				threshold: signal.threshold,
			});
			if let Err(e) = self.transport.broadcast(payload).await {
				self.metrics.errors_total.with_label_values(&[e.kind()]).inc();
				warn!(error = %e, "failed to broadcast periodic predictive snapshot");
			}
		}

		let needs_rotation = self
			.identity
			.read()
			.unwrap()
			.needs_rotation(self.config.identity.rotation_threshold);
		if needs_rotation {
			let rotated = self.identity.read().unwrap().rotate();
			match rotated {
				Ok(new_identity) => {
					*self.identity.write().unwrap() = new_identity;
					self.metrics.identity_rotations_total.with_label_values(&["ok"]).inc();
					info!("rotated agent identity credentials");
				}
				Err(e) => {
					self.metrics.identity_rotations_total.with_label_values(&["error"]).inc();
					warn!(error = %e, "identity rotation failed");
				}
			}
		}
	}

	/// Deregister (empty-backend-list health update), then stop components
	/// in reverse-dependency order.
	pub async fn stop(&self) {
		let payload = Payload::HealthUpdate(HealthUpdatePayload {
			service: String::new(),
			address: "0.0.0.0".to_string(),
			region: self.config.identity.region.clone(),
			port: 0,
			weight: 0,
			healthy: false,
			previous_healthy: true,
			latency_ms: 0,
			error: None,
			check_type: "tcp".to_string(),
		});
		if let Err(e) = self.transport.broadcast(payload).await {
			self.metrics.errors_total.with_label_values(&[e.kind()]).inc();
			warn!(error = %e, "failed to broadcast deregistration");
		}

		let running = self.running.lock().unwrap().take();
		if let Some(running) = running {
			let _ = running.stop_tx.send(());
			if let Some(rtt_task) = running.rtt_task {
				rtt_task.abort();
			}
			running.predictor_task.abort();
			running.health_task.abort();
			let _ = running.report_task.await;
		}
		self.registry.stop().await;
	}
}
