//! Predictor (C4): threshold evaluation to bleed/clear edge signals (§4.4).
//!
//! The bleed-or-not bit plus reason tag is the single source of truth for
//! this transition — orchestrators read `Predictor::last_signal` rather
//! than recomputing it from raw metrics.

use crate::config::PredictorConfig;
use crate::observability::MetricsRegistry;
use crate::sysmon::SystemMonitor;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
	Bleed,
	Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
	CpuHigh,
	MemoryHigh,
	ErrorRateHigh,
	Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictiveSignal {
	pub kind: SignalKind,
	pub reason: Reason,
	pub value: f64,
	pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BleedState {
	Clear,
	Bleeding,
}

struct Exceeded {
	reason: Reason,
	value: f64,
	threshold: f64,
}

/// Periodically samples the monitor and emits edge signals via a callback
/// channel; steady state is silent. Disabled mode never emits.
pub struct Predictor {
	config: PredictorConfig,
	monitor: Arc<SystemMonitor>,
	state: Mutex<BleedState>,
	/// Detail of the signal that last put this predictor into `Bleeding`,
	/// kept around so a periodic snapshot can report the current
	/// bleed/clear state even between edges.
	last_bleed: Mutex<Option<PredictiveSignal>>,
	metrics: Option<Arc<MetricsRegistry>>,
}

fn reason_tag(reason: Reason) -> &'static str {
	match reason {
		Reason::CpuHigh => "cpu_high",
		Reason::MemoryHigh => "memory_high",
		Reason::ErrorRateHigh => "error_rate_high",
		Reason::Recovered => "recovered",
	}
}

fn kind_tag(kind: SignalKind) -> &'static str {
	match kind {
		SignalKind::Bleed => "bleed",
		SignalKind::Clear => "clear",
	}
}

impl Predictor {
	pub fn new(config: PredictorConfig, monitor: Arc<SystemMonitor>) -> Self {
		Self {
			config,
			monitor,
			state: Mutex::new(BleedState::Clear),
			last_bleed: Mutex::new(None),
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	/// Evaluate one tick against the current metrics. Returns `Some` only
	/// on a state transition.
	pub fn evaluate(&self) -> Option<PredictiveSignal> {
		if !self.config.enabled {
			return None;
		}

		let cpu = self.monitor.cpu_percent().ok()?;
		let mem = self.monitor.memory_percent().ok()?;
		let err_rate = self.monitor.error_rate_per_min();

		// Priority CPU > memory > error-rate when multiple thresholds are exceeded.
		let exceeded = if cpu > self.config.cpu_threshold_pct {
			Some(Exceeded {
				reason: Reason::CpuHigh,
				value: cpu,
				threshold: self.config.cpu_threshold_pct,
			})
		} else if mem > self.config.memory_threshold_pct {
			Some(Exceeded {
				reason: Reason::MemoryHigh,
				value: mem,
				threshold: self.config.memory_threshold_pct,
			})
		} else if err_rate > self.config.error_rate_threshold_per_min {
			Some(Exceeded {
				reason: Reason::ErrorRateHigh,
				value: err_rate,
				threshold: self.config.error_rate_threshold_per_min,
			})
		} else {
			None
		};

		let signal = {
			let mut state = self.state.lock().unwrap();
			match (*state, exceeded) {
				(BleedState::Clear, Some(e)) => {
					*state = BleedState::Bleeding;
					let signal = PredictiveSignal {
						kind: SignalKind::Bleed,
						reason: e.reason,
						value: e.value,
						threshold: e.threshold,
					};
					*self.last_bleed.lock().unwrap() = Some(signal);
					Some(signal)
				}
				(BleedState::Bleeding, None) => {
					*state = BleedState::Clear;
					*self.last_bleed.lock().unwrap() = None;
					Some(PredictiveSignal {
						kind: SignalKind::Clear,
						reason: Reason::Recovered,
						value: 0.0,
						threshold: 0.0,
					})
				}
				// Bleed -> Bleed: no flap between dominant reasons while already bleeding.
				(BleedState::Bleeding, Some(_)) | (BleedState::Clear, None) => None,
			}
		};

		if let (Some(s), Some(m)) = (&signal, &self.metrics) {
			m.predictive_signals_total
				.with_label_values(&[kind_tag(s.kind), reason_tag(s.reason)])
				.inc();
		}
		signal
	}

	pub fn last_signal(&self) -> Option<SignalKind> {
		match *self.state.lock().unwrap() {
			BleedState::Clear => None,
			BleedState::Bleeding => Some(SignalKind::Bleed),
		}
	}

	/// Current bleed/clear state with the detail of whichever threshold
	/// tripped it, for inclusion in periodic snapshots (§4.12).
	pub fn current_signal(&self) -> Option<PredictiveSignal> {
		self.last_bleed.lock().unwrap().clone()
	}

	/// Run the periodic evaluation loop, sending edge signals to `sender`.
	pub fn spawn(self: Arc<Self>, sender: mpsc::Sender<PredictiveSignal>) -> JoinHandle<()> {
		let interval = self.config.interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				ticker.tick().await;
				if let Some(signal) = self.evaluate() {
					let _ = sender.send(signal).await;
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn cfg() -> PredictorConfig {
		PredictorConfig {
			enabled: true,
			interval: Duration::from_secs(5),
			cpu_threshold_pct: 85.0,
			memory_threshold_pct: 90.0,
			error_rate_threshold_per_min: 10.0,
			error_window: Duration::from_secs(60),
		}
	}

	fn monitor_with(stat: &str, mem: &str) -> Arc<SystemMonitor> {
		let stat_f = tempfile::NamedTempFile::new().unwrap();
		std::fs::write(stat_f.path(), stat).unwrap();
		let mem_f = tempfile::NamedTempFile::new().unwrap();
		std::fs::write(mem_f.path(), mem).unwrap();
		Arc::new(SystemMonitor::with_paths(
			stat_f.path().to_path_buf(),
			mem_f.path().to_path_buf(),
			Duration::from_secs(60),
		))
	}

	#[test]
	fn disabled_predictor_never_emits() {
		let mut c = cfg();
		c.enabled = false;
		let monitor = monitor_with("cpu  0 0 0 0 0 0 0 0\n", "MemTotal: 100 kB\nMemAvailable: 1 kB\n");
		let predictor = Predictor::new(c, monitor);
		assert!(predictor.evaluate().is_none());
	}

	#[test]
	fn clear_to_bleed_on_first_threshold_breach() {
		let monitor = monitor_with("cpu  0 0 0 0 0 0 0 0\n", "MemTotal: 100 kB\nMemAvailable: 1 kB\n");
		let predictor = Predictor::new(cfg(), monitor);
		let signal = predictor.evaluate().unwrap();
		assert_eq!(signal.kind, SignalKind::Bleed);
		assert_eq!(signal.reason, Reason::MemoryHigh);
	}

	#[test]
	fn bleed_to_bleed_does_not_flap_between_reasons() {
		let monitor = monitor_with("cpu  0 0 0 0 0 0 0 0\n", "MemTotal: 100 kB\nMemAvailable: 1 kB\n");
		let predictor = Predictor::new(cfg(), monitor);
		assert!(predictor.evaluate().is_some());
		// still bleeding (memory still low-available) -> no new event
		assert!(predictor.evaluate().is_none());
	}

	#[test]
	fn bleed_to_clear_only_when_all_thresholds_drop() {
		let stat_f = tempfile::NamedTempFile::new().unwrap();
		std::fs::write(stat_f.path(), "cpu  0 0 0 0 0 0 0 0\n").unwrap();
		let mem_f = tempfile::NamedTempFile::new().unwrap();
		std::fs::write(mem_f.path(), "MemTotal: 100 kB\nMemAvailable: 1 kB\n").unwrap();
		let monitor = Arc::new(SystemMonitor::with_paths(
			stat_f.path().to_path_buf(),
			mem_f.path().to_path_buf(),
			Duration::from_secs(60),
		));
		let predictor = Predictor::new(cfg(), monitor);
		assert!(predictor.evaluate().is_some());

		std::fs::write(mem_f.path(), "MemTotal: 100 kB\nMemAvailable: 99 kB\n").unwrap();
		let signal = predictor.evaluate().unwrap();
		assert_eq!(signal.kind, SignalKind::Clear);
		assert_eq!(signal.reason, Reason::Recovered);
	}
}
