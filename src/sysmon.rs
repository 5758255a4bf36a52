//! System monitor (C3): CPU/memory/error-rate sampling from `/proc` (§4.3).
//!
//! Hand-written against stdlib only: `/proc/stat` and `/proc/meminfo`
//! parsing with no reason to pull in a crate for either.

use crate::error::{AppError, AppResult};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BASELINE_RESET_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, Default)]
struct CpuTimes {
	total: u64,
	idle: u64,
}

fn parse_proc_stat(contents: &str) -> AppResult<CpuTimes> {
	let line = contents
		.lines()
		.find(|l| l.starts_with("cpu "))
		.ok_or_else(|| AppError::ProbeFailure("missing aggregate cpu line in /proc/stat".into()))?;

	let fields: Vec<u64> = line
		.split_whitespace()
		.skip(1)
		.map(|f| f.parse::<u64>().unwrap_or(0))
		.collect();

	if fields.len() < 7 {
		return Err(AppError::ProbeFailure(
			"/proc/stat cpu line has fewer fields than expected".into(),
		));
	}

	let user = fields[0];
	let nice = fields[1];
	let system = fields[2];
	let idle = fields[3];
	let iowait = fields[4];
	let irq = fields[5];
	let softirq = fields[6];
	let steal = fields.get(7).copied().unwrap_or(0);

	let total = user + nice + system + idle + iowait + irq + softirq + steal;
	let idle_time = idle + iowait;

	Ok(CpuTimes {
		total,
		idle: idle_time,
	})
}

fn parse_proc_meminfo(contents: &str) -> AppResult<(u64, u64)> {
	let mut total = None;
	let mut available = None;

	for line in contents.lines() {
		if let Some(rest) = line.strip_prefix("MemTotal:") {
			total = parse_kb_field(rest);
		} else if let Some(rest) = line.strip_prefix("MemAvailable:") {
			available = parse_kb_field(rest);
		}
	}

	match (total, available) {
		(Some(t), Some(a)) => Ok((t, a)),
		_ => Err(AppError::ProbeFailure(
			"MemTotal or MemAvailable missing from /proc/meminfo".into(),
		)),
	}
}

fn parse_kb_field(s: &str) -> Option<u64> {
	s.trim()
		.split_whitespace()
		.next()
		.and_then(|v| v.parse::<u64>().ok())
}

struct Baseline {
	times: CpuTimes,
	sampled_at: Instant,
}

/// Thread-safe CPU/memory/error-rate sampler. Paths are overridable for
/// testing.
pub struct SystemMonitor {
	stat_path: PathBuf,
	meminfo_path: PathBuf,
	baseline: Mutex<Option<Baseline>>,
	error_events: Mutex<VecDeque<Instant>>,
	error_window: Duration,
}

impl SystemMonitor {
	pub fn new(error_window: Duration) -> Self {
		Self::with_paths(
			PathBuf::from("/proc/stat"),
			PathBuf::from("/proc/meminfo"),
			error_window,
		)
	}

	pub fn with_paths(stat_path: PathBuf, meminfo_path: PathBuf, error_window: Duration) -> Self {
		Self {
			stat_path,
			meminfo_path,
			baseline: Mutex::new(None),
			error_events: Mutex::new(VecDeque::new()),
			error_window,
		}
	}

	/// CPU utilization percentage via successive-delta arithmetic. The
	/// first call establishes a baseline and returns 0; a gap of more than
	/// 10 minutes between samples resets the baseline the same way.
	pub fn cpu_percent(&self) -> AppResult<f64> {
		let contents = std::fs::read_to_string(&self.stat_path)
			.map_err(|e| AppError::ProbeFailure(format!("reading {}: {e}", self.stat_path.display())))?;
		let now_times = parse_proc_stat(&contents)?;
		let now = Instant::now();

		let mut baseline = self.baseline.lock().unwrap();
		let pct = match baseline.as_ref() {
			Some(b) if now.duration_since(b.sampled_at) <= BASELINE_RESET_AFTER => {
				let total_delta = now_times.total.saturating_sub(b.times.total);
				let idle_delta = now_times.idle.saturating_sub(b.times.idle);
				if total_delta == 0 {
					0.0
				} else {
					(total_delta.saturating_sub(idle_delta)) as f64 / total_delta as f64 * 100.0
				}
			}
			_ => 0.0,
		};

		*baseline = Some(Baseline {
			times: now_times,
			sampled_at: now,
		});

		Ok(pct)
	}

	/// Memory utilization percentage: `(total - available) / total * 100`.
	pub fn memory_percent(&self) -> AppResult<f64> {
		let contents = std::fs::read_to_string(&self.meminfo_path).map_err(|e| {
			AppError::ProbeFailure(format!("reading {}: {e}", self.meminfo_path.display()))
		})?;
		let (total, available) = parse_proc_meminfo(&contents)?;
		if total == 0 {
			return Err(AppError::ProbeFailure("MemTotal is zero".into()));
		}
		Ok((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
	}

	/// Record an error event for the rate calculation.
	pub fn record_error(&self) {
		let mut events = self.error_events.lock().unwrap();
		events.push_back(Instant::now());
		self.trim_events(&mut events);
	}

	/// Error rate extrapolated to events per minute over the trailing window.
	pub fn error_rate_per_min(&self) -> f64 {
		let mut events = self.error_events.lock().unwrap();
		self.trim_events(&mut events);
		if self.error_window.is_zero() {
			return 0.0;
		}
		events.len() as f64 / self.error_window.as_secs_f64() * 60.0
	}

	fn trim_events(&self, events: &mut VecDeque<Instant>) {
		let now = Instant::now();
		while let Some(front) = events.front() {
			if now.duration_since(*front) > self.error_window {
				events.pop_front();
			} else {
				break;
			}
		}
	}
}

#[allow(dead_code)]
fn _assert_path_overridable(_p: &Path) {}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(contents.as_bytes()).unwrap();
		f
	}

	#[test]
	fn cpu_percent_first_call_returns_zero_baseline() {
		let stat = write_tmp("cpu  100 0 100 800 0 0 0 0 0 0\n");
		let mem = write_tmp("MemTotal: 1000 kB\nMemAvailable: 500 kB\n");
		let mon = SystemMonitor::with_paths(
			stat.path().to_path_buf(),
			mem.path().to_path_buf(),
			Duration::from_secs(60),
		);
		assert_eq!(mon.cpu_percent().unwrap(), 0.0);
	}

	#[test]
	fn cpu_percent_computes_delta_on_second_call() {
		let stat = tempfile::NamedTempFile::new().unwrap();
		std::fs::write(stat.path(), "cpu  100 0 100 800 0 0 0 0\n").unwrap();
		let mem = write_tmp("MemTotal: 1000 kB\nMemAvailable: 500 kB\n");
		let mon = SystemMonitor::with_paths(
			stat.path().to_path_buf(),
			mem.path().to_path_buf(),
			Duration::from_secs(60),
		);
		mon.cpu_percent().unwrap();

		std::fs::write(stat.path(), "cpu  200 0 200 900 0 0 0 0\n").unwrap();
		// total delta = 100(user)+100(system)+100(idle) = 300, idle delta = 100
		let pct = mon.cpu_percent().unwrap();
		assert!((pct - ((300.0 - 100.0) / 300.0 * 100.0)).abs() < 1e-9);
	}

	#[test]
	fn memory_percent_computed_from_total_and_available() {
		let stat = write_tmp("cpu  0 0 0 0 0 0 0 0\n");
		let mem = write_tmp("MemTotal: 2000 kB\nMemAvailable: 500 kB\n");
		let mon = SystemMonitor::with_paths(
			stat.path().to_path_buf(),
			mem.path().to_path_buf(),
			Duration::from_secs(60),
		);
		assert_eq!(mon.memory_percent().unwrap(), 75.0);
	}

	#[test]
	fn memory_percent_errors_when_fields_missing() {
		let stat = write_tmp("cpu  0 0 0 0 0 0 0 0\n");
		let mem = write_tmp("MemTotal: 2000 kB\n");
		let mon = SystemMonitor::with_paths(
			stat.path().to_path_buf(),
			mem.path().to_path_buf(),
			Duration::from_secs(60),
		);
		assert!(mon.memory_percent().is_err());
	}

	#[test]
	fn error_rate_extrapolates_to_per_minute() {
		let stat = write_tmp("cpu  0 0 0 0 0 0 0 0\n");
		let mem = write_tmp("MemTotal: 1 kB\nMemAvailable: 1 kB\n");
		let mon = SystemMonitor::with_paths(
			stat.path().to_path_buf(),
			mem.path().to_path_buf(),
			Duration::from_secs(60),
		);
		for _ in 0..6 {
			mon.record_error();
		}
		assert!((mon.error_rate_per_min() - 6.0).abs() < 1e-9);
	}
}
