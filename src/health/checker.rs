//! Health probes (C1): HTTP/HTTPS/TCP checks with a configured timeout.
//!
//! Grounded on `enrich::resilient_client`'s error-enum/timeout style, with
//! the retry/circuit-breaker machinery stripped out — hysteresis lives one
//! layer up in `registry::Backend`.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum CheckerError {
	#[error("no checker registered for scheme {0:?}")]
	NoChecker(String),
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("request failed: {0}")]
	Request(String),
	#[error("probe timed out after {0:?}")]
	Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
	Http,
	Https,
	Tcp,
}

impl CheckType {
	/// Dispatch rule from §4.1: `{"", "http", "https"}` map to the HTTP
	/// checker (scheme distinguishes TLS), `"tcp"` to the TCP checker.
	pub fn from_scheme(scheme: &str) -> Result<Self, CheckerError> {
		match scheme {
			"" | "http" => Ok(CheckType::Http),
			"https" => Ok(CheckType::Https),
			"tcp" => Ok(CheckType::Tcp),
			other => Err(CheckerError::NoChecker(other.to_string())),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CheckTarget {
	pub address: IpAddr,
	pub port: u16,
	pub check_type: CheckType,
	pub path: String,
	pub host_header: Option<String>,
	pub timeout: Duration,
	/// HTTP status codes treated as healthy. Default 200–299.
	pub healthy_statuses: std::ops::Range<u16>,
}

impl CheckTarget {
	pub fn dial_address(&self) -> String {
		match self.address {
			IpAddr::V6(v6) => format!("[{}]:{}", v6, self.port),
			IpAddr::V4(v4) => format!("{}:{}", v4, self.port),
		}
	}

	fn base_url(&self) -> String {
		let scheme = match self.check_type {
			CheckType::Https => "https",
			_ => "http",
		};
		format!("{}://{}{}", scheme, self.dial_address(), self.path)
	}
}

#[derive(Debug, Clone)]
pub struct HealthResult {
	pub healthy: bool,
	pub latency: Duration,
	pub error: Option<String>,
	pub ts: std::time::SystemTime,
}

/// Stateless probe dispatcher. Holds an HTTP client configured to not
/// follow redirects and to disable connection reuse per §4.1.
pub struct HealthChecker {
	client: reqwest::Client,
}

impl HealthChecker {
	pub fn new() -> Self {
		let client = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::none())
			.pool_max_idle_per_host(0)
			.build()
			.expect("building reqwest client with static config");
		Self { client }
	}

	pub async fn check(&self, target: &CheckTarget) -> HealthResult {
		let start = Instant::now();
		let ts = std::time::SystemTime::now();

		let outcome = match timeout(target.timeout, self.dispatch(target)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(CheckerError::Timeout(target.timeout)),
		};

		let latency = start.elapsed();
		match outcome {
			Ok(()) => HealthResult {
				healthy: true,
				latency,
				error: None,
				ts,
			},
			Err(e) => HealthResult {
				healthy: false,
				latency,
				error: Some(e.to_string()),
				ts,
			},
		}
	}

	async fn dispatch(&self, target: &CheckTarget) -> Result<(), CheckerError> {
		match target.check_type {
			CheckType::Http | CheckType::Https => self.check_http(target).await,
			CheckType::Tcp => self.check_tcp(target).await,
		}
	}

	async fn check_http(&self, target: &CheckTarget) -> Result<(), CheckerError> {
		let mut req = self.client.get(target.base_url());
		if let Some(host) = &target.host_header {
			req = req.header(reqwest::header::HOST, host.clone());
		}
		let resp = req
			.send()
			.await
			.map_err(|e| CheckerError::Request(e.to_string()))?;
		let code = resp.status().as_u16();
		if target.healthy_statuses.contains(&code) {
			Ok(())
		} else {
			Err(CheckerError::Request(format!("status {code}")))
		}
	}

	async fn check_tcp(&self, target: &CheckTarget) -> Result<(), CheckerError> {
		TcpStream::connect(target.dial_address())
			.await
			.map(|_| ())
			.map_err(|e| CheckerError::Connect(e.to_string()))
	}
}

impl Default for HealthChecker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scheme_dispatch_matches_spec_table() {
		assert_eq!(CheckType::from_scheme("").unwrap(), CheckType::Http);
		assert_eq!(CheckType::from_scheme("http").unwrap(), CheckType::Http);
		assert_eq!(CheckType::from_scheme("https").unwrap(), CheckType::Https);
		assert_eq!(CheckType::from_scheme("tcp").unwrap(), CheckType::Tcp);
		assert!(CheckType::from_scheme("ftp").is_err());
	}

	#[test]
	fn dial_address_wraps_ipv6_in_brackets() {
		let target = CheckTarget {
			address: "::1".parse().unwrap(),
			port: 8080,
			check_type: CheckType::Tcp,
			path: String::new(),
			host_header: None,
			timeout: Duration::from_secs(1),
			healthy_statuses: 200..300,
		};
		assert_eq!(target.dial_address(), "[::1]:8080");
	}

	#[test]
	fn dial_address_v4_has_no_brackets() {
		let target = CheckTarget {
			address: "10.0.0.1".parse().unwrap(),
			port: 443,
			check_type: CheckType::Https,
			path: "/health".to_string(),
			host_header: None,
			timeout: Duration::from_secs(1),
			healthy_statuses: 200..300,
		};
		assert_eq!(target.dial_address(), "10.0.0.1:443");
	}

	#[tokio::test]
	async fn tcp_check_fails_fast_on_closed_port() {
		let checker = HealthChecker::new();
		let target = CheckTarget {
			address: "127.0.0.1".parse().unwrap(),
			port: 1, // reserved, almost certainly closed
			check_type: CheckType::Tcp,
			path: String::new(),
			host_header: None,
			timeout: Duration::from_millis(500),
			healthy_statuses: 200..300,
		};
		let result = checker.check(&target).await;
		assert!(!result.healthy);
		assert!(result.error.is_some());
	}

	#[tokio::test]
	async fn http_check_times_out_on_unroutable_address() {
		let checker = HealthChecker::new();
		let target = CheckTarget {
			address: "10.255.255.1".parse().unwrap(),
			port: 81,
			check_type: CheckType::Http,
			path: "/".to_string(),
			host_header: None,
			timeout: Duration::from_millis(50),
			healthy_statuses: 200..300,
		};
		let result = checker.check(&target).await;
		assert!(!result.healthy);
	}
}
