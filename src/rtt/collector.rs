//! RTT collector (C5): kernel socket-diagnostics polling for established
//! TCP connections (§4.5). Linux-reference implementation; other platforms
//! get a typed "platform not supported" error from the factory.
//!
//! `inet_diag` polling is hand-written against the `rust-netlink` crate
//! family (`netlink-packet-sock-diag`, `netlink-packet-core`,
//! `netlink-sys`).

use super::Observation;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum RttCollectorError {
	#[error("platform not supported: {0}")]
	PlatformNotSupported(String),
	#[error("insufficient privileges: {0}")]
	InsufficientPrivileges(String),
	#[error("netlink error: {0}")]
	Netlink(String),
}

pub struct RttCollectorConfig {
	pub poll_interval: Duration,
	pub ports: Vec<u16>,
}

/// Dropped-observation counter, surfaced to the metrics registry.
#[derive(Debug, Default)]
pub struct CollectorMetrics {
	pub dropped: AtomicU64,
}

pub struct RttCollector {
	inner: platform::Inner,
	started: AtomicBool,
	pub metrics: Arc<CollectorMetrics>,
}

impl RttCollector {
	/// Construct a collector for the current platform. Returns a typed
	/// error on unsupported platforms or insufficient privilege.
	pub fn new(config: RttCollectorConfig) -> Result<Self, RttCollectorError> {
		let inner = platform::Inner::new(config)?;
		Ok(Self {
			inner,
			started: AtomicBool::new(false),
			metrics: Arc::new(CollectorMetrics::default()),
		})
	}

	/// Idempotent: calling `start` more than once returns the same receiver
	/// end only on the first call; subsequent calls are no-ops.
	pub fn start(self: &Arc<Self>) -> Option<(mpsc::Receiver<Observation>, JoinHandle<()>)> {
		if self.started.swap(true, Ordering::SeqCst) {
			return None;
		}
		let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
		let this = self.clone();
		let handle = tokio::spawn(async move { this.inner.poll_loop(tx, this.metrics.clone()).await });
		Some((rx, handle))
	}

	pub fn close(&self) {
		self.started.store(false, Ordering::SeqCst);
	}
}

fn is_loopback(addr: &IpAddr) -> bool {
	match addr {
		IpAddr::V4(v4) => v4.is_loopback(),
		IpAddr::V6(v6) => v6.is_loopback(),
	}
}

fn normalize_v4_mapped(addr: IpAddr) -> IpAddr {
	match addr {
		IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
			Some(v4) => IpAddr::V4(v4),
			None => IpAddr::V6(v6),
		},
		v4 => v4,
	}
}

#[cfg(target_os = "linux")]
mod platform {
	use super::*;
	use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload};
	use netlink_packet_sock_diag::{
		SockDiagMessage,
		constants::*,
		inet::{ExtensionFlags, InetRequest, SocketId, StateFlags},
	};
	use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_SOCK_DIAG};
	use std::time::{Duration as StdDuration, SystemTime};
	use tokio::sync::mpsc::Sender;

	pub struct Inner {
		poll_interval: StdDuration,
		ports: Vec<u16>,
	}

	impl Inner {
		pub fn new(config: RttCollectorConfig) -> Result<Self, RttCollectorError> {
			// Touching the socket at construction time surfaces privilege
			// errors immediately instead of at the first poll tick.
			match Socket::new(NETLINK_SOCK_DIAG) {
				Ok(_) => {}
				Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
					return Err(RttCollectorError::InsufficientPrivileges(e.to_string()));
				}
				Err(e) => return Err(RttCollectorError::Netlink(e.to_string())),
			}

			Ok(Self {
				poll_interval: config.poll_interval,
				ports: config.ports,
			})
		}

		pub async fn poll_loop(
			&self,
			tx: Sender<Observation>,
			metrics: Arc<CollectorMetrics>,
		) {
			let mut ticker = tokio::time::interval(self.poll_interval);
			loop {
				ticker.tick().await;
				for family in [AF_INET, AF_INET6] {
					match self.poll_family(family) {
						Ok(observations) => {
							for obs in observations {
								if let Err(_) = tx.try_send(obs) {
									metrics.dropped.fetch_add(1, Ordering::SeqCst);
								}
							}
						}
						Err(e) => {
							tracing::warn!(error = %e, "inet_diag poll failed");
						}
					}
				}
			}
		}

		fn poll_family(&self, family: u8) -> Result<Vec<Observation>, RttCollectorError> {
			let mut socket = Socket::new(NETLINK_SOCK_DIAG)
				.map_err(|e| RttCollectorError::Netlink(e.to_string()))?;
			socket
				.connect(&SocketAddr::new(0, 0))
				.map_err(|e| RttCollectorError::Netlink(e.to_string()))?;

			let mut request = NetlinkMessage::from(SockDiagMessage::InetRequest(InetRequest {
				family,
				protocol: IPPROTO_TCP,
				extensions: ExtensionFlags::empty(),
				states: StateFlags::ESTABLISHED,
				socket_id: SocketId::new_v4(),
			}));
			request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
			request.header.sequence_number = 1;
			request.finalize();

			let mut buf = vec![0; request.buffer_len()];
			request.serialize(&mut buf);

			socket
				.send(&buf, 0)
				.map_err(|e| RttCollectorError::Netlink(e.to_string()))?;

			let mut out = Vec::new();
			let mut recv_buf = vec![0; 1024 * 8];
			'recv: loop {
				let (n, _addr) = socket
					.recv_from(&mut recv_buf, 0)
					.map_err(|e| RttCollectorError::Netlink(e.to_string()))?;
				let mut offset = 0;
				while offset < n {
					let bytes = &recv_buf[offset..n];
					let msg = NetlinkMessage::<SockDiagMessage>::deserialize(bytes)
						.map_err(|e| RttCollectorError::Netlink(e.to_string()))?;
					offset += msg.header.length as usize;

					match msg.payload {
						NetlinkPayload::Done(_) => break 'recv,
						NetlinkPayload::Error(e) => {
							return Err(RttCollectorError::Netlink(format!("{e:?}")));
						}
						NetlinkPayload::InnerMessage(SockDiagMessage::InetResponse(resp)) => {
							if let Some(obs) = self.to_observation(&resp) {
								out.push(obs);
							}
						}
						_ => {}
					}

					if offset == 0 {
						break 'recv;
					}
				}
			}

			Ok(out)
		}

		fn to_observation(
			&self,
			resp: &netlink_packet_sock_diag::inet::InetResponse,
		) -> Option<Observation> {
			let local_port = resp.header.socket_id.source_port;
			if !self.ports.is_empty() && !self.ports.contains(&local_port) {
				return None;
			}

			let remote_addr = normalize_v4_mapped(resp.header.socket_id.destination_address);
			if is_loopback(&remote_addr) {
				return None;
			}

			let rtt_micros = resp
				.attributes
				.iter()
				.find_map(|attr| match attr {
					netlink_packet_sock_diag::inet::InetResponseAttr::Info(info) => Some(info.rtt),
					_ => None,
				})
				.unwrap_or(0);

			// The kernel reports rtt == 0 until a connection has exchanged
			// enough to sample a round trip, so this doubles as the
			// too-young-connection filter alongside the loopback check above.
			if rtt_micros == 0 {
				return None;
			}

			Some(Observation {
				remote_addr,
				local_port,
				rtt: StdDuration::from_micros(rtt_micros as u64),
				ts: SystemTime::now(),
			})
		}
	}
}

#[cfg(not(target_os = "linux"))]
mod platform {
	use super::*;

	pub struct Inner;

	impl Inner {
		pub fn new(_config: RttCollectorConfig) -> Result<Self, RttCollectorError> {
			Err(RttCollectorError::PlatformNotSupported(
				std::env::consts::OS.to_string(),
			))
		}

		pub async fn poll_loop(
			&self,
			_tx: mpsc::Sender<Observation>,
			_metrics: Arc<CollectorMetrics>,
		) {
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_v4_mapped_strips_mapping() {
		let mapped: IpAddr = "::ffff:10.0.0.1".parse().unwrap();
		let normalized = normalize_v4_mapped(mapped);
		assert_eq!(normalized, "10.0.0.1".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn is_loopback_detects_both_families() {
		assert!(is_loopback(&"127.0.0.1".parse().unwrap()));
		assert!(is_loopback(&"::1".parse().unwrap()));
		assert!(!is_loopback(&"10.0.0.1".parse().unwrap()));
	}

	#[cfg(not(target_os = "linux"))]
	#[test]
	fn new_returns_platform_not_supported_off_linux() {
		let config = RttCollectorConfig {
			poll_interval: Duration::from_secs(10),
			ports: vec![],
		};
		let result = RttCollector::new(config);
		assert!(matches!(
			result,
			Err(RttCollectorError::PlatformNotSupported(_))
		));
	}
}
