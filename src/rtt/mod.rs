pub mod collector;

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy)]
pub struct Observation {
	pub remote_addr: IpAddr,
	pub local_port: u16,
	pub rtt: Duration,
	pub ts: SystemTime,
}

pub use collector::{RttCollector, RttCollectorError};
