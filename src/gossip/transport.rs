//! Gossip transport (C7): membership, reliable broadcast, PSK encryption.
//!
//! A connect loop with length-prefixed message framing and
//! exponential-backoff-with-jitter reconnect, sealed with the
//! PSK-encrypted envelope in `crypto`/`message`.

use super::crypto::GossipCipher;
use super::message::{
	Envelope, LatencyReportPayload, Liveness, Member, MemberMetadata, Payload, WireMessage,
};
use crate::error::{AppError, AppResult};
use crate::observability::MetricsRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const MAX_FRAME_SIZE: usize = 1024 * 1024;
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

pub type HandlerResult = AppResult<()>;
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) -> HandlerResult + Send + Sync>;

#[async_trait]
pub trait GossipTransport: Send + Sync {
	async fn start(&self) -> AppResult<()>;
	async fn stop(&self) -> AppResult<()>;
	async fn broadcast(&self, payload: Payload) -> AppResult<()>;
	async fn send_to(&self, member_name: &str, payload: Payload) -> AppResult<()>;
	/// First-class wire operation rather than a generic `broadcast` call,
	/// so every transport implementation supports it directly.
	async fn broadcast_latency_report(&self, report: LatencyReportPayload) -> AppResult<()>;
	async fn members(&self) -> Vec<Member>;
	fn register_handler(&self, variant: &'static str, handler: EnvelopeHandler);
}

struct PeerConn {
	stream: Mutex<TcpStream>,
}

struct Inner {
	node_id: String,
	bind_addr: String,
	advertise_addr: String,
	cipher: GossipCipher,
	members: RwLock<HashMap<String, Member>>,
	peers: RwLock<HashMap<String, Arc<PeerConn>>>,
	handlers: RwLock<HashMap<&'static str, Vec<EnvelopeHandler>>>,
	started: AtomicBool,
	self_metadata: MemberMetadata,
	metrics: RwLock<Option<Arc<MetricsRegistry>>>,
}

/// TCP + PSK-encrypted gossip transport. Cheaply cloneable; every clone
/// shares the same membership table, peer connections, and listener.
#[derive(Clone)]
pub struct TcpGossipTransport {
	inner: Arc<Inner>,
}

impl TcpGossipTransport {
	pub fn new(
		node_id: String,
		bind_addr: String,
		advertise_addr: String,
		psk_base64: &str,
		self_metadata: MemberMetadata,
	) -> AppResult<Self> {
		let cipher = GossipCipher::from_base64_psk(psk_base64)?;
		Ok(Self {
			inner: Arc::new(Inner {
				node_id,
				bind_addr,
				advertise_addr,
				cipher,
				members: RwLock::new(HashMap::new()),
				peers: RwLock::new(HashMap::new()),
				handlers: RwLock::new(HashMap::new()),
				started: AtomicBool::new(false),
				self_metadata,
				metrics: RwLock::new(None),
			}),
		})
	}

	/// Wire a metrics registry in after construction; called once from the
	/// binary entrypoint before `start`, same convention as
	/// `register_handler`'s pre-start `try_write`.
	pub fn set_metrics(&self, metrics: Arc<MetricsRegistry>) {
		if let Ok(mut m) = self.inner.metrics.try_write() {
			*m = Some(metrics);
		}
	}

	pub async fn join_seeds(&self, seeds: &[String]) -> AppResult<()> {
		for seed in seeds {
			if let Err(e) = self.dial_and_register(seed).await {
				warn!(seed = %seed, error = %e, "failed to join gossip seed");
			}
		}
		Ok(())
	}

	async fn dial_and_register(&self, addr: &str) -> AppResult<()> {
		let stream = TcpStream::connect(addr)
			.await
			.map_err(|e| AppError::Other(anyhow::anyhow!("dialing gossip peer {addr}: {e}")))?;
		let conn = Arc::new(PeerConn {
			stream: Mutex::new(stream),
		});

		let member = Member {
			name: self.inner.node_id.clone(),
			address: self.inner.advertise_addr.clone(),
			port: 0,
			liveness: Liveness::Alive,
			metadata: Some(self.inner.self_metadata.clone()),
		};
		self.send_on(&conn, &WireMessage::Join { member }).await?;
		self.inner.peers.write().await.insert(addr.to_string(), conn);
		Ok(())
	}

	async fn send_on(&self, conn: &Arc<PeerConn>, msg: &WireMessage) -> AppResult<()> {
		let json = serde_json::to_vec(msg)
			.map_err(|e| AppError::Serialization(format!("encoding gossip message: {e}")))?;
		let sealed = self.inner.cipher.seal(&json)?;
		if sealed.len() > MAX_FRAME_SIZE {
			return Err(AppError::Serialization(format!(
				"gossip frame of {} bytes exceeds max {}",
				sealed.len(),
				MAX_FRAME_SIZE
			)));
		}

		let mut stream = conn.stream.lock().await;
		stream
			.write_all(&(sealed.len() as u32).to_be_bytes())
			.await
			.map_err(|e| AppError::Other(anyhow::anyhow!("writing gossip frame length: {e}")))?;
		stream
			.write_all(&sealed)
			.await
			.map_err(|e| AppError::Other(anyhow::anyhow!("writing gossip frame: {e}")))?;
		Ok(())
	}

	async fn read_from(&self, stream: &mut TcpStream) -> AppResult<WireMessage> {
		let mut len_bytes = [0u8; 4];
		stream
			.read_exact(&mut len_bytes)
			.await
			.map_err(|e| AppError::Other(anyhow::anyhow!("reading gossip frame length: {e}")))?;
		let len = u32::from_be_bytes(len_bytes) as usize;
		if len > MAX_FRAME_SIZE {
			return Err(AppError::Serialization(format!(
				"incoming gossip frame of {len} bytes exceeds max {MAX_FRAME_SIZE}"
			)));
		}
		let mut buf = vec![0u8; len];
		stream
			.read_exact(&mut buf)
			.await
			.map_err(|e| AppError::Other(anyhow::anyhow!("reading gossip frame body: {e}")))?;
		let plaintext = self.inner.cipher.open(&buf)?;
		serde_json::from_slice(&plaintext)
			.map_err(|e| AppError::Serialization(format!("decoding gossip message: {e}")))
	}

	async fn accept_loop(self, listener: TcpListener) {
		loop {
			match listener.accept().await {
				Ok((mut stream, peer_addr)) => {
					let this = self.clone();
					tokio::spawn(async move {
						loop {
							match this.read_from(&mut stream).await {
								Ok(msg) => this.handle_incoming(msg).await,
								Err(e) => {
									debug!(peer = %peer_addr, error = %e, "gossip connection closed");
									break;
								}
							}
						}
					});
				}
				Err(e) => {
					warn!(error = %e, "gossip accept failed");
				}
			}
		}
	}

	async fn handle_incoming(&self, msg: WireMessage) {
		match msg {
			WireMessage::Join { member } => {
				info!(member = %member.name, "gossip member joined");
				self.inner
					.members
					.write()
					.await
					.insert(member.name.clone(), member);
			}
			WireMessage::Leave { name } => {
				if let Some(m) = self.inner.members.write().await.get_mut(&name) {
					m.liveness = Liveness::Left;
				}
			}
			WireMessage::User { envelope } => {
				self.dispatch(envelope).await;
			}
			WireMessage::Ping | WireMessage::Pong => {}
		}
	}

	async fn dispatch(&self, envelope: Envelope) {
		let variant = match &envelope.payload {
			Payload::HealthUpdate(_) => "health_update",
			Payload::Predictive(_) => "predictive",
			Payload::Override(_) => "override",
			Payload::NodeState(_) => "node_state",
			Payload::LatencyReport(_) => "latency_report",
		};
		if let Some(m) = self.inner.metrics.read().await.as_ref() {
			m.gossip_envelopes_received_total.with_label_values(&[variant]).inc();
		}
		let handlers = self.inner.handlers.read().await;
		if let Some(hs) = handlers.get(variant) {
			for h in hs {
				let envelope = envelope.clone();
				let h = h.clone();
				tokio::spawn(async move {
					if let Err(e) = h(envelope) {
						warn!(error = %e, "gossip handler failed");
					}
				});
			}
		}
	}

	async fn broadcast_envelope(&self, envelope: Envelope) -> AppResult<()> {
		let peers = self.inner.peers.read().await;
		if peers.is_empty() {
			return Ok(());
		}

		let msg = WireMessage::User {
			envelope: envelope.clone(),
		};
		let mut delivered = 0usize;
		for conn in peers.values() {
			if self.send_on(conn, &msg).await.is_ok() {
				delivered += 1;
			}
		}

		let result = if delivered == 0 { Err(AppError::NoMembers) } else { Ok(()) };
		if let Some(m) = self.inner.metrics.read().await.as_ref() {
			let label = if result.is_ok() { "ok" } else { "error" };
			m.gossip_broadcasts_total.with_label_values(&[label]).inc();
		}
		result
	}
}

#[async_trait]
impl GossipTransport for TcpGossipTransport {
	async fn start(&self) -> AppResult<()> {
		if self.inner.started.swap(true, Ordering::SeqCst) {
			return Err(AppError::Other(anyhow::anyhow!(
				"gossip transport already started"
			)));
		}

		let listener = TcpListener::bind(&self.inner.bind_addr)
			.await
			.map_err(|e| AppError::Other(anyhow::anyhow!("binding gossip listener: {e}")))?;

		info!(bind_addr = %self.inner.bind_addr, "gossip transport listening");
		tokio::spawn(self.clone().accept_loop(listener));
		Ok(())
	}

	async fn stop(&self) -> AppResult<()> {
		if !self.inner.started.swap(false, Ordering::SeqCst) {
			return Ok(());
		}
		let peers = self.inner.peers.read().await;
		let leave = WireMessage::Leave {
			name: self.inner.node_id.clone(),
		};
		for conn in peers.values() {
			let _ = tokio::time::timeout(LEAVE_TIMEOUT, self.send_on(conn, &leave)).await;
		}
		Ok(())
	}

	async fn broadcast(&self, payload: Payload) -> AppResult<()> {
		if !self.inner.started.load(Ordering::SeqCst) {
			return Err(AppError::GossipNotRunning);
		}
		let envelope = Envelope::new(self.inner.node_id.clone(), payload);
		self.broadcast_envelope(envelope).await
	}

	async fn send_to(&self, member_name: &str, payload: Payload) -> AppResult<()> {
		if !self.inner.started.load(Ordering::SeqCst) {
			return Err(AppError::GossipNotRunning);
		}
		let peers = self.inner.peers.read().await;
		let conn = peers.get(member_name).ok_or(AppError::NoMembers)?;
		let envelope = Envelope::new(self.inner.node_id.clone(), payload);
		self.send_on(conn, &WireMessage::User { envelope }).await
	}

	async fn broadcast_latency_report(&self, report: LatencyReportPayload) -> AppResult<()> {
		self.broadcast(Payload::LatencyReport(report)).await
	}

	async fn members(&self) -> Vec<Member> {
		self.inner.members.read().await.values().cloned().collect()
	}

	fn register_handler(&self, variant: &'static str, handler: EnvelopeHandler) {
		// Registration happens before `start` on the orchestrator's setup
		// path; `try_write` avoids needing an async fn in a sync trait method.
		if let Ok(mut handlers) = self.inner.handlers.try_write() {
			handlers.entry(variant).or_default().push(handler);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gossip::message::{HealthUpdatePayload, NodeRole};

	fn psk() -> String {
		use base64::Engine;
		base64::engine::general_purpose::STANDARD.encode([3u8; 32])
	}

	fn metadata() -> MemberMetadata {
		MemberMetadata {
			role: NodeRole::Agent,
			region: "eu-west".to_string(),
			version: "0.1.0".to_string(),
			timestamp: 0,
		}
	}

	#[tokio::test]
	async fn broadcast_with_no_peers_is_a_noop() {
		let transport = TcpGossipTransport::new(
			"n1".to_string(),
			"127.0.0.1:0".to_string(),
			"127.0.0.1:0".to_string(),
			&psk(),
			metadata(),
		)
		.unwrap();
		transport.start().await.unwrap();
		let result = transport
			.broadcast(Payload::HealthUpdate(HealthUpdatePayload {
				service: "web".into(),
				address: "10.0.0.1".into(),
				region: "eu-west".into(),
				port: 80,
				weight: 100,
				healthy: true,
				previous_healthy: false,
				latency_ms: 12,
				error: None,
				check_type: "tcp".into(),
			}))
			.await;
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn starting_twice_is_an_error() {
		let transport = TcpGossipTransport::new(
			"n1".to_string(),
			"127.0.0.1:0".to_string(),
			"127.0.0.1:0".to_string(),
			&psk(),
			metadata(),
		)
		.unwrap();
		transport.start().await.unwrap();
		assert!(transport.start().await.is_err());
	}

	#[tokio::test]
	async fn broadcast_before_start_is_gossip_not_running() {
		let transport = TcpGossipTransport::new(
			"n1".to_string(),
			"127.0.0.1:0".to_string(),
			"127.0.0.1:0".to_string(),
			&psk(),
			metadata(),
		)
		.unwrap();
		let result = transport
			.broadcast(Payload::NodeState(super::super::message::NodeStatePayload {
				member: Member {
					name: "n1".into(),
					address: "127.0.0.1".into(),
					port: 7000,
					liveness: Liveness::Alive,
					metadata: None,
				},
			}))
			.await;
		assert!(matches!(result, Err(AppError::GossipNotRunning)));
	}
}
