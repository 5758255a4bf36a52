//! Agent node entrypoint (C12): loads `AgentConfig`, wires identity and
//! gossip, starts the orchestrator, and serves `/healthz` + `/metrics`.
//!
//! Load config, init observability, construct the long-lived components,
//! serve, wait for ctrl_c, shut down in reverse order.

use opengslb::config::{self, AgentConfig};
use opengslb::gossip::message::{MemberMetadata, NodeRole};
use opengslb::gossip::{GossipTransport, TcpGossipTransport};
use opengslb::identity::Identity;
use opengslb::orchestrator::AgentOrchestrator;
use opengslb::{healthz_router, observability};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let obs = observability::init_observability().await?;

	let config: AgentConfig = config::load("agent")?;

	let identity = Identity::load_or_generate(
		&config.identity.region,
		&config.identity.service_token,
		&config.identity.cert_path,
		&config.identity.key_path,
	)?;
	let node_id = identity.node_id();
	tracing::info!(%node_id, region = %config.identity.region, "agent identity ready");

	let metadata = MemberMetadata {
		role: NodeRole::Agent,
		region: config.identity.region.clone(),
		version: env!("CARGO_PKG_VERSION").to_string(),
		timestamp: unix_now(),
	};
	let transport = Arc::new(TcpGossipTransport::new(
		node_id.clone(),
		config.gossip.bind_addr.clone(),
		config
			.gossip
			.advertise_addr
			.clone()
			.unwrap_or_else(|| config.gossip.bind_addr.clone()),
		&config.gossip.encryption_key,
		metadata,
	)?);
	transport.set_metrics(obs.metrics.clone());
	transport.start().await?;
	transport.join_seeds(&config.gossip.seeds).await?;

	let healthz_addr = config.healthz_addr.clone();
	let orchestrator = Arc::new(AgentOrchestrator::new(config, identity, transport, obs.metrics.clone()));
	orchestrator.start().await?;

	let app = healthz_router(obs.metrics.clone());
	let listener = tokio::net::TcpListener::bind(&healthz_addr).await?;
	tracing::info!(addr = %healthz_addr, "serving healthz/metrics");

	tokio::select! {
		result = axum::serve(listener, app) => {
			if let Err(e) = result {
				tracing::error!(error = %e, "healthz server exited with error");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received shutdown signal");
		}
	}

	orchestrator.stop().await;
	Ok(())
}

fn unix_now() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}
