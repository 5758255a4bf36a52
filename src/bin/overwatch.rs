//! Overwatch node entrypoint (C13): loads `OverwatchConfig`, wires identity,
//! consensus, and gossip, starts the orchestrator, and serves the internal
//! Raft RPC on `raft_bind_addr` plus the public join API and `/healthz` +
//! `/metrics` on `api_bind_addr`.

use opengslb::config::{self, OverwatchConfig};
use opengslb::consensus::{self, ReplicatedFsm};
use opengslb::gossip::message::{MemberMetadata, NodeRole};
use opengslb::gossip::TcpGossipTransport;
use opengslb::identity::Identity;
use opengslb::orchestrator::OverwatchOrchestrator;
use opengslb::{healthz_router, observability};
use opengslb::consensus::RaftNode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let obs = observability::init_observability().await?;

	let config: OverwatchConfig = config::load("overwatch")?;
	config.consensus.validate()?;

	let identity = Identity::load_or_generate(
		&config.identity.region,
		&config.identity.service_token,
		&config.identity.cert_path,
		&config.identity.key_path,
	)?;
	let node_id = identity.node_id();
	tracing::info!(%node_id, region = %config.identity.region, "overwatch identity ready");

	let fsm = Arc::new(ReplicatedFsm::new());
	let raft = Arc::new(RaftNode::new(
		identity.raft_id(),
		config.consensus.clone(),
		fsm,
	)?);
	raft.set_metrics(obs.metrics.clone());
	raft.register_leader_observer(Arc::new({
		let node_id = node_id.clone();
		move |is_leader| {
			if is_leader {
				tracing::info!(%node_id, "became raft leader");
			} else {
				tracing::info!(%node_id, "stepped down as raft leader");
			}
		}
	}));
	let timer_handle = raft.spawn_timers();

	let metadata = MemberMetadata {
		role: NodeRole::Overwatch,
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
	let gossip_seeds = config.gossip.seeds.clone();

	let api_addr = config.consensus.api_bind_addr.clone();
	let raft_addr = config.consensus.raft_bind_addr.clone();

	// `start()` brings up the gossip listener and bootstraps/joins raft;
	// dialing seeds only makes sense once our own listener is accepting.
	let orchestrator = OverwatchOrchestrator::new(config, identity, raft.clone(), transport.clone(), obs.metrics.clone());
	orchestrator.start().await?;
	transport.join_seeds(&gossip_seeds).await?;

	// Internal Raft RPC and the public join/healthz API are deliberately
	// separate listeners (§6): the former is cluster-internal, the latter is
	// the surface a load balancer or operator tooling talks to.
	let raft_for_rpc = raft.clone();
	let raft_listener = tokio::net::TcpListener::bind(&raft_addr).await?;
	let raft_task = tokio::spawn(async move {
		if let Err(e) = axum::serve(raft_listener, consensus::raft_router(raft_for_rpc)).await {
			tracing::error!(error = %e, "raft rpc server exited with error");
		}
	});

	let api_app = healthz_router(obs.metrics.clone()).merge(consensus::join::router(raft));
	let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
	tracing::info!(addr = %api_addr, raft_addr = %raft_addr, "serving join api, healthz/metrics, and raft rpc");

	tokio::select! {
		result = axum::serve(api_listener, api_app) => {
			if let Err(e) = result {
				tracing::error!(error = %e, "overwatch api server exited with error");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received shutdown signal");
		}
	}

	raft_task.abort();
	timer_handle.abort();
	orchestrator.stop().await;
	Ok(())
}

fn unix_now() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}
