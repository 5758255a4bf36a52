//! Gossip propagation timing (§8 invariant 9: "a health update propagates to
//! every live member within 500ms").

use opengslb::gossip::message::{HealthUpdatePayload, MemberMetadata, NodeRole, Payload};
use opengslb::gossip::{GossipTransport, TcpGossipTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const TEST_PSK: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

async fn free_addr() -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);
	addr.to_string()
}

fn metadata(region: &str) -> MemberMetadata {
	MemberMetadata {
		role: NodeRole::Agent,
		region: region.to_string(),
		version: "test".to_string(),
		timestamp: 0,
	}
}

#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn health_update_propagates_to_all_peers_within_budget() {
	let addr_a = free_addr().await;
	let addr_b = free_addr().await;
	let addr_c = free_addr().await;

	let node_a = Arc::new(
		TcpGossipTransport::new("a".into(), addr_a.clone(), addr_a.clone(), TEST_PSK, metadata("eu-west")).unwrap(),
	);
	let node_b = Arc::new(
		TcpGossipTransport::new("b".into(), addr_b.clone(), addr_b.clone(), TEST_PSK, metadata("eu-west")).unwrap(),
	);
	let node_c = Arc::new(
		TcpGossipTransport::new("c".into(), addr_c.clone(), addr_c.clone(), TEST_PSK, metadata("eu-west")).unwrap(),
	);

	node_a.start().await.unwrap();
	node_b.start().await.unwrap();
	node_c.start().await.unwrap();

	let received_b = Arc::new(AtomicBool::new(false));
	{
		let flag = received_b.clone();
		node_b.register_handler(
			"health_update",
			Arc::new(move |_envelope: opengslb::gossip::Envelope| -> opengslb::error::AppResult<()> {
				flag.store(true, Ordering::SeqCst);
				Ok(())
			}),
		);
	}
	let received_c = Arc::new(AtomicBool::new(false));
	{
		let flag = received_c.clone();
		node_c.register_handler(
			"health_update",
			Arc::new(move |_envelope: opengslb::gossip::Envelope| -> opengslb::error::AppResult<()> {
				flag.store(true, Ordering::SeqCst);
				Ok(())
			}),
		);
	}

	// `broadcast` walks this node's own outbound connections, so the
	// broadcasting side is the one that has to dial (see `GossipTransport`'s
	// peer/member asymmetry: inbound joins only populate the membership
	// table, not the outbound peer list).
	node_a.join_seeds(&[addr_b.clone(), addr_c.clone()]).await.unwrap();

	node_a
		.broadcast(Payload::HealthUpdate(HealthUpdatePayload {
			service: "web".into(),
			address: "10.0.0.1".into(),
			region: "eu-west".into(),
			port: 80,
			weight: 100,
			healthy: true,
			previous_healthy: false,
			latency_ms: 5,
			error: None,
			check_type: "tcp".into(),
		}))
		.await
		.unwrap();

	let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
	while tokio::time::Instant::now() < deadline {
		if received_b.load(Ordering::SeqCst) && received_c.load(Ordering::SeqCst) {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert!(received_b.load(Ordering::SeqCst), "peer b never saw the health update");
	assert!(received_c.load(Ordering::SeqCst), "peer c never saw the health update");
}
