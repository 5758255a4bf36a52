pub mod arbiter;
pub mod config;
pub mod consensus;
pub mod error;
pub mod gossip;
pub mod health;
pub mod identity;
pub mod observability;
pub mod orchestrator;
pub mod predictor;
pub mod query;
pub mod registry;
pub mod rtt;
pub mod subnet;
pub mod sysmon;
pub mod tls_utils;

use axum::routing::get;
use axum::Router;
use observability::MetricsRegistry;
use std::sync::Arc;

/// Shared `/healthz` + `/metrics` router mounted by both binaries (§10.5):
/// a liveness probe plus a Prometheus text endpoint.
pub fn healthz_router(metrics: Arc<MetricsRegistry>) -> Router {
	Router::new()
		.route("/healthz", get(|| async { "OK" }))
		.route(
			"/metrics",
			get(move || {
				let metrics = metrics.clone();
				async move { metrics.encode() }
			}),
		)
}
