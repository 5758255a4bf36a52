use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Component-local errors (health checker, gossip transport, RTT collector)
/// are their own `thiserror` enums and convert into this one at orchestrator
/// boundaries; they are not meant to be constructed directly outside of
/// those `From` impls.
#[derive(Debug, Error)]
pub enum AppError {
	#[error("invalid configuration: {0}")]
	ConfigInvalid(String),

	#[error("not the leader")]
	NotLeader,

	#[error("consensus node is not running")]
	NotRunning,

	#[error("no leader is currently known")]
	NoLeader,

	#[error("exactly one of bootstrap or join must be set")]
	BootstrapJoinConflict,

	#[error("operation timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("health probe failed: {0}")]
	ProbeFailure(String),

	#[error("platform not supported: {0}")]
	PlatformUnsupported(String),

	#[error("insufficient privileges: {0}")]
	InsufficientPrivileges(String),

	#[error("gossip transport is not running")]
	GossipNotRunning,

	#[error("no members available")]
	NoMembers,

	#[error("serialization error: {0}")]
	Serialization(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl AppError {
	/// Stable label for `errors_total{kind=...}` (§7: "metrics counters are
	/// incremented for every kind so operators can alert").
	pub fn kind(&self) -> &'static str {
		match self {
			AppError::ConfigInvalid(_) => "config_invalid",
			AppError::NotLeader => "not_leader",
			AppError::NotRunning => "not_running",
			AppError::NoLeader => "no_leader",
			AppError::BootstrapJoinConflict => "bootstrap_join_conflict",
			AppError::Timeout(_) => "timeout",
			AppError::ProbeFailure(_) => "probe_failure",
			AppError::PlatformUnsupported(_) => "platform_unsupported",
			AppError::InsufficientPrivileges(_) => "insufficient_privileges",
			AppError::GossipNotRunning => "gossip_not_running",
			AppError::NoMembers => "no_members",
			AppError::Serialization(_) => "serialization",
			AppError::Other(_) => "other",
		}
	}
}

pub type AppResult<T> = Result<T, AppError>;
