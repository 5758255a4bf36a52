pub mod crypto;
pub mod message;
pub mod transport;

pub use message::{Envelope, LatencyReportPayload, Liveness, Member, MemberMetadata, NodeRole, Payload};
pub use transport::{EnvelopeHandler, GossipTransport, TcpGossipTransport};
