//! PortProxy Protocol Definitions
//!
//! This crate defines the wire types shared by the agent and the console:
//! the encrypted envelope, rule-management commands and responses, and the
//! failover configuration and status documents.

pub mod command;
pub mod envelope;
pub mod failover;
pub mod status;

pub use command::{Command, CommandVerb, ProtoError, Protocol, Response, Rule};
pub use envelope::Envelope;
pub use failover::{
    FailoverConfig, FailoverStatus, HealthStatus, ServerMappings, ServerSide,
    DEFAULT_CHECK_INTERVAL_SECONDS, DEFAULT_TIMEOUT_SECONDS,
};
pub use status::{AgentStatus, PingResponse};

/// Agent protocol version reported by `/ping` and `/status`
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum age (and clock skew) accepted for an envelope timestamp
pub const MESSAGE_EXPIRATION_MINUTES: i64 = 5;
