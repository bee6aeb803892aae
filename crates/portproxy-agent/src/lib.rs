//! PortProxy agent
//!
//! Exposes an encrypted command channel for managing the host's
//! port-forwarding rules and runs a health-driven failover controller that
//! retargets those rules between A and B servers. Agents can also announce
//! themselves to a central manager.

pub mod agent;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod failover;
pub mod registration;
pub mod rule_store;
pub mod status;

pub use agent::{Agent, AgentError};
pub use api::{build_router, AppState};
pub use config::AgentConfig;
pub use dispatcher::{CommandDispatcher, DispatchError};
pub use failover::{
    ConfigStore, FailoverController, FailoverError, HealthProbe, HttpHealthProbe, ProbeError,
    RemapReport,
};
pub use registration::{RegistrationClient, RegistrationError, RegistrationService};
pub use rule_store::{
    MemoryRuleStore, NetshRuleStore, RuleSnapshot, RuleStore, RuleStoreError, RuleStoreKind,
    ToolOutput,
};
pub use status::{AgentIdentity, StatusReporter};
