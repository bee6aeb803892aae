//! When health readings warrant a switch

use portproxy_proto::{HealthStatus, ServerSide};

/// What a probe cycle should do about the observed health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    Switch { target: ServerSide, reason: &'static str },
    NoAction,
}

/// Switch only when the active side is definitively dead and the other
/// side definitively alive. `Unknown` never triggers a switch.
pub fn decide(
    health_a: HealthStatus,
    health_b: HealthStatus,
    currently_failed_over: bool,
) -> FailoverDecision {
    match (health_a, health_b, currently_failed_over) {
        (HealthStatus::Dead, HealthStatus::Alive, false) => FailoverDecision::Switch {
            target: ServerSide::B,
            reason: "A endpoint is Dead, B endpoint is Alive",
        },
        (HealthStatus::Alive, HealthStatus::Dead, true) => FailoverDecision::Switch {
            target: ServerSide::A,
            reason: "A endpoint is Alive, B endpoint is Dead",
        },
        _ => FailoverDecision::NoAction,
    }
}
