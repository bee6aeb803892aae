//! Failover configuration, address mappings and status documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CHECK_INTERVAL_SECONDS: i64 = 30;
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 10;

/// Classification of a health endpoint response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum HealthStatus {
    Alive,
    Dead,
    Unknown,
}

impl HealthStatus {
    pub const ALL: [HealthStatus; 3] = [HealthStatus::Alive, HealthStatus::Dead, HealthStatus::Unknown];

    /// Classify a successfully fetched response body.
    ///
    /// Only the exact (trimmed) words `Alive` and `Dead` are recognised;
    /// anything else is `Unknown`.
    pub fn classify(body: &str) -> Self {
        match body.trim() {
            "Alive" => HealthStatus::Alive,
            "Dead" => HealthStatus::Dead,
            _ => HealthStatus::Unknown,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, HealthStatus::Alive)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HealthStatus::Alive => "Alive",
            HealthStatus::Dead => "Dead",
            HealthStatus::Unknown => "Unknown",
        };
        f.write_str(text)
    }
}

/// Which replica set a rule's connect address should point at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerSide {
    A,
    B,
}

impl ServerSide {
    pub fn from_fail_to_b(fail_to_b: bool) -> Self {
        if fail_to_b {
            ServerSide::B
        } else {
            ServerSide::A
        }
    }

    pub fn is_b(&self) -> bool {
        matches!(self, ServerSide::B)
    }
}

impl fmt::Display for ServerSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSide::A => f.write_str("A"),
            ServerSide::B => f.write_str("B"),
        }
    }
}

/// Validated A↔B address mapping with constant-time lookups both ways
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMappings {
    a_to_b: HashMap<String, String>,
    b_to_a: HashMap<String, String>,
}

impl ServerMappings {
    /// Build the mapping from `(a, b)` pairs, collecting every problem found.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut errors = Vec::new();
        let mut a_to_b: HashMap<String, String> = HashMap::new();
        let mut b_to_a: HashMap<String, String> = HashMap::new();
        let mut order = Vec::new();

        for (a, b) in pairs {
            let a = a.as_ref().trim();
            let b = b.as_ref().trim();

            if a.is_empty() {
                errors.push("Server mapping has an empty A server address".to_string());
                continue;
            }
            if b.is_empty() {
                errors.push(format!("Server mapping for '{}' has an empty B server address", a));
                continue;
            }
            if a == b {
                errors.push(format!("Server mapping for '{}' maps the server to itself", a));
                continue;
            }
            if a_to_b.contains_key(a) {
                errors.push(format!("A server '{}' is mapped more than once", a));
                continue;
            }
            if let Some(existing) = b_to_a.get(b) {
                errors.push(format!(
                    "B server '{}' is mapped from more than one A server ('{}', '{}')",
                    b, existing, a
                ));
                continue;
            }

            a_to_b.insert(a.to_string(), b.to_string());
            b_to_a.insert(b.to_string(), a.to_string());
            order.push(a.to_string());
        }

        for a in &order {
            if b_to_a.contains_key(a) {
                errors.push(format!(
                    "Address '{}' is used as both an A server and a B server",
                    a
                ));
            }
        }

        if errors.is_empty() {
            Ok(Self { a_to_b, b_to_a })
        } else {
            Err(errors)
        }
    }

    pub fn b_for(&self, a: &str) -> Option<&str> {
        self.a_to_b.get(a).map(String::as_str)
    }

    pub fn a_for(&self, b: &str) -> Option<&str> {
        self.b_to_a.get(b).map(String::as_str)
    }

    /// Connect address a rule currently pointing at `current` should use
    /// when `target` is the active side. Addresses outside the mapping, and
    /// addresses already on the target side, are returned unchanged.
    pub fn resolve<'a>(&'a self, current: &'a str, target: ServerSide) -> &'a str {
        let mapped = match target {
            ServerSide::B => self.b_for(current),
            ServerSide::A => self.a_for(current),
        };
        mapped.unwrap_or(current)
    }

    pub fn len(&self) -> usize {
        self.a_to_b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a_to_b.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.a_to_b
            .iter()
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect()
    }
}

/// Failover settings and runtime state of one agent.
///
/// The operator sets the first six fields; the remaining ones are runtime
/// state maintained by the agent and persisted alongside the settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub health_url_a: String,
    #[serde(default)]
    pub health_url_b: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: i64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    /// A server address → B server address
    #[serde(default)]
    pub server_mappings: BTreeMap<String, String>,

    #[serde(default)]
    pub currently_failed_over: bool,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_a: Option<HealthStatus>,
    #[serde(default)]
    pub last_health_b: Option<HealthStatus>,
    #[serde(default)]
    pub consecutive_failures_a: u32,
    #[serde(default)]
    pub consecutive_failures_b: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_failover_time: Option<DateTime<Utc>>,
}

fn default_check_interval() -> i64 {
    DEFAULT_CHECK_INTERVAL_SECONDS
}

fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            health_url_a: String::new(),
            health_url_b: String::new(),
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            server_mappings: BTreeMap::new(),
            currently_failed_over: false,
            last_health_check: None,
            last_health_a: None,
            last_health_b: None,
            consecutive_failures_a: 0,
            consecutive_failures_b: 0,
            last_error: None,
            last_failover_time: None,
        }
    }
}

impl FailoverConfig {
    /// Validate the configuration and build the bidirectional mapping.
    ///
    /// Returns every human-readable problem found; an empty mapping is only
    /// an error when failover is enabled.
    pub fn validate(&self) -> Result<ServerMappings, Vec<String>> {
        let mut errors = Vec::new();

        if self.enabled {
            if self.health_url_a.trim().is_empty() {
                errors.push("Health URL A is required when failover is enabled".to_string());
            }
            if self.health_url_b.trim().is_empty() {
                errors.push("Health URL B is required when failover is enabled".to_string());
            }
            if self.check_interval_seconds <= 0 {
                errors.push("Check interval must be greater than 0".to_string());
            }
            if self.timeout_seconds <= 0 {
                errors.push("Timeout must be greater than 0".to_string());
            }
            if self.server_mappings.is_empty() {
                errors.push("At least one server mapping is required".to_string());
            }
        }

        match ServerMappings::from_pairs(&self.server_mappings) {
            Ok(mappings) if errors.is_empty() => Ok(mappings),
            Ok(_) => Err(errors),
            Err(mapping_errors) => {
                errors.extend(mapping_errors);
                Err(errors)
            }
        }
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.validate().err().unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1) as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }
}

/// Failover state reported by `GET /failover-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct FailoverStatus {
    pub enabled: bool,
    pub currently_failed_over: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status_a: Option<HealthStatus>,
    pub health_status_b: Option<HealthStatus>,
    /// Rules currently present on the host
    pub rules_managed: usize,
    pub last_failover_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub check_interval_seconds: i64,
    #[serde(default)]
    pub consecutive_failures_a: u32,
    #[serde(default)]
    pub consecutive_failures_b: u32,
}
