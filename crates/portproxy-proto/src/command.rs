//! Rule-management commands, responses and rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while interpreting a decrypted command
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Unknown command: {0}")]
    UnknownVerb(String),

    #[error("Unknown protocol '{0}' (expected v4tov4, v4tov6, v6tov4 or v6tov6)")]
    UnknownProtocol(String),

    #[error("Invalid {field} '{value}': expected a port number between 1 and 65535")]
    InvalidPort { field: &'static str, value: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Operation requested by a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandVerb {
    Add,
    Delete,
    List,
    Reset,
}

impl CommandVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandVerb::Add => "add",
            CommandVerb::Delete => "delete",
            CommandVerb::List => "list",
            CommandVerb::Reset => "reset",
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandVerb {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(CommandVerb::Add),
            "delete" => Ok(CommandVerb::Delete),
            "list" => Ok(CommandVerb::List),
            "reset" => Ok(CommandVerb::Reset),
            _ => Err(ProtoError::UnknownVerb(s.to_string())),
        }
    }
}

/// Address families of a rule's listen and connect endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Protocol {
    #[default]
    #[serde(rename = "v4tov4")]
    V4ToV4,
    #[serde(rename = "v4tov6")]
    V4ToV6,
    #[serde(rename = "v6tov4")]
    V6ToV4,
    #[serde(rename = "v6tov6")]
    V6ToV6,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::V4ToV4,
        Protocol::V4ToV6,
        Protocol::V6ToV4,
        Protocol::V6ToV6,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::V4ToV4 => "v4tov4",
            Protocol::V4ToV6 => "v4tov6",
            Protocol::V6ToV4 => "v6tov4",
            Protocol::V6ToV6 => "v6tov6",
        }
    }

    /// Build a protocol from the listen and connect address families
    pub fn from_families(listen_v6: bool, connect_v6: bool) -> Self {
        match (listen_v6, connect_v6) {
            (false, false) => Protocol::V4ToV4,
            (false, true) => Protocol::V4ToV6,
            (true, false) => Protocol::V6ToV4,
            (true, true) => Protocol::V6ToV6,
        }
    }

    pub fn listen_is_v6(&self) -> bool {
        matches!(self, Protocol::V6ToV4 | Protocol::V6ToV6)
    }

    pub fn connect_is_v6(&self) -> bool {
        matches!(self, Protocol::V4ToV6 | Protocol::V6ToV6)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| ProtoError::UnknownProtocol(s.to_string()))
    }
}

/// A single port-forwarding rule as reported by the host tool.
///
/// Identity is `(listen_address, listen_port)`; the connect endpoint and the
/// protocol are payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub listen_address: String,
    #[serde(with = "port_text")]
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub listen_port: u16,
    pub connect_address: String,
    #[serde(with = "port_text")]
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub connect_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Rule {
    pub fn new(
        listen_address: impl Into<String>,
        listen_port: u16,
        connect_address: impl Into<String>,
        connect_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            listen_port,
            connect_address: connect_address.into(),
            connect_port,
            protocol,
        }
    }

    /// Whether `other` occupies the same listen endpoint
    pub fn same_listener(&self, other: &Rule) -> bool {
        self.listen_address == other.listen_address && self.listen_port == other.listen_port
    }

    /// Copy of this rule pointing at a different connect address
    pub fn retargeted(&self, connect_address: impl Into<String>) -> Self {
        Self {
            connect_address: connect_address.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.listen_address,
            self.listen_port,
            self.connect_address,
            self.connect_port,
            self.protocol
        )
    }
}

/// Command sent by the console inside an encrypted envelope.
///
/// Fields mirror the wire format: ports travel as text and the verb is a
/// free-form string so that unknown verbs can be reported back instead of
/// failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(rename = "command")]
    pub verb: String,
    #[serde(default)]
    pub listen_port: String,
    #[serde(default)]
    pub listen_address: String,
    #[serde(default)]
    pub connect_port: String,
    #[serde(default)]
    pub connect_address: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "new_command_id")]
    pub command_id: String,
}

fn default_protocol() -> String {
    Protocol::default().to_string()
}

fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Command {
    pub fn new(verb: CommandVerb) -> Self {
        Self {
            verb: verb.to_string(),
            listen_port: String::new(),
            listen_address: String::new(),
            connect_port: String::new(),
            connect_address: String::new(),
            protocol: default_protocol(),
            description: String::new(),
            command_id: new_command_id(),
        }
    }

    pub fn add(rule: &Rule, description: impl Into<String>) -> Self {
        Self {
            listen_port: rule.listen_port.to_string(),
            listen_address: rule.listen_address.clone(),
            connect_port: rule.connect_port.to_string(),
            connect_address: rule.connect_address.clone(),
            protocol: rule.protocol.to_string(),
            description: description.into(),
            ..Self::new(CommandVerb::Add)
        }
    }

    pub fn delete(listen_address: impl Into<String>, listen_port: u16, protocol: Protocol) -> Self {
        Self {
            listen_port: listen_port.to_string(),
            listen_address: listen_address.into(),
            protocol: protocol.to_string(),
            ..Self::new(CommandVerb::Delete)
        }
    }

    pub fn list() -> Self {
        Self::new(CommandVerb::List)
    }

    pub fn reset() -> Self {
        Self {
            description: "Reset all port forwarding rules".to_string(),
            ..Self::new(CommandVerb::Reset)
        }
    }

    pub fn verb(&self) -> Result<CommandVerb, ProtoError> {
        self.verb.parse()
    }

    /// Protocol of the command; an empty field means the default `v4tov4`
    pub fn protocol(&self) -> Result<Protocol, ProtoError> {
        if self.protocol.trim().is_empty() {
            return Ok(Protocol::default());
        }
        self.protocol.parse()
    }

    /// The `(listen_address, listen_port)` identity targeted by this command
    pub fn listen_endpoint(&self) -> Result<(String, u16), ProtoError> {
        let address = self.listen_address.trim();
        if address.is_empty() {
            return Err(ProtoError::MissingField("listenAddress"));
        }
        let port = parse_port("listenPort", &self.listen_port)?;
        Ok((address.to_string(), port))
    }

    /// Full rule described by an `add` command
    pub fn rule(&self) -> Result<Rule, ProtoError> {
        let (listen_address, listen_port) = self.listen_endpoint()?;
        let connect_address = self.connect_address.trim();
        if connect_address.is_empty() {
            return Err(ProtoError::MissingField("connectAddress"));
        }
        let connect_port = parse_port("connectPort", &self.connect_port)?;

        Ok(Rule {
            listen_address,
            listen_port,
            connect_address: connect_address.to_string(),
            connect_port,
            protocol: self.protocol()?,
        })
    }
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, ProtoError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProtoError::InvalidPort {
            field,
            value: value.to_string(),
        }),
    }
}

/// Result of a command, returned encrypted to the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Raw output of the host tool
    #[serde(default)]
    pub output: String,
    /// Current rules, populated by `list`
    #[serde(default)]
    pub rules: Vec<Rule>,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn success(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            message: message.into(),
            output: String::new(),
            rules: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(command_id, message)
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }
}

/// Ports are exchanged as text; numbers are accepted on input as well.
mod port_text {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(port)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        match PortRepr::deserialize(deserializer)? {
            PortRepr::Number(port) => Ok(port),
            PortRepr::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| de::Error::custom(format!("invalid port '{}'", text))),
        }
    }
}
