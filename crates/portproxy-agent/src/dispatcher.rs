//! Turns a verified envelope into a rule store operation and a sealed response

use portproxy_auth::{CodecError, MessageCodec};
use portproxy_proto::{Command, CommandVerb, Envelope, Response};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::rule_store::RuleStore;

/// Correlation id used when the command itself could not be read
pub const UNPARSED_COMMAND_ID: &str = "error";

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Envelope failed authentication; maps to 401
    #[error("Message authentication failed")]
    Unauthorized,

    /// Response could not be sealed; maps to 500
    #[error("Failed to encrypt response: {0}")]
    Encrypt(String),
}

/// Executes encrypted commands against a [`RuleStore`]
#[derive(Clone)]
pub struct CommandDispatcher {
    codec: MessageCodec,
    store: Arc<dyn RuleStore>,
}

impl CommandDispatcher {
    pub fn new(codec: MessageCodec, store: Arc<dyn RuleStore>) -> Self {
        Self { codec, store }
    }

    /// Verify, execute and answer one envelope.
    ///
    /// Only authentication and response sealing fail the call; everything
    /// else is reported inside the sealed [`Response`].
    pub async fn handle(&self, envelope: &Envelope) -> Result<Envelope, DispatchError> {
        let response = match self.codec.open(envelope) {
            Ok(plaintext) => self.execute_plaintext(&plaintext).await,
            Err(CodecError::Unauthorized(reason)) => {
                // The reason stays in the log, never in the reply
                warn!(%reason, "Rejected command envelope");
                return Err(DispatchError::Unauthorized);
            }
            Err(e) => {
                warn!(error = %e, "Authenticated envelope could not be decrypted");
                Response::failure(UNPARSED_COMMAND_ID, e.to_string())
            }
        };

        self.codec.seal(&serialize_response(&response)?).map_err(|e| {
            error!(error = %e, "Failed to seal response");
            DispatchError::Encrypt(e.to_string())
        })
    }

    async fn execute_plaintext(&self, plaintext: &str) -> Response {
        match serde_json::from_str::<Command>(plaintext) {
            Ok(command) => self.execute(&command).await,
            Err(e) => {
                warn!(error = %e, "Failed to parse command");
                Response::failure(UNPARSED_COMMAND_ID, format!("Invalid command: {}", e))
            }
        }
    }

    /// Execute an already decrypted command
    pub async fn execute(&self, command: &Command) -> Response {
        let id = command.command_id.as_str();
        let verb = match command.verb() {
            Ok(verb) => verb,
            Err(e) => {
                warn!(command_id = id, verb = %command.verb, "Unknown command");
                return Response::failure(id, e.to_string());
            }
        };

        info!(command_id = id, %verb, description = %command.description, "Executing command");

        match verb {
            CommandVerb::Add => self.add(command).await,
            CommandVerb::Delete => self.delete(command).await,
            CommandVerb::List => self.list(command).await,
            CommandVerb::Reset => self.reset(command).await,
        }
    }

    async fn add(&self, command: &Command) -> Response {
        let id = command.command_id.as_str();
        let rule = match command.rule() {
            Ok(rule) => rule,
            Err(e) => return Response::failure(id, format!("Failed to add rule: {}", e)),
        };

        match self.store.add(&rule).await {
            Ok(out) if out.success => Response::success(
                id,
                format!(
                    "Successfully added rule: {}:{} -> {}:{}",
                    rule.listen_address, rule.listen_port, rule.connect_address, rule.connect_port
                ),
            )
            .with_output(out.output),
            Ok(out) => Response::failure(id, format!("Failed to add rule: {}", out.error_text()))
                .with_output(out.output),
            Err(e) => {
                error!(error = %e, "Rule store failed while adding rule");
                Response::failure(id, format!("Failed to add rule: {}", e))
            }
        }
    }

    async fn delete(&self, command: &Command) -> Response {
        let id = command.command_id.as_str();
        let target = command
            .listen_endpoint()
            .and_then(|endpoint| Ok((endpoint, command.protocol()?)));
        let ((address, port), protocol) = match target {
            Ok(target) => target,
            Err(e) => return Response::failure(id, format!("Failed to delete rule: {}", e)),
        };

        match self.store.delete(&address, port, protocol).await {
            Ok(out) if out.success => {
                Response::success(id, format!("Successfully deleted rule: {}:{}", address, port))
                    .with_output(out.output)
            }
            Ok(out) => Response::failure(id, format!("Failed to delete rule: {}", out.error_text()))
                .with_output(out.output),
            Err(e) => {
                error!(error = %e, "Rule store failed while deleting rule");
                Response::failure(id, format!("Failed to delete rule: {}", e))
            }
        }
    }

    async fn list(&self, command: &Command) -> Response {
        let id = command.command_id.as_str();
        match self.store.list().await {
            Ok(snapshot) if snapshot.success => {
                debug!(count = snapshot.rules.len(), "Listed rules");
                Response::success(id, format!("Found {} port proxy rules", snapshot.rules.len()))
                    .with_output(snapshot.output)
                    .with_rules(snapshot.rules)
            }
            Ok(snapshot) => {
                let message = format!("Failed to list rules: {}", snapshot.error_text());
                Response::failure(id, message).with_output(snapshot.output)
            }
            Err(e) => {
                error!(error = %e, "Rule store failed while listing rules");
                Response::failure(id, format!("Failed to list rules: {}", e))
            }
        }
    }

    async fn reset(&self, command: &Command) -> Response {
        let id = command.command_id.as_str();
        match self.store.reset().await {
            Ok(out) if out.success => {
                Response::success(id, "Successfully reset all port proxy rules").with_output(out.output)
            }
            Ok(out) => Response::failure(id, format!("Failed to reset rules: {}", out.error_text()))
                .with_output(out.output),
            Err(e) => {
                error!(error = %e, "Rule store failed while resetting rules");
                Response::failure(id, format!("Failed to reset rules: {}", e))
            }
        }
    }
}

fn serialize_response(response: &Response) -> Result<String, DispatchError> {
    serde_json::to_string(response).map_err(|e| DispatchError::Encrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_store::{MockRuleStore, RuleSnapshot, RuleStoreError, ToolOutput};
    use portproxy_proto::{Protocol, Rule};

    const SECRET: &str = "dispatcher-secret";

    fn dispatcher(store: MockRuleStore) -> (CommandDispatcher, MessageCodec) {
        let codec = MessageCodec::new(SECRET);
        (CommandDispatcher::new(codec.clone(), Arc::new(store)), codec)
    }

    async fn roundtrip(store: MockRuleStore, command: &Command) -> Response {
        let (dispatcher, codec) = dispatcher(store);
        let envelope = codec.seal(&serde_json::to_string(command).unwrap()).unwrap();
        let sealed = dispatcher.handle(&envelope).await.unwrap();
        serde_json::from_str(&codec.open(&sealed).unwrap()).unwrap()
    }

    fn web_rule() -> Rule {
        Rule::new("0.0.0.0", 8080, "10.0.0.1", 80, Protocol::V4ToV4)
    }

    #[tokio::test]
    async fn test_add_success() {
        let mut store = MockRuleStore::new();
        store
            .expect_add()
            .withf(|rule| *rule == web_rule())
            .times(1)
            .returning(|_| Ok(ToolOutput::ok("Ok.")));

        let command = Command::add(&web_rule(), "web");
        let response = roundtrip(store, &command).await;
        assert!(response.success);
        assert_eq!(response.command_id, command.command_id);
        assert_eq!(response.message, "Successfully added rule: 0.0.0.0:8080 -> 10.0.0.1:80");
        assert_eq!(response.output, "Ok.");
    }

    #[tokio::test]
    async fn test_add_tool_error() {
        let mut store = MockRuleStore::new();
        store
            .expect_add()
            .returning(|_| Ok(ToolOutput::failed("", "The object already exists.")));

        let response = roundtrip(store, &Command::add(&web_rule(), "")).await;
        assert!(!response.success);
        assert_eq!(response.message, "Failed to add rule: The object already exists.");
    }

    #[tokio::test]
    async fn test_add_with_invalid_port_never_reaches_store() {
        let mut store = MockRuleStore::new();
        store.expect_add().never();

        let mut command = Command::add(&web_rule(), "");
        command.connect_port = "http".to_string();
        let response = roundtrip(store, &command).await;
        assert!(!response.success);
        assert!(response.message.starts_with("Failed to add rule: Invalid connectPort"));
    }

    #[tokio::test]
    async fn test_delete_success() {
        let mut store = MockRuleStore::new();
        store
            .expect_delete()
            .withf(|address, port, protocol| {
                address == "0.0.0.0" && *port == 8080 && *protocol == Protocol::V4ToV4
            })
            .times(1)
            .returning(|_, _, _| Ok(ToolOutput::ok("")));

        let response = roundtrip(store, &Command::delete("0.0.0.0", 8080, Protocol::V4ToV4)).await;
        assert!(response.success);
        assert_eq!(response.message, "Successfully deleted rule: 0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_list_returns_rules() {
        let mut store = MockRuleStore::new();
        store.expect_list().returning(|| {
            Ok(RuleSnapshot {
                success: true,
                rules: vec![web_rule()],
                output: "raw".to_string(),
                error: String::new(),
            })
        });

        let response = roundtrip(store, &Command::list()).await;
        assert!(response.success);
        assert_eq!(response.message, "Found 1 port proxy rules");
        assert_eq!(response.rules, vec![web_rule()]);
        assert_eq!(response.output, "raw");
    }

    #[tokio::test]
    async fn test_reset_store_error_is_reported() {
        let mut store = MockRuleStore::new();
        store.expect_reset().returning(|| {
            Err(RuleStoreError::Spawn {
                tool: "netsh".to_string(),
                reason: "not found".to_string(),
            })
        });

        let response = roundtrip(store, &Command::reset()).await;
        assert!(!response.success);
        assert_eq!(
            response.message,
            "Failed to reset rules: Failed to start netsh: not found"
        );
    }

    #[tokio::test]
    async fn test_unknown_verb() {
        let mut command = Command::list();
        command.verb = "frobnicate".to_string();
        let response = roundtrip(MockRuleStore::new(), &command).await;
        assert!(!response.success);
        assert_eq!(response.message, "Unknown command: frobnicate");
        assert_eq!(response.command_id, command.command_id);
    }

    #[tokio::test]
    async fn test_unparseable_command_uses_error_id() {
        let (dispatcher, codec) = dispatcher(MockRuleStore::new());
        let envelope = codec.seal("this is not json").unwrap();
        let sealed = dispatcher.handle(&envelope).await.unwrap();
        let response: Response = serde_json::from_str(&codec.open(&sealed).unwrap()).unwrap();
        assert!(!response.success);
        assert_eq!(response.command_id, UNPARSED_COMMAND_ID);
        assert!(response.message.starts_with("Invalid command"));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized() {
        let (dispatcher, _) = dispatcher(MockRuleStore::new());
        let envelope = MessageCodec::new("intruder")
            .seal(&serde_json::to_string(&Command::list()).unwrap())
            .unwrap();
        let err = dispatcher.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized));
    }
}
