//! Client against a live agent on a loopback listener

use portproxy_agent::{Agent, AgentConfig, HttpHealthProbe, MemoryRuleStore, RuleStoreKind};
use portproxy_client::{AgentClient, ClientError};
use portproxy_proto::{FailoverConfig, Protocol, Rule};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "e2e-secret";

struct RunningAgent {
    _dir: TempDir,
    url: String,
    store: MemoryRuleStore,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), portproxy_agent::AgentError>>,
}

impl RunningAgent {
    async fn start(rules: Vec<Rule>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = AgentConfig::new(SECRET);
        config.agent_name = "e2e-agent".to_string();
        config.rule_store = RuleStoreKind::Memory;
        config.state_file = dir.path().join("failover_config.json");

        let store = MemoryRuleStore::with_rules(rules);
        let agent = Agent::with_components(
            config,
            Arc::new(store.clone()),
            Arc::new(HttpHealthProbe::new()),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(agent.run_with_listener(listener, shutdown.clone()));

        Self {
            _dir: dir,
            url,
            store,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_rule_lifecycle_over_http() {
    let agent = RunningAgent::start(Vec::new()).await;
    let client = AgentClient::new(&agent.url, SECRET).unwrap();

    let ping = client.ping().await.unwrap();
    assert_eq!(ping.message, "Pong");
    assert_eq!(ping.agent_name, "e2e-agent");

    let rule = Rule::new("0.0.0.0", 8443, "10.20.0.7", 443, Protocol::V4ToV4);
    let added = client.add_rule(&rule, "web").await.unwrap();
    assert!(added.success, "{}", added.message);

    let duplicate = client.add_rule(&rule, "web").await.unwrap();
    assert!(!duplicate.success);

    let listed = client.list_rules().await.unwrap();
    assert_eq!(listed.rules, vec![rule.clone()]);

    let status = client.status().await.unwrap();
    assert!(status.is_online);
    assert_eq!(status.active_rules_count, 1);

    let deleted = client
        .delete_rule("0.0.0.0", 8443, Protocol::V4ToV4)
        .await
        .unwrap();
    assert!(deleted.success);
    assert!(agent.store.rules().is_empty());

    let reset = client.reset_rules().await.unwrap();
    assert!(reset.success);

    agent.stop().await;
}

#[tokio::test]
async fn test_wrong_secret_is_unauthorized() {
    let agent = RunningAgent::start(Vec::new()).await;
    let client = AgentClient::new(&agent.url, "not-the-secret").unwrap();

    let err = client.list_rules().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized), "{err:?}");

    agent.stop().await;
}

#[tokio::test]
async fn test_failover_round_trip() {
    let agent = RunningAgent::start(vec![Rule::new(
        "0.0.0.0",
        1812,
        "10.0.0.1",
        1812,
        Protocol::V4ToV4,
    )])
    .await;
    let client = AgentClient::new(&agent.url, SECRET).unwrap();

    let invalid = FailoverConfig {
        enabled: true,
        ..FailoverConfig::default()
    };
    match client.configure_failover(&invalid).await.unwrap_err() {
        ClientError::Validation(errors) => {
            assert!(errors.contains(&"At least one server mapping is required".to_string()))
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let config = FailoverConfig {
        enabled: true,
        health_url_a: format!("{}/health", agent.url),
        health_url_b: format!("{}/health", agent.url),
        check_interval_seconds: 3600,
        timeout_seconds: 2,
        server_mappings: BTreeMap::from([("10.0.0.1".to_string(), "10.0.0.2".to_string())]),
        ..FailoverConfig::default()
    };
    client.configure_failover(&config).await.unwrap();

    let outcome = client.manual_failover(true).await.unwrap();
    assert_eq!(outcome.rules_changed, 1);
    assert_eq!(agent.store.rules()[0].connect_address, "10.0.0.2");

    let status = client.failover_status().await.unwrap();
    assert!(status.enabled);
    assert!(status.currently_failed_over);

    let outcome = client.manual_failover(false).await.unwrap();
    assert_eq!(outcome.rules_changed, 1);
    assert_eq!(agent.store.rules()[0].connect_address, "10.0.0.1");

    agent.stop().await;
}
