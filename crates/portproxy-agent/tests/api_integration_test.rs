//! Router-level tests for the agent HTTP surface

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use portproxy_agent::{build_router, Agent, AgentConfig, HttpHealthProbe, MemoryRuleStore, RuleStoreKind};
use portproxy_auth::MessageCodec;
use portproxy_proto::{Command, Envelope, FailoverStatus, PingResponse, Protocol, Response, Rule};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";

struct TestAgent {
    _dir: TempDir,
    store: MemoryRuleStore,
    router: Router,
}

fn test_agent(rules: Vec<Rule>) -> TestAgent {
    let dir = TempDir::new().unwrap();
    let mut config = AgentConfig::new(SECRET);
    config.agent_name = "test-agent".to_string();
    config.port = 18080;
    config.rule_store = RuleStoreKind::Memory;
    config.state_file = dir.path().join("failover_config.json");

    let store = MemoryRuleStore::with_rules(rules);
    let agent = Agent::with_components(config, Arc::new(store.clone()), Arc::new(HttpHealthProbe::new()))
        .unwrap();

    TestAgent {
        _dir: dir,
        store,
        router: build_router(agent.state()),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn execute(router: &Router, codec: &MessageCodec, command: &Command) -> (StatusCode, Option<Response>) {
    let envelope = codec.seal(&serde_json::to_string(command).unwrap()).unwrap();
    let (status, body) = send(router, post_json("/api/agent/execute", &serde_json::to_value(&envelope).unwrap())).await;
    if status != StatusCode::OK {
        return (status, None);
    }
    let sealed: Envelope = serde_json::from_value(body).unwrap();
    let response = serde_json::from_str(&codec.open(&sealed).unwrap()).unwrap();
    (status, Some(response))
}

#[tokio::test]
async fn test_execute_add_then_list() {
    let agent = test_agent(Vec::new());
    let codec = MessageCodec::new(SECRET);
    let rule = Rule::new("0.0.0.0", 1813, "192.168.1.5", 1813, Protocol::V4ToV4);

    let (status, response) = execute(&agent.router, &codec, &Command::add(&rule, "radius")).await;
    assert_eq!(status, StatusCode::OK);
    let response = response.unwrap();
    assert!(response.success);
    assert_eq!(response.message, "Successfully added rule: 0.0.0.0:1813 -> 192.168.1.5:1813");

    let (_, response) = execute(&agent.router, &codec, &Command::list()).await;
    let response = response.unwrap();
    assert_eq!(response.message, "Found 1 port proxy rules");
    assert_eq!(response.rules, vec![rule]);
    assert_eq!(agent.store.rules().len(), 1);
}

#[tokio::test]
async fn test_execute_with_wrong_secret_is_401() {
    let agent = test_agent(Vec::new());
    let intruder = MessageCodec::new("wrong-secret");

    let (status, response) = execute(&agent.router, &intruder, &Command::reset()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(response.is_none());
}

#[tokio::test]
async fn test_execute_with_tampered_envelope_is_401() {
    let agent = test_agent(Vec::new());
    let codec = MessageCodec::new(SECRET);
    let mut envelope = codec.seal(&serde_json::to_string(&Command::list()).unwrap()).unwrap();
    envelope.timestamp = envelope.timestamp.replace('Z', "+00:00");

    let (status, body) = send(&agent.router, post_json("/api/agent/execute", &serde_json::to_value(&envelope).unwrap())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid message authentication");
}

#[tokio::test]
async fn test_ping_and_status() {
    let agent = test_agent(vec![Rule::new("0.0.0.0", 80, "10.0.0.1", 80, Protocol::V4ToV4)]);

    let (status, body) = send(&agent.router, get("/api/agent/ping")).await;
    assert_eq!(status, StatusCode::OK);
    let ping: PingResponse = serde_json::from_value(body).unwrap();
    assert_eq!(ping.message, "Pong");
    assert_eq!(ping.agent_name, "test-agent");
    assert_eq!(ping.port, 18080);
    assert_eq!(ping.max_rules, 100);

    let (status, body) = send(&agent.router, get("/api/agent/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isOnline"], true);
    assert_eq!(body["activeRulesCount"], 1);
}

#[tokio::test]
async fn test_configure_failover_validation_errors() {
    let agent = test_agent(Vec::new());
    let body = json!({
        "enabled": true,
        "healthUrlA": "",
        "healthUrlB": "http://b.invalid/health",
        "checkIntervalSeconds": 30,
        "timeoutSeconds": 10,
        "serverMappings": {"10.0.0.1": "10.0.0.2"}
    });

    let (status, body) = send(&agent.router, post_json("/api/agent/configure-failover", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"], json!(["Health URL A is required when failover is enabled"]));

    let (_, body) = send(&agent.router, get("/api/agent/failover-status")).await;
    let status: FailoverStatus = serde_json::from_value(body).unwrap();
    assert!(!status.enabled);
}

#[tokio::test]
async fn test_configure_and_manual_failover() {
    let agent = test_agent(vec![Rule::new("0.0.0.0", 80, "10.0.0.1", 80, Protocol::V4ToV4)]);
    let body = json!({
        "enabled": true,
        "healthUrlA": "http://127.0.0.1:1/health",
        "healthUrlB": "http://127.0.0.1:1/health",
        "checkIntervalSeconds": 3600,
        "timeoutSeconds": 1,
        "serverMappings": {"10.0.0.1": "10.0.0.2"}
    });

    let (status, body) = send(&agent.router, post_json("/api/agent/configure-failover", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Failover configuration applied successfully");

    let (status, body) = send(&agent.router, post_json("/api/agent/manual-failover", &json!(true))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rulesProcessed"], 1);
    assert_eq!(body["rulesChanged"], 1);
    assert_eq!(body["rulesLost"], 0);
    assert_eq!(agent.store.rules()[0].connect_address, "10.0.0.2");

    let (_, body) = send(&agent.router, get("/api/agent/failover-status")).await;
    assert_eq!(body["currentlyFailedOver"], true);
    assert_eq!(body["rulesManaged"], 1);
    assert!(body["lastFailoverTime"].is_string());
}

#[tokio::test]
async fn test_manual_failover_when_disabled_is_500() {
    let agent = test_agent(vec![Rule::new("0.0.0.0", 80, "10.0.0.1", 80, Protocol::V4ToV4)]);

    let (status, body) = send(&agent.router, post_json("/api/agent/manual-failover", &json!(true))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "FAILOVER_DISABLED");
    assert_eq!(agent.store.rules()[0].connect_address, "10.0.0.1");
}

#[tokio::test]
async fn test_health_and_openapi() {
    let agent = test_agent(Vec::new());

    let (status, body) = send(&agent.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PortProxy Agent is running");
    assert_eq!(body["name"], "test-agent");

    let (status, body) = send(&agent.router, get("/api/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/agent/execute"].is_object());
}
