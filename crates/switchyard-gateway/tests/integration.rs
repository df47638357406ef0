//! Gateway integration tests: start a real gateway and talk to it over HTTP.
//!
//! Run with: `cargo test -p switchyard-gateway --test integration`

use std::sync::Arc;

use serde_json::{Value, json};

use switchyard_agent::{AgentEvent, Orchestrator, TurnOutcome};
use switchyard_core::config::Config;
use switchyard_core::error::{BackendError, ErrorKind};
use switchyard_gateway::{GatewayState, TURN_ID_HEADER, USER_HEADER};
use switchyard_metering::{MemoryUsageStore, UsageMeter, UsageStore};
use switchyard_providers::mock::{MockProvider, MockTurn};
use switchyard_providers::registry::ProviderRegistry;
use switchyard_tools::ToolRegistry;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config() -> Arc<Config> {
    let config = Config::parse(
        r#"{
            models: {
                providers: [{ id: "mock", kind: "mock" }],
                catalog: [{ id: "test-model", provider: "mock", pricing: { input_per_1k: 1.0 } }],
            },
        }"#,
    )
    .unwrap();
    Arc::new(config)
}

struct TestGateway {
    state: Arc<GatewayState>,
    base: String,
}

/// Build a gateway over a scripted backend and wait until it answers.
async fn start_test_gateway(script: Vec<MockTurn>, budget: Option<f64>) -> TestGateway {
    let port = find_free_port();

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(MockProvider::with_script("mock", script)));
    let store = Arc::new(MemoryUsageStore::new());
    store.set_budget("alice", budget).await.unwrap();
    let orchestrator = Orchestrator::new(
        config(),
        providers,
        ToolRegistry::new(),
        UsageMeter::new(store),
    );
    let state = Arc::new(GatewayState::new(Arc::new(orchestrator)));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = switchyard_gateway::start_gateway(state_clone, "127.0.0.1", port).await;
    });

    let base = format!("http://127.0.0.1:{port}");
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if reqwest::get(format!("{base}/health")).await.is_ok() {
            break;
        }
    }

    TestGateway { state, base }
}

fn turn_body(text: &str) -> Value {
    json!({
        "messages": [{"role": "user", "content": [{"type": "text", "text": text}]}]
    })
}

fn parse_events(body: &str) -> Vec<AgentEvent> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway(vec![], None).await;
    let body: Value = reqwest::get(format!("{}/health", gw.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_turns"], 0);
    assert_eq!(body["providers"], json!(["mock"]));
}

#[tokio::test]
async fn test_stream_turn_as_ndjson() {
    let gw = start_test_gateway(vec![MockTurn::text("Hello from the stream")], None).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/turns", gw.base))
        .header(USER_HEADER, "alice")
        .json(&turn_body("Hi"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );
    let turn_id = response.headers()[TURN_ID_HEADER].to_str().unwrap().to_string();

    let events = parse_events(&response.text().await.unwrap());
    assert_eq!(
        events.first(),
        Some(&AgentEvent::TurnStart {
            turn_id: turn_id.clone()
        })
    );
    match events.last() {
        Some(AgentEvent::Done {
            turn_id: done_id,
            rounds,
            ..
        }) => {
            assert_eq!(done_id, &turn_id);
            assert_eq!(*rounds, 1);
        }
        other => panic!("unexpected last event: {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Stream { .. })));
}

#[tokio::test]
async fn test_missing_user_header_is_unauthorized() {
    let gw = start_test_gateway(vec![], None).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/turns", gw.base))
        .json(&turn_body("Hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "authorization");
}

#[tokio::test]
async fn test_exhausted_budget_is_payment_required() {
    let gw = start_test_gateway(vec![], Some(0.0)).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/turns", gw.base))
        .header(USER_HEADER, "alice")
        .json(&turn_body("Hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 402);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "quota_exceeded");
}

#[tokio::test]
async fn test_collect_turn() {
    let gw = start_test_gateway(vec![MockTurn::text("Collected")], Some(1.0)).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/turns:collect", gw.base))
        .header(USER_HEADER, "alice")
        .json(&turn_body("Hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let outcome: TurnOutcome = response.json().await.unwrap();
    assert_eq!(outcome.final_text(), "Collected");
    assert!((outcome.remaining.unwrap() - 0.99).abs() < 1e-9);

    let budget: Value = reqwest::Client::new()
        .get(format!("{}/v1/budget", gw.base))
        .header(USER_HEADER, "alice")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!((budget["remaining"].as_f64().unwrap() - 0.99).abs() < 1e-9);
}

#[tokio::test]
async fn test_collect_maps_backend_failure_to_status() {
    let gw = start_test_gateway(
        vec![MockTurn::Fail(BackendError::unavailable("HTTP 503: upstream"))],
        None,
    )
    .await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/turns:collect", gw.base))
        .header(USER_HEADER, "alice")
        .json(&turn_body("Hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "backend_unavailable");
    assert!(!body["message"].as_str().unwrap().contains("upstream"));
}

#[tokio::test]
async fn test_abort_running_turn() {
    let gw = start_test_gateway(vec![MockTurn::text("forever").without_metadata().hang()], None).await;
    let client = reqwest::Client::new();
    let mut body = turn_body("Hi");
    body["turn_id"] = json!("turn-to-abort");

    let mut response = client
        .post(format!("{}/v1/turns", gw.base))
        .header(USER_HEADER, "alice")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // Wait until the turn is producing output.
    let mut raw = response.chunk().await.unwrap().unwrap().to_vec();

    let other = client
        .post(format!("{}/v1/turns/turn-to-abort/abort", gw.base))
        .header(USER_HEADER, "mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 404);

    let abort = client
        .post(format!("{}/v1/turns/turn-to-abort/abort", gw.base))
        .header(USER_HEADER, "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(abort.status(), 202);

    while let Some(chunk) = response.chunk().await.unwrap() {
        raw.extend_from_slice(&chunk);
    }
    let events = parse_events(&String::from_utf8(raw).unwrap());

    let mut active = usize::MAX;
    for _ in 0..50 {
        active = gw.state.active_turns().await;
        if active == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(active, 0);
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Error {
            kind: ErrorKind::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_budget_for_unknown_user() {
    let gw = start_test_gateway(vec![], None).await;
    let response = reqwest::Client::new()
        .get(format!("{}/v1/budget", gw.base))
        .header(USER_HEADER, "nobody")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
