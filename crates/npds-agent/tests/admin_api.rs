#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

use npds_agent::app_state::AppState;
use npds_agent::config;
use npds_agent::obs::AgentMetrics;
use npds_agent::router::build_router;
use npds_agent::store::PolicyStore;
use npds_core::model::{NetworkPolicy, ValidationLimits};
use npds_core::proto::{self, header_matcher::HeaderMatchSpecifier, port_network_policy_rule::L7Rules, SocketProtocol};

fn web_filter() -> NetworkPolicy {
    let get_only = proto::HttpNetworkPolicyRules {
        http_rules: vec![proto::HttpNetworkPolicyRule {
            headers: vec![proto::HeaderMatcher {
                name: ":method".into(),
                header_match_specifier: Some(HeaderMatchSpecifier::ExactMatch("GET".into())),
                case_insensitive: false,
            }],
        }],
    };
    NetworkPolicy::from_wire(
        proto::NetworkPolicy {
            name: "web".into(),
            policy: 1,
            ingress: Some(proto::DirectionNetworkPolicy {
                per_port_policies: vec![
                    proto::PortNetworkPolicy {
                        port: 80,
                        protocol: SocketProtocol::Tcp as i32,
                        rules: vec![proto::PortNetworkPolicyRule {
                            remote_policies: vec![10],
                            l7_rules: Some(L7Rules::HttpRules(get_only)),
                        }],
                    },
                    proto::PortNetworkPolicy {
                        port: 53,
                        protocol: SocketProtocol::Udp as i32,
                        rules: vec![proto::PortNetworkPolicyRule {
                            remote_policies: vec![20],
                            l7_rules: None,
                        }],
                    },
                ],
            }),
            egress: None,
        },
        &ValidationLimits::default(),
    )
    .unwrap()
}

fn app(enforcement: &str) -> (Router, PolicyStore, Arc<AgentMetrics>) {
    let cfg = config::load_from_str(&format!("version: 1\nnode_id: test\nenforcement: {enforcement}\n")).unwrap();
    let store = PolicyStore::new();
    let metrics = Arc::new(AgentMetrics::default());
    let state = AppState::new(&cfg, store.clone(), Arc::clone(&metrics), None);
    (build_router(state), store, metrics)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    let resp = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn delete(app: &Router, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .clone()
        .oneshot(Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn evaluate(app: &Router, body: Value) -> (StatusCode, Value) {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/evaluate")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn healthz_and_readiness() {
    let (app, store, _) = app("default");

    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, _) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    store.replace("1", vec![]);
    let (status, _) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn policies_summary() {
    let (app, store, _) = app("default");
    store.replace("42", vec![web_filter()]);

    let (status, body) = get(&app, "/v1/policies").await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["revision"], 1);
    assert_eq!(v["version"], "42");
    let filter = &v["filters"][0];
    assert_eq!(filter["name"], "web");
    assert_eq!(filter["policy"], 1);
    assert!(filter.get("egress").is_none());
    let ports = filter["ingress"].as_array().unwrap();
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().any(|p| p["port"] == 80 && p["protocol"] == "tcp" && p["l7"] == true));
    assert!(ports.iter().any(|p| p["port"] == 53 && p["protocol"] == "udp" && p["l7"] == false));
}

#[tokio::test]
async fn evaluate_decisions() {
    let (app, store, metrics) = app("default");
    store.replace("1", vec![web_filter()]);

    let base = json!({
        "direction": "ingress",
        "local_policy": 1,
        "port": 80,
        "protocol": "tcp",
        "remote_policy": 10,
        "http": { "method": "GET", "path": "/", "authority": "svc", "headers": {} }
    });
    let (status, v) = evaluate(&app, base.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["decision"], "allow");

    let mut post = base.clone();
    post["http"]["method"] = json!("POST");
    assert_eq!(evaluate(&app, post).await.1["decision"], "deny");

    let mut no_http = base.clone();
    no_http.as_object_mut().unwrap().remove("http");
    assert_eq!(evaluate(&app, no_http).await.1["decision"], "deny");

    let dns = json!({
        "direction": "ingress",
        "local_policy": 1,
        "port": 53,
        "protocol": "udp",
        "remote_policy": 20
    });
    assert_eq!(evaluate(&app, dns).await.1["decision"], "allow");

    let egress = json!({
        "direction": "egress",
        "local_policy": 1,
        "port": 443,
        "protocol": "tcp",
        "remote_policy": 99
    });
    assert_eq!(evaluate(&app, egress).await.1["decision"], "allow");

    assert_eq!(metrics.evaluations.get(&[("decision", "allow")]), 3);
    assert_eq!(metrics.evaluations.get(&[("decision", "deny")]), 2);
}

#[tokio::test]
async fn enforcement_always_denies_endpoints_without_filters() {
    let (app, store, _) = app("always");
    store.replace("1", vec![web_filter()]);

    let unknown_endpoint = json!({
        "direction": "egress",
        "local_policy": 77,
        "port": 443,
        "protocol": "tcp",
        "remote_policy": 1
    });
    assert_eq!(evaluate(&app, unknown_endpoint).await.1["decision"], "deny");
}

#[tokio::test]
async fn invalid_flows_are_rejected() {
    let (app, _, metrics) = app("default");

    let missing_port = json!({
        "direction": "ingress",
        "local_policy": 1,
        "protocol": "tcp",
        "remote_policy": 10
    });
    let (status, v) = evaluate(&app, missing_port).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["code"], "INVALID_FLOW");

    let port_out_of_range = json!({
        "direction": "ingress",
        "local_policy": 1,
        "port": 70000,
        "protocol": "tcp",
        "remote_policy": 10
    });
    assert_eq!(evaluate(&app, port_out_of_range).await.1["code"], "INVALID_FLOW");

    let unknown_field = json!({ "direction": "ingress", "colour": "blue" });
    assert_eq!(evaluate(&app, unknown_field).await.1["code"], "INVALID_FLOW");

    assert_eq!(metrics.evaluations.get(&[("decision", "invalid")]), 3);
}

#[tokio::test]
async fn metrics_exposition() {
    let (app, store, _) = app("default");
    store.replace("1", vec![web_filter()]);
    evaluate(
        &app,
        json!({
            "direction": "ingress",
            "local_policy": 1,
            "port": 53,
            "protocol": "udp",
            "remote_policy": 20
        }),
    )
    .await;

    let (status, body) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("npds_evaluations_total{decision=\"allow\"} 1"));
    assert!(body.contains("npds_evaluate_duration_micros_count 1"));
}

#[tokio::test]
async fn single_policy_lookup() {
    let (app, store, _) = app("default");
    store.replace("3", vec![web_filter()]);

    let (status, body) = get(&app, "/v1/policies/web").await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["name"], "web");
    assert_eq!(v["policy"], 1);
    assert_eq!(v["ingress"].as_array().unwrap().len(), 2);

    let (status, body) = get(&app, "/v1/policies/db").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["code"], "NOT_FOUND");
}

#[tokio::test]
async fn withdraw_policy_removes_it_from_the_active_set() {
    let (app, store, metrics) = app("default");
    store.replace("3", vec![web_filter()]);

    let (status, v) = delete(&app, "/v1/policies/web").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["revision"], 2);
    assert_eq!(v["version_info"], "3");
    assert_eq!(v["removed"], json!(["web"]));
    assert_eq!(v["added"], json!([]));

    assert!(store.snapshot().set().get("web").is_none());
    assert_eq!(get(&app, "/v1/policies/web").await.0, StatusCode::NOT_FOUND);
    assert_eq!(metrics.policies_active.get(&[]), 0);

    let dns = json!({
        "direction": "ingress",
        "local_policy": 1,
        "port": 53,
        "protocol": "udp",
        "remote_policy": 20
    });
    assert_eq!(evaluate(&app, dns).await.1["decision"], "allow");

    let (status, v) = delete(&app, "/v1/policies/web").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["code"], "NOT_FOUND");
    assert_eq!(store.snapshot().revision(), 2);
}

async fn next_text<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("watch message timed out")
            .expect("watch stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn watch_streams_snapshot_then_changes() {
    let (app, store, _) = app("default");
    store.replace("1", vec![web_filter()]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/watch")).await.unwrap();

    let hello = next_text(&mut ws).await;
    assert_eq!(hello["type"], "snapshot");
    assert_eq!(hello["revision"], 1);
    assert_eq!(hello["version"], "1");

    store.replace("2", vec![]);
    let change = next_text(&mut ws).await;
    assert_eq!(change["type"], "change");
    assert_eq!(change["revision"], 2);
    assert_eq!(change["version"], "2");
    assert_eq!(change["added"], json!([]));
    assert_eq!(change["removed"], json!(["web"]));

    store.withdraw("web");
    store.replace("3", vec![web_filter()]);
    let change = next_text(&mut ws).await;
    assert_eq!(change["revision"], 3);
    assert_eq!(change["added"], json!(["web"]));

    server.abort();
}
