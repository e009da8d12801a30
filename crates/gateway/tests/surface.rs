//! Surface tests against the fully-assembled router (no network).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use lmx_domain::config::Config;
use lmx_gateway::{api, bootstrap};

/// Build state against a temp directory so nothing touches the repo.
async fn test_app(
    mutate: impl FnOnce(&mut Config),
) -> (tempfile::TempDir, axum::Router) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.models.models_directory = dir.path().join("models");
    config.models.hub_base_url = "http://127.0.0.1:9".into();
    config.agents.state_path = dir.path().join("agents.db");
    config.presets.directory = dir.path().join("presets");
    mutate(&mut config);

    let state = bootstrap::build_state(config, None, None).await.unwrap();
    let app = api::router(state.clone()).with_state(state);
    (dir, app)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_is_public() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn chat_with_unloaded_model_is_404_openai_shaped() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/chat/completions",
            serde_json::json!({
                "model": "nope",
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "model_not_found");
    assert_eq!(body["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn legacy_completions_is_501() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/completions",
            serde_json::json!({"model": "m", "prompt": "hi"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn models_list_empty_initially() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn admin_gate_enforced_when_key_configured() {
    let (_dir, app) = test_app(|config| {
        config.security.admin_key = Some("top-secret".into());
    })
    .await;

    // No key → 401.
    let response = app
        .clone()
        .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key → 401.
    let response = app
        .clone()
        .oneshot(
            Request::get("/admin/status")
                .header("x-admin-key", "guess")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Right key → 200.
    let response = app
        .oneshot(
            Request::get("/admin/status")
                .header("x-admin-key", "top-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["in_flight"], 0);
}

#[tokio::test]
async fn load_absent_model_returns_confirmation_contract() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/admin/models/load",
            serde_json::json!({"model_id": "org/absent-model"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "download_required");
    assert_eq!(body["model_id"], "org/absent-model");
    assert!(body["confirmation_token"].as_str().unwrap().len() >= 32);
    assert_eq!(body["confirm_url"], "/admin/models/load/confirm");
}

#[tokio::test]
async fn confirm_with_bogus_token_is_rejected() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/admin/models/load/confirm",
            serde_json::json!({"confirmation_token": "nonsense"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn skills_register_and_execute_roundtrip() {
    let (_dir, app) = test_app(|_| {}).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/skills",
            serde_json::json!({
                "name": "summarize",
                "description": "summarize text",
                "kind": "prompt",
                "prompt_template": "Summarize: {text}",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/skills/execute",
            serde_json::json!({
                "skill": "summarize",
                "arguments": {"text": "the report"},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["output"], "Summarize: the report");

    // The MCP adapter sees the same registry.
    let response = app
        .oneshot(json_request("POST", "/mcp/tools/list", serde_json::json!({})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["tools"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn agent_submit_without_models_fails_cleanly() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/agents",
            serde_json::json!({"input": "do it", "roles": ["planner"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    let run_id = body["id"].as_str().unwrap().to_string();

    // The run fails (no loaded models) but the record is queryable.
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/v1/agents/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        if body["status"] == "failed" {
            assert!(body["error"]
                .as_str()
                .unwrap()
                .contains("No models are currently loaded"));
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("run never failed");
}

#[tokio::test]
async fn rag_unconfigured_is_client_error() {
    let (_dir, app) = test_app(|_| {}).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/rag/query",
            serde_json::json!({"query": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
