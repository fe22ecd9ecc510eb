mod common;

use common::upstream_stub::{StubResponse, UpstreamStub};
use common::{start_app, test_settings};
use serde_json::{json, Value};

#[tokio::test]
async fn plain_text_round_trip() {
    let stub = UpstreamStub::start(vec![StubResponse::ok(json!({
        "choices": [{"message": {"role": "assistant", "content": "Hi"}}],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    }))])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "Hello"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-request-id").is_some());

    let body: Value = response.json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("resp_"));
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"][0]["type"], "message");
    assert_eq!(body["output"][0]["content"][0]["type"], "output_text");
    assert_eq!(body["output"][0]["content"][0]["text"], "Hi");
    assert_eq!(body["usage"]["total_tokens"], 2);

    let upstream = stub.request(0);
    assert_eq!(upstream["model"], "openai/gpt-4.1");
    assert_eq!(upstream["messages"], json!([{"role": "user", "content": "Hello"}]));
    assert!(upstream.get("max_tokens").is_none());
}

#[tokio::test]
async fn virtualized_apply_patch_round_trip() {
    let stub = UpstreamStub::start(vec![StubResponse::ok(json!({
        "choices": [{"message": {
            "role": "assistant",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "apply_patch", "arguments": "{\"input\":\"*** Begin Patch\"}"}
            }]
        }}]
    }))])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({
            "model": "gpt-4.1",
            "input": "patch it",
            "tools": [{"type": "apply_patch"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let upstream = stub.request(0);
    let tool = &upstream["tools"][0];
    assert_eq!(tool["type"], "function");
    assert_eq!(tool["function"]["name"], "apply_patch");
    assert_eq!(tool["function"]["parameters"]["required"], json!(["input"]));
    assert_eq!(tool["function"]["parameters"]["additionalProperties"], false);

    let item = &body["output"][0];
    assert_eq!(item["type"], "apply_patch_call");
    assert_eq!(item["call_id"], "call_1");
    assert_eq!(item["name"], "apply_patch");
    assert_eq!(item["arguments"], "{\"input\":\"*** Begin Patch\"}");
}

#[tokio::test]
async fn tool_loop_follow_up_infers_tools_and_calls_once() {
    let stub = UpstreamStub::start(vec![StubResponse::ok(json!({
        "choices": [{"message": {"role": "assistant", "content": "done"}}]
    }))])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({
            "model": "gpt-4.1",
            "input": [
                {"type": "function_call", "call_id": "call_1", "name": "get_weather",
                 "arguments": "{}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "ok"}
            ]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(stub.calls(), 1);

    let upstream = stub.request(0);
    assert_eq!(upstream["tool_choice"], "none");
    assert_eq!(upstream["tools"][0]["function"]["name"], "get_weather");
    // Tool-id round trip: the output message references the original call id.
    assert_eq!(upstream["messages"][0]["tool_calls"][0]["id"], "call_1");
    assert_eq!(upstream["messages"][1]["tool_call_id"], "call_1");
}

#[tokio::test]
async fn empty_completion_is_retried_once() {
    let stub = UpstreamStub::start(vec![
        StubResponse::ok(json!({"choices": []})),
        StubResponse::ok(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })),
    ])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "ack?"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["output"][0]["content"][0]["text"], "ok");
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn repeated_empty_completion_is_bad_gateway() {
    let stub = UpstreamStub::start(vec![StubResponse::ok(json!({"choices": []}))]).await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "ack?"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "bad_gateway");
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn tool_name_collision_never_reaches_upstream() {
    let stub = UpstreamStub::start(vec![]).await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({
            "model": "gpt-4.1",
            "input": "hi",
            "tools": [
                {"type": "shell"},
                {"type": "function", "name": "shell", "parameters": {"type": "object"}}
            ]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn fragile_field_is_degraded_after_upstream_rejection() {
    let stub = UpstreamStub::start(vec![
        StubResponse::error(
            400,
            json!({"error": {"message": "verbosity is not supported for this model",
                              "type": "invalid_request_error"}}),
        ),
        StubResponse::ok(json!({
            "choices": [{"message": {"role": "assistant", "content": "fine"}}]
        })),
    ])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "hi", "verbosity": "high"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(stub.calls(), 2);
    assert_eq!(stub.request(0)["verbosity"], "high");
    assert!(stub.request(1).get("verbosity").is_none());
}

#[tokio::test]
async fn non_retriable_upstream_error_passes_through() {
    let stub = UpstreamStub::start(vec![StubResponse::error(
        403,
        json!({"error": {"message": "provider blocked", "type": "forbidden"}}),
    )])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "provider blocked");
    assert_eq!(stub.calls(), 1);
}

#[tokio::test]
async fn retryable_upstream_status_is_retried() {
    let stub = UpstreamStub::start(vec![
        StubResponse::error(503, json!({"error": {"message": "overloaded", "type": "server_error"}})),
        StubResponse::ok(json!({
            "choices": [{"message": {"role": "assistant", "content": "recovered"}}]
        })),
    ])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "hi"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["output"][0]["content"][0]["text"], "recovered");
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn length_finish_reason_yields_incomplete_status() {
    let stub = UpstreamStub::start(vec![StubResponse::ok(json!({
        "choices": [{
            "message": {"role": "assistant", "content": "trunc"},
            "finish_reason": "length"
        }]
    }))])
    .await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "hi", "max_output_tokens": 4}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "incomplete");
    assert_eq!(stub.request(0)["max_tokens"], 4 + 64);
}

#[tokio::test]
async fn client_auth_gate_rejects_bad_keys() {
    let stub = UpstreamStub::start(vec![StubResponse::ok(json!({
        "choices": [{"message": {"role": "assistant", "content": "hi"}}]
    }))])
    .await;
    let mut settings = test_settings(&stub.base_url);
    settings.client_api_key = Some("sekrit".into());
    let app = start_app(settings).await;

    let client = reqwest::Client::new();
    let denied = client
        .post(format!("{app}/v1/responses"))
        .json(&json!({"model": "gpt-4.1", "input": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = client
        .post(format!("{app}/v1/responses"))
        .bearer_auth("sekrit")
        .json(&json!({"model": "gpt-4.1", "input": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn operational_endpoints_respond() {
    let stub = UpstreamStub::start(vec![]).await;
    let app = start_app(test_settings(&stub.base_url)).await;

    let client = reqwest::Client::new();
    let health: Value = client
        .get(format!("{app}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let version: Value = client
        .get(format!("{app}/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));

    let metrics: Value = client
        .get(format!("{app}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["requests_total"].as_u64().unwrap() >= 2);
}
