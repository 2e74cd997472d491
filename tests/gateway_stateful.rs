use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use stage_harness::gateway::stateful::ChatProvider;
use stage_harness::gateway::usage::{CallStatus, UsageRecord};
use stage_harness::gateway::{
    Attribution, ChatGateway, ChatRequest, ProviderError, ProviderGateway, StatefulChatAdapter,
    StatusKind, UsageSink,
};
use stage_harness::retry::ErrorClass;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> StatefulChatAdapter {
    StatefulChatAdapter::with_config(server.uri(), None, Duration::from_secs(5)).unwrap()
}

fn request(input: &str) -> ChatRequest {
    ChatRequest::new("model-a", input, Attribution::new("test")).max_output_tokens(256)
}

#[tokio::test]
async fn single_shot_reads_output_session_and_stats() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({
            "model": "model-a",
            "input": "hello",
            "max_output_tokens": 256,
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response_id": "resp_1",
            "output": [
                {"type": "reasoning", "content": "thinking"},
                {"type": "message", "content": "{\"tokens\": []}"}
            ],
            "stats": {"input_tokens": 12, "total_output_tokens": 7}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request("hello")).await.unwrap();
    assert_eq!(resp.response_id.as_deref(), Some("resp_1"));
    assert_eq!(resp.content(), "{\"tokens\": []}");
    assert_eq!(resp.input_tokens, Some(12));
    assert_eq!(resp.output_tokens, Some(7));
}

#[tokio::test]
async fn chained_request_carries_previous_response_id_and_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({"previous_response_id": "resp_1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response_id": "resp_2",
            "choices": [{"message": {"content": "next"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = StatefulChatAdapter::with_config(
        format!("{}/", server.uri()),
        Some("secret".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();
    let resp = adapter
        .chat(&request("continue").continuing("resp_1"))
        .await
        .unwrap();
    assert_eq!(resp.response_id.as_deref(), Some("resp_2"));
    assert_eq!(resp.content(), "next");
}

#[tokio::test]
async fn streamed_turn_is_assembled_from_deltas() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"type\":\"message.delta\",\"content\":\"{\\\"syntax\\\": \"}\n\n",
        "data: {\"type\":\"message.delta\",\"content\":\"{}}\"}\n\n",
        "data: {\"type\":\"chat.end\",\"result\":{\"response_id\":\"resp_s\"}}\n\n",
        "data: [DONE]\n\n",
    );

    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .chat(&request("go").streaming(true))
        .await
        .unwrap();
    assert_eq!(resp.response_id.as_deref(), Some("resp_s"));
    assert_eq!(resp.content(), "{\"syntax\": {}}");
}

#[tokio::test]
async fn error_statuses_map_onto_retry_classes() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"input": "stale"})))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"message": "previous_response_id not found", "code": "not_found"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"input": "loading"})))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not loaded"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"input": "big"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("context length exceeded"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"input": "crash"})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let adapter = adapter(&server);

    let err = adapter
        .chat(&request("stale").continuing("resp_old"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(StatusKind::SessionRejected));
    assert_eq!(err.class(), ErrorClass::StaleSession);
    assert_eq!(err.http_status(), Some(404));

    let err = adapter.chat(&request("loading")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotReady);

    let err = adapter.chat(&request("big")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Oversized);

    let err = adapter.chat(&request("crash")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Broken);
    assert_eq!(err.code(), "backend_error");
}

#[tokio::test]
async fn slow_backend_times_out_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"response_id": "late", "output": []}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let adapter =
        StatefulChatAdapter::with_config(server.uri(), None, Duration::from_millis(100)).unwrap();
    let err = adapter.chat(&request("hi")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout { .. }));
    assert_eq!(err.class(), ErrorClass::Transient);
}

#[derive(Default)]
struct CollectingUsage(Mutex<Vec<UsageRecord>>);

#[async_trait::async_trait]
impl UsageSink for CollectingUsage {
    async fn record(&self, record: UsageRecord) {
        self.0.lock().unwrap().push(record);
    }
}

#[tokio::test]
async fn gateway_records_usage_for_success_and_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"input": "ok"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response_id": "r",
            "output": [{"type": "message", "content": "fine"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat"))
        .and(body_partial_json(json!({"input": "bad"})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let usage = Arc::new(CollectingUsage::default());
    let gateway = ProviderGateway::new(adapter(&server), usage.clone());

    let attribution = Attribution::new("test").with_item("v1").with_stage("morphologic");
    gateway
        .chat(ChatRequest::new("model-a", "ok", attribution.clone()))
        .await
        .unwrap();
    gateway
        .chat(ChatRequest::new("model-a", "bad", attribution))
        .await
        .unwrap_err();

    let records = usage.0.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, CallStatus::Success);
    assert_eq!(records[0].input_tokens, Some(3));
    assert_eq!(records[0].item_id.as_deref(), Some("v1"));
    assert_eq!(records[1].status, CallStatus::Error);
    assert_eq!(records[1].error_code, Some("backend_error"));
    assert_eq!(records[1].http_status, Some(500));
}
