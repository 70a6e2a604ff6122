//! HTTP contract tests for the backend adapters, driven against a mock
//! server.

use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use portcullis::gateway::{Gateway, GenerationParams, RequestSpec};
use portcullis::providers::gemini::GeminiProvider;
use portcullis::providers::openai::OpenAiProvider;
use portcullis::providers::types::GenerateRequest;
use portcullis::providers::{Provider, ProviderError};
use portcullis::{Config, GatewayError};

fn request(model: &str) -> GenerateRequest {
    GenerateRequest {
        model: model.to_string(),
        prompt: "Hello".to_string(),
        params: GenerationParams::default(),
        timeout: Duration::from_secs(5),
    }
}

fn openai_success_body() -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from the mock"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9}
    })
}

// ---------------------------------------------------------------------------
// OpenAI adapter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn openai_parses_successful_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(serde_json::json!({"model": "gpt-4o"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(Some(server.uri()), "test-key".into(), vec![]);
    let response = provider.generate(&request("gpt-4o")).await.unwrap();

    assert_eq!(response.text, "Hello from the mock");
    assert_eq!(response.model, "gpt-4o");
    assert_eq!(response.usage.tokens_in, 5);
    assert_eq!(response.usage.tokens_out, 4);
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn openai_maps_429_to_transient_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(Some(server.uri()), "test-key".into(), vec![]);
    let err = provider.generate(&request("gpt-4o")).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn openai_maps_401_to_fatal_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(Some(server.uri()), "bad-key".into(), vec![]);
    let err = provider.generate(&request("gpt-4o")).await.unwrap_err();

    assert!(matches!(err, ProviderError::Authentication(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn openai_maps_500_to_transient_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(Some(server.uri()), "test-key".into(), vec![]);
    let err = provider.generate(&request("gpt-4o")).await.unwrap_err();

    assert!(matches!(err, ProviderError::Api { status: 500, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn openai_rejects_empty_completion_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(Some(server.uri()), "test-key".into(), vec![]);
    let err = provider.generate(&request("gpt-4o")).await.unwrap_err();

    assert!(matches!(err, ProviderError::MalformedResponse(_)));
}

// ---------------------------------------------------------------------------
// Gemini adapter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gemini_parses_generate_content_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [{"text": "Hello "}, {"text": "from Gemini"}],
                    "role": "model"
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 5,
                "candidatesTokenCount": 3,
                "totalTokenCount": 8
            }
        })))
        .mount(&server)
        .await;

    let provider = GeminiProvider::new(Some(server.uri()), "test-key".into(), vec![]);
    let response = provider.generate(&request("gemini-2.5-flash")).await.unwrap();

    assert_eq!(response.text, "Hello from Gemini");
    assert_eq!(response.usage.tokens_in, 5);
    assert_eq!(response.usage.tokens_out, 3);
    assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
}

#[tokio::test]
async fn gemini_maps_400_to_fatal_invalid_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown field"))
        .mount(&server)
        .await;

    let provider = GeminiProvider::new(Some(server.uri()), "test-key".into(), vec![]);
    let err = provider.generate(&request("gemini-2.5-flash")).await.unwrap_err();

    assert!(matches!(err, ProviderError::InvalidRequest(_)));
    assert!(!err.is_transient());
}

// ---------------------------------------------------------------------------
// Gateway over a live (mock) backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_retries_transient_backend_failure_end_to_end() {
    let server = MockServer::start().await;

    // First attempt is shed by the backend, second succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success_body()))
        .mount(&server)
        .await;

    let config = Config::from_toml_str(&format!(
        r#"
        [provider]
        name = "openai"
        base_url = "{}"
        credential = "test-key"

        [retry]
        max_attempts = 3
        base_backoff_ms = 1
        max_backoff_ms = 5
        "#,
        server.uri()
    ))
    .unwrap();

    let gateway = Gateway::from_config(&config).unwrap();
    let response = gateway
        .request(RequestSpec {
            identity: "planner".to_string(),
            prompt: "Hello".to_string(),
            model: "gpt-4o".to_string(),
            params: GenerationParams::default(),
            timeout: Some(Duration::from_secs(10)),
        })
        .await
        .unwrap();

    assert_eq!(response.text, "Hello from the mock");
    assert!(response.cost > 0.0);

    let records = gateway.audit().recent(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "completed");
    assert_eq!(records[0].attempts, 2);
}

#[tokio::test]
async fn gateway_surfaces_fatal_backend_error_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config::from_toml_str(&format!(
        r#"
        [provider]
        name = "openai"
        base_url = "{}"
        credential = "revoked-key"
        "#,
        server.uri()
    ))
    .unwrap();

    let gateway = Gateway::from_config(&config).unwrap();
    let err = gateway
        .request(RequestSpec {
            identity: "planner".to_string(),
            prompt: "Hello".to_string(),
            model: "gpt-4o".to_string(),
            params: GenerationParams::default(),
            timeout: Some(Duration::from_secs(10)),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Provider(_)));
    assert_eq!(gateway.spend("planner"), 0.0);
}
