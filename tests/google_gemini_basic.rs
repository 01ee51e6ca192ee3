mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use common::{MockReply, MockTransport, json_body};
use llm_relay::auth::OAuthCredential;
use llm_relay::config::{ProviderConfig, ProviderType};
use llm_relay::error::ErrorKind;
use llm_relay::provider::google_gemini::GoogleGeminiProvider;
use llm_relay::types::{ChatRequest, Usage};
use llm_relay::{LLMError, Provider};
use serde_json::json;

fn generated(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
        "modelVersion": "gemini-2.5-flash"
    })
}

fn key_provider(transport: &Arc<MockTransport>) -> GoogleGeminiProvider {
    let config = ProviderConfig::new(ProviderType::Gemini, "gemini").with_api_key("gk");
    GoogleGeminiProvider::from_config(config, transport.dyn_transport()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn rate_limited_call_gates_the_next_one() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let transport = MockTransport::new(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            MockReply::json(
                429,
                json!({"error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}}),
            )
            .with_header("Retry-After", "3")
        } else {
            MockReply::json(200, generated("Hello"))
        }
    });
    let provider = key_provider(&transport);

    let err = provider
        .chat(ChatRequest::from_prompt("Hi").with_model("gemini-2.5-flash"))
        .await
        .expect_err("429 should surface");
    assert!(err.is_rate_limit());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    assert!(err.to_string().contains("retry after 3"), "{err}");
    assert_eq!(
        provider.rate_limits().get_wait_time("gemini-2.5-flash").await,
        Duration::from_secs(3)
    );

    let started = tokio::time::Instant::now();
    let response = provider
        .chat(ChatRequest::from_prompt("Hi").with_model("gemini-2.5-flash"))
        .await
        .expect("second call succeeds after the wait");
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(response.content(), "Hello");
    assert_eq!(transport.calls(), 2);
    assert_eq!(
        transport.requests()[0].url,
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent?key=gk"
    );
}

#[tokio::test(start_paused = true)]
async fn client_limiter_paces_requests() {
    let transport = MockTransport::new(|_| MockReply::json(200, generated("ok")));
    let config = ProviderConfig::new(ProviderType::Gemini, "gemini")
        .with_api_key("gk")
        .with_setting("requests_per_minute", 1);
    let provider = GoogleGeminiProvider::from_config(config, transport.dyn_transport()).unwrap();

    let started = tokio::time::Instant::now();
    provider.chat(ChatRequest::from_prompt("one")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    provider.chat(ChatRequest::from_prompt("two")).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(59));
}

#[tokio::test]
async fn oauth_with_project_uses_cloudcode() {
    let transport = MockTransport::new(|_| MockReply::json(200, json!({"response": generated("from cloudcode")})));
    let credential = OAuthCredential::new("google")
        .with_access_token("ya29.token", Utc::now() + chrono::Duration::hours(1))
        .with_refresh_token("1//refresh");
    let config = ProviderConfig::new(ProviderType::Gemini, "gemini")
        .with_oauth_credential(credential)
        .with_setting("project_id", "proj-123");
    let provider = GoogleGeminiProvider::from_config(config, transport.dyn_transport()).unwrap();

    let response = provider
        .chat(ChatRequest::from_prompt("Hi").with_model("gemini-2.5-pro"))
        .await
        .expect("chat");
    assert_eq!(response.content(), "from cloudcode");
    assert_eq!(response.usage, Some(Usage::new(4, 2)));

    let sent = &transport.requests()[0];
    assert_eq!(sent.url, "https://cloudcode-pa.googleapis.com/v1internal:generateContent");
    assert_eq!(sent.header("authorization"), Some("Bearer ya29.token"));
    let body = json_body(sent);
    assert_eq!(body["model"], json!("gemini-2.5-pro"));
    assert_eq!(body["project"], json!("proj-123"));
    assert_eq!(body["request"]["contents"][0]["role"], json!("user"));
    assert_eq!(body["request"]["contents"][0]["parts"][0]["text"], json!("Hi"));
    assert_eq!(transport.calls_to("oauth2.googleapis.com"), 0);
}

#[tokio::test]
async fn streaming_ends_on_finish_reason() {
    let body = concat!(
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],",
        "\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\r\n\r\n",
    );
    let transport = MockTransport::new(move |_| MockReply::sse(body));
    let provider = key_provider(&transport);

    let stream = provider.stream_chat(ChatRequest::from_prompt("Hi")).await.expect("stream");
    assert_eq!(stream.collect_text().await.unwrap(), "Hello");
    assert_eq!(
        transport.requests()[0].url,
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse&key=gk"
    );
}

#[tokio::test]
async fn safety_block_is_an_invalid_request() {
    let transport = MockTransport::new(|_| {
        MockReply::json(200, json!({"candidates": [{"finishReason": "SAFETY", "index": 0}]}))
    });
    let provider = key_provider(&transport);

    match provider.chat(ChatRequest::from_prompt("Hi")).await {
        Err(LLMError::Api(api)) => {
            assert_eq!(api.kind, ErrorKind::InvalidRequest);
            assert!(!api.retryable);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
