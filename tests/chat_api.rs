use biblechat::{ChatMessage, ChatOptions, ChatProvider, Error, OpenAICompatibleProvider};
use futures::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_for(server: &MockServer) -> OpenAICompatibleProvider {
    OpenAICompatibleProvider::new(server.uri(), "secret", "test-model")
}

fn history() -> Vec<ChatMessage> {
    vec![ChatMessage::user("What is grace?", "en", false)]
}

#[tokio::test]
async fn complete_returns_assistant_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(serde_json::json!({
            "model": "test-model",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Grace is unmerited favor."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 6, "total_tokens": 18}
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let reply = provider
        .complete(&history(), "en", &ChatOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, "Grace is unmerited favor.");
}

#[tokio::test]
async fn complete_sends_system_prompt_with_language_instruction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        // messages[0] must be the generated system prompt; for "es" it
        // carries the explicit language instruction.
        .and(body_partial_json(serde_json::json!({
            "messages": [{"role": "system"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "La gracia."}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let reply = provider
        .complete(&history(), "es", &ChatOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, "La gracia.");
}

#[tokio::test]
async fn structured_error_body_surfaces_its_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {
                "message": "Rate limit reached",
                "type": "tokens",
                "code": "rate_limit_exceeded"
            }
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let err = provider
        .complete(&history(), "en", &ChatOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Api(message) => assert_eq!(message, "Rate limit reached"),
        other => panic!("expected Error::Api, got {:?}", other),
    }
}

#[tokio::test]
async fn unparsable_error_body_yields_generic_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("gateway fell over"))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let err = provider
        .complete(&history(), "en", &ChatOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Api(message) => assert!(message.contains("503")),
        other => panic!("expected Error::Api, got {:?}", other),
    }
}

#[tokio::test]
async fn stream_yields_deltas_in_order_and_stops_at_done() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        // Role-only first chunk carries no content and produces no delta.
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" \"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"world\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let mut stream = provider
        .stream_chat(&history(), "en", &ChatOptions::default())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    let mut accumulated = String::new();
    while let Some(item) = stream.next().await {
        let delta = item.unwrap();
        accumulated.push_str(&delta);
        deltas.push(delta);
    }

    assert_eq!(deltas, vec!["Hello", " ", "world"]);
    assert_eq!(accumulated, "Hello world");
}

#[tokio::test]
async fn malformed_stream_frame_is_skipped_not_fatal() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"good\"}}]}\n\n",
        "data: this is not json\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" frames\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let mut stream = provider
        .stream_chat(&history(), "en", &ChatOptions::default())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    while let Some(item) = stream.next().await {
        deltas.push(item.unwrap());
    }
    assert_eq!(deltas, vec!["good", " frames"]);
}

#[tokio::test]
async fn stream_request_failure_is_surfaced_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"message": "model not found"}
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let result = provider
        .stream_chat(&history(), "en", &ChatOptions::default())
        .await;
    match result {
        Ok(_) => panic!("expected the stream request to fail"),
        Err(Error::Api(message)) => assert_eq!(message, "model not found"),
        Err(other) => panic!("expected Error::Api, got {:?}", other),
    }
}
