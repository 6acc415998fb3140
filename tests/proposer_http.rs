//! HTTP collaborators against a mock server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use self_rewrite_orchestrator::config::RewriteConfig;
use self_rewrite_orchestrator::proposal::{
    AnthropicProposer, OpenAiProposer, ProposalError, RetryPolicy, RetryingProposer,
};
use self_rewrite_orchestrator::{AutoApprove, MutationLock, RewritePipeline, RewriteProposer};

fn chat_reply(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }]
    })
}

fn openai(server: &MockServer) -> OpenAiProposer {
    OpenAiProposer::new(format!("{}/v1/chat/completions", server.uri()), "sk-test", "gpt-4o")
        .with_timeout(Duration::from_secs(5))
}

fn fast_retry(inner: OpenAiProposer) -> RetryingProposer {
    RetryingProposer::new(Arc::new(inner), RetryPolicy::fixed(3, Duration::from_millis(5)))
}

#[tokio::test]
async fn test_openai_returns_first_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("fn a() {}")))
        .expect(1)
        .mount(&server)
        .await;

    let text = openai(&server).propose("fn a", "tidy").await.expect("test: propose");
    assert_eq!(text, "fn a() {}");
}

#[tokio::test]
async fn test_openai_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("fn b() {}")))
        .expect(1)
        .mount(&server)
        .await;

    let text = fast_retry(openai(&server)).propose("fn b", "tidy").await.expect("test: propose");
    assert_eq!(text, "fn b() {}");
}

#[tokio::test]
async fn test_openai_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let err = fast_retry(openai(&server))
        .propose("fn c", "tidy")
        .await
        .expect_err("test: 400 fails");
    match err {
        ProposalError::Api { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad request");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_openai_empty_choices_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = openai(&server).propose("fn d", "tidy").await.expect_err("test: malformed");
    assert!(matches!(err, ProposalError::Malformed(_)), "{err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_anthropic_joins_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ak-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                { "type": "text", "text": "fn e() " },
                { "type": "text", "text": "{}" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let proposer = AnthropicProposer::new(format!("{}/v1/messages", server.uri()), "ak-test", "claude")
        .with_timeout(Duration::from_secs(5));
    let text = proposer.propose("fn e", "tidy").await.expect("test: propose");
    assert_eq!(text, "fn e() {}");
}

#[tokio::test]
async fn test_pipeline_applies_rewrite_from_http_collaborator() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(
            "```rust\n/// Doubles `x`.\npub fn double(x: u32) -> u32 {\n    x * 2\n}\n```",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let live = tempfile::tempdir().expect("test: tempdir");
    std::fs::create_dir_all(live.path().join("src")).expect("test: mkdir");
    std::fs::write(live.path().join("src/lib.rs"), "pub fn double(x: u32) -> u32 {\n    x + x\n}\n")
        .expect("test: write");

    let mut cfg = RewriteConfig::default();
    cfg.workspace.root = live.path().to_path_buf();
    let pipeline = RewritePipeline::from_config(&cfg, Arc::new(openai(&server)), MutationLock::new());

    let outcome = pipeline.improve("double", "document it", &AutoApprove).await;
    assert!(outcome.is_applied(), "{outcome}");
    let lib = std::fs::read_to_string(live.path().join("src/lib.rs")).expect("test: read");
    assert_eq!(lib, "/// Doubles `x`.\npub fn double(x: u32) -> u32 {\n    x * 2\n}\n");
}
