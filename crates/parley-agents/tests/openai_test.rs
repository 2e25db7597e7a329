use parley_agents::{LlmProvider, LlmRequest, OpenAiProvider, ToolDefinition};
use parley_common::{ChatMessage, Error};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_openai_completion() {
    let mock_server = MockServer::start().await;

    let response_body = json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "gpt-4o-mini-2024-07-18",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello there!"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "Hello"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let request = LlmRequest::new(
        "gpt-4o-mini",
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello"),
        ],
    );

    let response = provider.create_chat_completion(&request).await.unwrap();
    assert_eq!(response.text(), "Hello there!");
    assert_eq!(response.model, "gpt-4o-mini-2024-07-18");
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    let usage = response.usage.unwrap();
    assert_eq!(usage.total(), 21);
}

#[tokio::test]
async fn test_openai_tool_calls() {
    let mock_server = MockServer::start().await;

    let response_body = json!({
        "id": "chatcmpl-456",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_abc123",
                    "type": "function",
                    "function": {"name": "read_file", "arguments": "{\"path\": \"notes.txt\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }]
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "tools": [{
                "type": "function",
                "function": {
                    "name": "read_file",
                    "parameters": {"required": ["path"]}
                }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let mut request = LlmRequest::new("gpt-4o-mini", vec![ChatMessage::user("open my notes")]);
    request.tools = vec![ToolDefinition {
        name: "read_file".to_string(),
        description: "Read a file".to_string(),
        parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        required: vec!["path".to_string()],
    }];

    let response = provider.create_chat_completion(&request).await.unwrap();
    let message = response.message().unwrap();
    assert!(message.content.is_empty());
    assert_eq!(message.tool_calls.len(), 1);
    assert_eq!(message.tool_calls[0].id, "call_abc123");
    assert_eq!(message.tool_calls[0].name, "read_file");
    assert_eq!(message.tool_calls[0].arguments, "{\"path\": \"notes.txt\"}");
    assert!(response.is_usable());
}

#[tokio::test]
async fn test_openai_error_carries_status_and_name() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&mock_server)
        .await;

    let provider =
        OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri())).with_name("groq");
    let request = LlmRequest::new("llama", vec![ChatMessage::user("hi")]);

    match provider.create_chat_completion(&request).await.unwrap_err() {
        Error::Provider {
            provider,
            status,
            message,
        } => {
            assert_eq!(provider, "groq");
            assert_eq!(status, Some(429));
            assert!(message.contains("rate limited"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_openai_empty_content_is_not_usable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": ""},
                "finish_reason": "content_filter"
            }]
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let request = LlmRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
    let response = provider.create_chat_completion(&request).await.unwrap();
    assert!(!response.is_usable());
}

#[tokio::test]
async fn test_health_check() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    assert!(provider.health_check().await.unwrap());
}
