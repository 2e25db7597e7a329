use async_trait::async_trait;
use parley_common::{ChatMessage, Result};
use serde::{Deserialize, Serialize};

/// Contract every chat-completion backend implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name used in logs, errors and cooldown bookkeeping.
    fn provider_id(&self) -> &str;

    async fn create_chat_completion(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Check if the provider is reachable and configured.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    /// Ordered context, system prompt first when present.
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            tools: Vec::new(),
        }
    }
}

/// Function-calling schema exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn message(&self) -> Option<&ChatMessage> {
        self.choices.first().map(|c| &c.message)
    }

    pub fn text(&self) -> &str {
        self.message().map(|m| m.content.as_str()).unwrap_or_default()
    }

    /// Non-empty text or at least one tool call. A 200 with neither is
    /// treated as a failed generation.
    pub fn is_usable(&self) -> bool {
        self.message()
            .is_some_and(|m| !m.content.trim().is_empty() || m.has_tool_calls())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::ToolCall;

    fn response(message: ChatMessage) -> LlmResponse {
        LlmResponse {
            model: "m".to_string(),
            choices: vec![Choice {
                message,
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        }
    }

    #[test]
    fn blank_answer_is_not_usable() {
        assert!(!response(ChatMessage::assistant("  ")).is_usable());
        assert!(response(ChatMessage::assistant("hi")).is_usable());

        let call = ToolCall {
            id: "call_1".to_string(),
            name: "current_time".to_string(),
            arguments: "{}".to_string(),
        };
        assert!(response(ChatMessage::assistant_with_tools("", vec![call])).is_usable());

        let empty = LlmResponse {
            model: "m".to_string(),
            choices: Vec::new(),
            usage: None,
        };
        assert!(!empty.is_usable());
        assert_eq!(empty.text(), "");
    }
}
