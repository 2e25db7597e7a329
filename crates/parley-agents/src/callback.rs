use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ToolCall,
    LlmCall,
    AgentRouting,
}

/// One metered action. `tokens`, `duration` and `error` are only filled in
/// for the `after_action` notification.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEvent {
    /// User the action is billed to.
    pub actor: String,
    pub kind: ActionKind,
    /// Tool name, model name, or target agent.
    pub name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ActionEvent {
    pub fn new(actor: impl Into<String>, kind: ActionKind, name: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            kind,
            name: name.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }
}

/// Billing and metering hook around tool calls, LLM calls and agent routing.
#[async_trait]
pub trait ActionCallback: Send + Sync {
    /// `Err(text)` blocks the action; `text` becomes its visible result.
    async fn before_action(&self, event: &ActionEvent) -> std::result::Result<(), String>;

    async fn after_action(&self, event: &ActionEvent);
}
