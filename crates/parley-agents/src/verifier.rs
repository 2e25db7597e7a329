use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{ChatMessage, Error, Result};
use parley_security::NonsenseVerifier;

use crate::providers::{LlmProvider, LlmRequest};

const VERIFIER_PROMPT: &str = "You review chat messages sent to an assistant. Reply with exactly \
YES if the message is meaningless (keyboard mashing, random symbols, filler with no intent) \
and NO if it could be a genuine message in any language.";

/// Confirms heuristic nonsense flags with a single YES/NO completion.
pub struct LlmNonsenseVerifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmNonsenseVerifier {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl NonsenseVerifier for LlmNonsenseVerifier {
    async fn is_nonsense(&self, text: &str) -> Result<bool> {
        let mut request = LlmRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(VERIFIER_PROMPT), ChatMessage::user(text)],
        );
        request.max_tokens = Some(3);
        request.temperature = Some(0.0);

        let response = self.provider.create_chat_completion(&request).await?;
        parse_verdict(response.text())
            .ok_or_else(|| Error::Agent(format!("unexpected verifier answer: {:?}", response.text())))
    }
}

fn parse_verdict(answer: &str) -> Option<bool> {
    let answer = answer.trim().to_ascii_uppercase();
    if answer.starts_with("YES") {
        Some(true)
    } else if answer.starts_with("NO") {
        Some(false)
    } else {
        None
    }
}
