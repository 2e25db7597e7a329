//! The tool-calling state machine.
//!
//! `AwaitingModel -> ModelResponded -> {Terminal | ExecutingTools}`, repeated
//! as a bounded loop. The loop never touches the session's message log: it
//! builds the turn on a scratch list and hands it back for the caller to
//! commit, so a failed or cancelled turn leaves the session unchanged.
//!
//! Queued user messages are merged at two points: after the first tool
//! result of a batch (appended once the batch's results are in, since tool
//! results must follow their assistant message), and when the model gives a
//! terminal answer, in which case one more call is made without tools so a
//! single reply covers everything.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parley_common::{
    ChatMessage, ChatRole, Error, RequestContext, Result, Session, StatusPhase, ToolCall,
};
use parley_config::DispatcherConfig;
use parley_db::{Stores, ToolCallOutcome, ToolCallRecord};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::callback::{ActionCallback, ActionEvent, ActionKind};
use crate::profile::AgentProfile;
use crate::providers::{LlmProvider, LlmRequest, LlmResponse, ToolDefinition, Usage};
use crate::tools::{ToolContext, ToolExecutor};

/// Source of user messages that arrived while the turn was running.
pub trait PendingMessages: Send + Sync {
    /// Remove and return everything queued, oldest first.
    fn drain(&self) -> Vec<String>;
}

/// For turns that cannot receive queued messages.
pub struct NoPending;

impl PendingMessages for NoPending {
    fn drain(&self) -> Vec<String> {
        Vec::new()
    }
}

/// How the turn starts.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    User(String),
    /// The user's answer to a question the model asked with the clarification tool.
    ClarificationAnswer { tool_call_id: String, answer: String },
}

impl TurnInput {
    fn text(&self) -> &str {
        match self {
            Self::User(text) => text,
            Self::ClarificationAnswer { answer, .. } => answer,
        }
    }

    fn into_message(self) -> ChatMessage {
        match self {
            Self::User(text) => ChatMessage::user(text),
            Self::ClarificationAnswer {
                tool_call_id,
                answer,
            } => ChatMessage::tool_result(tool_call_id, answer),
        }
    }
}

pub struct Turn<'a> {
    pub ctx: &'a RequestContext,
    pub session: &'a Session,
    pub profile: &'a AgentProfile,
    pub input: TurnInput,
    pub pending: &'a dyn PendingMessages,
    /// Whether the escalation tool may be offered this turn.
    pub allow_escalation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnReply {
    Answer(String),
    /// The model needs more information; `question` goes to the user.
    Clarification {
        tool_call_id: String,
        question: String,
    },
    /// The agent handed off. `inputs` are every user text of this turn, in order.
    Escalate { reason: String, inputs: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: TurnReply,
    /// Messages to commit: the input, assistant/tool exchanges and merged
    /// queued messages, in order.
    pub messages: Vec<ChatMessage>,
    pub usage: Usage,
    pub model: String,
    pub iterations: usize,
}

/// A failed turn, with any queued messages it had already taken so the
/// caller can put them back.
#[derive(Debug)]
pub struct TurnFailure {
    pub error: Error,
    pub drained: Vec<String>,
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for TurnFailure {}

impl From<TurnFailure> for Error {
    fn from(failure: TurnFailure) -> Self {
        failure.error
    }
}

struct TurnState {
    messages: Vec<ChatMessage>,
    inputs: Vec<String>,
    drained: Vec<String>,
    usage: Usage,
    model: String,
}

impl TurnState {
    fn merge_pending(&mut self, pending: &dyn PendingMessages) -> usize {
        let queued = pending.drain();
        let count = queued.len();
        for text in queued {
            self.messages.push(ChatMessage::user(text.clone()));
            self.inputs.push(text.clone());
            self.drained.push(text);
        }
        count
    }
}

pub struct ToolCallLoop {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    stores: Stores,
    callback: Option<Arc<dyn ActionCallback>>,
    max_iterations: usize,
    max_context_tokens: usize,
    clarification_tool: String,
    escalation_tool: String,
}

impl ToolCallLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
        stores: Stores,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            stores,
            callback: None,
            max_iterations: config.max_tool_iterations,
            max_context_tokens: config.max_context_tokens,
            clarification_tool: config.clarification_tool.clone(),
            escalation_tool: config.escalation_tool.clone(),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ActionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn callback(&self) -> Option<&Arc<dyn ActionCallback>> {
        self.callback.as_ref()
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    #[instrument(skip_all, fields(user_id = %turn.session.user_id, session_id = %turn.session.id))]
    pub async fn run(&self, turn: Turn<'_>) -> std::result::Result<TurnOutcome, TurnFailure> {
        let mut state = TurnState {
            inputs: vec![turn.input.text().to_string()],
            messages: vec![turn.input.clone().into_message()],
            drained: Vec::new(),
            usage: Usage::default(),
            model: turn.profile.model.clone(),
        };
        match self.drive(&turn, &mut state).await {
            Ok((reply, iterations)) => Ok(TurnOutcome {
                reply,
                messages: state.messages,
                usage: state.usage,
                model: state.model,
                iterations,
            }),
            Err(error) => Err(TurnFailure {
                error,
                drained: state.drained,
            }),
        }
    }

    async fn drive(&self, turn: &Turn<'_>, state: &mut TurnState) -> Result<(TurnReply, usize)> {
        let system = build_system_prompt(turn.profile, turn.session.summary.as_deref());
        let tool_defs = self.tool_definitions(turn.profile, turn.allow_escalation);
        let history = turn.session.history();
        let mut tools_enabled = true;

        for iteration in 1..=self.max_iterations {
            if turn.ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let offered: &[ToolDefinition] = if tools_enabled { &tool_defs } else { &[] };
            let mut context = history.clone();
            context.extend(state.messages.iter().cloned());
            trim_messages_to_budget(&mut context, system.as_ref(), offered, self.max_context_tokens);
            if let Some(system) = &system {
                context.insert(0, system.clone());
            }

            let request = LlmRequest {
                model: turn.profile.model.clone(),
                messages: context,
                max_tokens: Some(turn.profile.max_tokens),
                temperature: turn.profile.temperature,
                tools: offered.to_vec(),
            };

            turn.ctx
                .emit(StatusPhase::Thinking, Some(format!("iteration {iteration}")));
            let mut message = self.call_llm(turn, &request, state).await?;

            if !tools_enabled || !message.has_tool_calls() {
                message.tool_calls.clear();
                let text = message.content.clone();
                state.messages.push(message);

                // An answer on the last allowed call stands; anything queued
                // meanwhile becomes the next turn.
                if tools_enabled
                    && iteration < self.max_iterations
                    && state.merge_pending(turn.pending) > 0
                {
                    debug!("queued messages arrived, asking for a combined reply");
                    tools_enabled = false;
                    continue;
                }
                return Ok((TurnReply::Answer(text), iteration));
            }

            if turn.allow_escalation {
                if let Some(call) = message
                    .tool_calls
                    .iter()
                    .find(|c| c.name == self.escalation_tool)
                {
                    let reason = argument(&call.arguments, "reason").unwrap_or_default();
                    info!(%reason, "agent requested escalation");
                    return Ok((
                        TurnReply::Escalate {
                            reason,
                            inputs: state.inputs.clone(),
                        },
                        iteration,
                    ));
                }
            }

            let calls = message.tool_calls.clone();
            state.messages.push(message);

            let clarification = calls.iter().find(|c| c.name == self.clarification_tool);
            let mut merged = Vec::new();
            let mut first_result = true;

            for call in &calls {
                if clarification.is_some_and(|c| c.id == call.id) {
                    continue;
                }
                let content = if call.name == self.clarification_tool {
                    "Only one question can be asked at a time.".to_string()
                } else {
                    self.execute_call(turn, call).await?
                };
                state.messages.push(ChatMessage::tool_result(&call.id, content));

                // A pending clarification must stay directly answerable, so
                // nothing is merged into that batch.
                if first_result && clarification.is_none() {
                    first_result = false;
                    merged = turn.pending.drain();
                }
            }

            if let Some(call) = clarification {
                let question = argument(&call.arguments, "question")
                    .unwrap_or_else(|| "Could you tell me more?".to_string());
                return Ok((
                    TurnReply::Clarification {
                        tool_call_id: call.id.clone(),
                        question,
                    },
                    iteration,
                ));
            }

            if !merged.is_empty() {
                debug!(count = merged.len(), "merging queued messages after tool results");
                for text in merged {
                    state.messages.push(ChatMessage::user(text.clone()));
                    state.inputs.push(text.clone());
                    state.drained.push(text);
                }
            }
        }

        warn!(max = self.max_iterations, "tool loop hit its iteration cap");
        Err(Error::MaxIterations(self.max_iterations))
    }

    fn tool_definitions(&self, profile: &AgentProfile, allow_escalation: bool) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .definitions(&profile.tools)
            .into_iter()
            .filter(|d| d.name != self.clarification_tool && d.name != self.escalation_tool)
            .collect();

        if profile.allows(&self.clarification_tool) {
            defs.push(ToolDefinition {
                name: self.clarification_tool.clone(),
                description: "Ask the user a clarifying question when the request is ambiguous. \
                              The conversation pauses until they answer."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"question": {"type": "string"}}
                }),
                required: vec!["question".to_string()],
            });
        }
        if allow_escalation && profile.escalates_to.is_some() {
            defs.push(ToolDefinition {
                name: self.escalation_tool.clone(),
                description: "Hand this request to a more capable assistant when it needs deeper \
                              reasoning than you can provide."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"reason": {"type": "string"}}
                }),
                required: Vec::new(),
            });
        }
        defs
    }

    /// A call blocked by the callback comes back as a plain assistant answer
    /// carrying the callback's text.
    async fn call_llm(
        &self,
        turn: &Turn<'_>,
        request: &LlmRequest,
        state: &mut TurnState,
    ) -> Result<ChatMessage> {
        let mut event = ActionEvent::new(&turn.session.user_id, ActionKind::LlmCall, &request.model);
        if let Some(callback) = &self.callback {
            if let Err(text) = callback.before_action(&event).await {
                info!("llm call blocked by callback");
                return Ok(ChatMessage::assistant(text));
            }
        }

        let started = Instant::now();
        let result: Result<LlmResponse> =
            cancellable(turn.ctx, self.provider.create_chat_completion(request)).await;
        event.duration = started.elapsed();

        let outcome = result.and_then(|response| {
            let usage = response.usage.unwrap_or_default();
            event.prompt_tokens = usage.prompt_tokens;
            event.completion_tokens = usage.completion_tokens;
            state.usage.add(&usage);
            if !response.model.is_empty() {
                state.model = response.model.clone();
            }
            response.message().cloned().ok_or_else(|| {
                Error::provider(self.provider.provider_id(), "response contained no choices")
            })
        });

        if let Err(e) = &outcome {
            event.error = Some(e.to_string());
        }
        if let Some(callback) = &self.callback {
            callback.after_action(&event).await;
        }
        outcome
    }

    /// Always yields text for the model; only store failures and
    /// cancellation abort the turn.
    async fn execute_call(&self, turn: &Turn<'_>, call: &ToolCall) -> Result<String> {
        let session = turn.session;
        let record_id = session.generate_tool_id();
        if let Some(store) = &self.stores.tool_calls {
            store
                .insert_tool_call(&ToolCallRecord {
                    id: record_id.clone(),
                    session_id: session.id.clone(),
                    user_id: session.user_id.clone(),
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    response: None,
                    error: None,
                    duration_ms: None,
                    created_at: Utc::now(),
                    completed_at: None,
                })
                .await?;
        }

        turn.ctx
            .emit(StatusPhase::ToolExecuting, Some(call.name.clone()));
        let mut event = ActionEvent::new(&session.user_id, ActionKind::ToolCall, &call.name);
        let started = Instant::now();

        let blocked = match &self.callback {
            Some(callback) => callback.before_action(&event).await.err(),
            None => None,
        };

        let (content, error) = match blocked {
            Some(text) => {
                info!(tool = %call.name, "tool call blocked by callback");
                (text.clone(), Some(text))
            }
            None => {
                let ctx = ToolContext::new(session, self.stores.opened_files.clone());
                let result = cancellable(
                    turn.ctx,
                    self.tools.execute(&ctx, &call.name, &call.arguments),
                )
                .await;
                match result {
                    Ok(output) => (output, None),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(tool = %call.name, "tool failed: {e}");
                        let text = format!("Error: {e}");
                        (text.clone(), Some(text))
                    }
                }
            }
        };

        event.duration = started.elapsed();
        event.error = error.clone();
        if let Some(callback) = &self.callback {
            callback.after_action(&event).await;
        }

        if let Some(store) = &self.stores.tool_calls {
            let outcome = ToolCallOutcome {
                response: content.clone(),
                error,
                duration_ms: u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX),
            };
            if !store.complete_tool_call(&record_id, &outcome).await? {
                warn!(%record_id, "tool call record was already completed");
            }
        }
        turn.ctx.emit(StatusPhase::ToolDone, Some(call.name.clone()));
        Ok(content)
    }
}

async fn cancellable<T>(ctx: &RequestContext, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

fn argument(arguments: &str, key: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(arguments)
        .ok()?
        .get(key)?
        .as_str()
        .map(str::to_string)
}

/// Profile prompt plus the session's running summary, if any.
pub fn build_system_prompt(profile: &AgentProfile, summary: Option<&str>) -> Option<ChatMessage> {
    let mut parts = Vec::new();
    if let Some(prompt) = profile.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        parts.push(prompt.to_string());
    }
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        parts.push(format!("Conversation summary:\n{summary}"));
    }
    (!parts.is_empty()).then(|| ChatMessage::system(parts.join("\n\n")))
}

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(
    messages: &[ChatMessage],
    system: Option<&ChatMessage>,
    tools: &[ToolDefinition],
) -> usize {
    let mut chars = system.map_or(0, |s| s.content.len());
    for msg in messages {
        chars += msg.content.len();
        for call in &msg.tool_calls {
            chars += call.name.len() + call.arguments.len();
        }
    }
    for tool in tools {
        chars += tool.description.len() + tool.parameters.to_string().len();
    }
    chars / 4
}

/// Drop the oldest messages until the estimate fits. Always keeps the newest
/// message, and never leaves a tool result without its assistant call.
pub fn trim_messages_to_budget(
    messages: &mut Vec<ChatMessage>,
    system: Option<&ChatMessage>,
    tools: &[ToolDefinition],
    max_tokens: usize,
) {
    let before = messages.len();
    while messages.len() > 1 && estimate_tokens(messages, system, tools) > max_tokens {
        messages.remove(0);
    }
    while messages.len() > 1 && messages[0].role == ChatRole::Tool {
        messages.remove(0);
    }
    if messages.len() < before {
        debug!(dropped = before - messages.len(), "trimmed context to fit budget");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::AgentType;

    #[test]
    fn system_prompt_includes_summary() {
        let mut profile = AgentProfile::new(AgentType::Low, "m");
        assert!(build_system_prompt(&profile, None).is_none());

        profile.system_prompt = Some("Be brief.".to_string());
        let system = build_system_prompt(&profile, Some("User likes tea.")).unwrap();
        assert_eq!(
            system.content,
            "Be brief.\n\nConversation summary:\nUser likes tea."
        );
    }

    #[test]
    fn trim_keeps_newest_and_drops_orphaned_tool_results() {
        let call = ToolCall {
            id: "c1".to_string(),
            name: "current_time".to_string(),
            arguments: "{}".to_string(),
        };
        let mut messages = vec![
            ChatMessage::user("x".repeat(400)),
            ChatMessage::assistant_with_tools("", vec![call]),
            ChatMessage::tool_result("c1", "y".repeat(40)),
            ChatMessage::user("latest question"),
        ];
        trim_messages_to_budget(&mut messages, None, &[], 14);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "latest question");
    }

    #[test]
    fn trim_is_noop_under_budget() {
        let mut messages = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        trim_messages_to_budget(&mut messages, None, &[], 1000);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn argument_extraction() {
        assert_eq!(
            argument(r#"{"question":"Which city?"}"#, "question").as_deref(),
            Some("Which city?")
        );
        assert_eq!(argument("not json", "question"), None);
    }
}
