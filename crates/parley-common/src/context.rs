use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Live progress phases surfaced to the transport while a request runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Received,
    Analyzing,
    Routing,
    Thinking,
    ToolExecuting,
    ToolDone,
    AgentCalling,
    AgentDone,
    Completed,
    Error,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub phase: StatusPhase,
    pub detail: Option<String>,
}

pub type StatusSink = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Request-scoped state threaded through every LLM and tool call.
#[derive(Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub cancel: CancellationToken,
    status: Option<StatusSink>,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            cancel: CancellationToken::new(),
            status: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_status(mut self, sink: StatusSink) -> Self {
        self.status = Some(sink);
        self
    }

    /// Report a phase transition. A context without a sink ignores it.
    pub fn emit(&self, phase: StatusPhase, detail: Option<String>) {
        if let Some(sink) = &self.status {
            sink(StatusUpdate { phase, detail });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("user_id", &self.user_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("has_status_sink", &self.status.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn emit_without_sink_is_noop() {
        let ctx = RequestContext::new("u1");
        ctx.emit(StatusPhase::Thinking, None);
    }

    #[test]
    fn emit_reaches_sink_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let ctx = RequestContext::new("u1").with_status(Arc::new(move |update| {
            sink_seen.lock().unwrap().push(update.phase);
        }));

        ctx.emit(StatusPhase::Received, None);
        ctx.emit(StatusPhase::ToolExecuting, Some("current_time".into()));
        ctx.emit(StatusPhase::Completed, None);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StatusPhase::Received,
                StatusPhase::ToolExecuting,
                StatusPhase::Completed
            ]
        );
    }
}
