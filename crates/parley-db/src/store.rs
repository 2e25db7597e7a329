use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::{Result, Session, SessionMessage, User};
use serde::{Deserialize, Serialize};

/// Required persistence for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session. A missing session is `Error::NotFound`.
    async fn get(&self, id: &str) -> Result<Session>;

    async fn put(&self, session: &Session) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// All sessions of one user, oldest first.
    async fn list(&self, user_id: &str) -> Result<Vec<Session>>;

    /// Every stored session; used by background scans.
    async fn list_all(&self) -> Result<Vec<Session>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    async fn put_user(&self, user: &User) -> Result<()>;
}

/// Append-only tool-call audit log.
#[async_trait]
pub trait ToolCallStore: Send + Sync {
    async fn insert_tool_call(&self, record: &ToolCallRecord) -> Result<()>;

    /// Fill in the result of a previously inserted record. Returns `false`
    /// when the record is unknown or was already completed.
    async fn complete_tool_call(&self, id: &str, outcome: &ToolCallOutcome) -> Result<bool>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_messages(&self, session_id: &str, messages: &[SessionMessage]) -> Result<()>;
}

#[async_trait]
pub trait OpenedFileStore: Send + Sync {
    async fn record_opened_file(&self, record: &OpenedFileRecord) -> Result<()>;
}

#[async_trait]
pub trait SummarizationLogStore: Send + Sync {
    async fn record_summarization(&self, record: &SummarizationLogRecord) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    /// Provider-assigned call ID the result is correlated with.
    pub call_id: String,
    pub name: String,
    pub arguments: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    pub response: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenedFileRecord {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationLogRecord {
    pub id: String,
    pub session_id: String,
    pub archived_count: usize,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// The session store plus whichever optional capabilities the backend offers,
/// resolved once when the application wires itself up.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub users: Option<Arc<dyn UserStore>>,
    pub tool_calls: Option<Arc<dyn ToolCallStore>>,
    pub messages: Option<Arc<dyn MessageStore>>,
    pub opened_files: Option<Arc<dyn OpenedFileStore>>,
    pub summarization_logs: Option<Arc<dyn SummarizationLogStore>>,
}

impl Stores {
    /// Sessions only; every optional capability is unsupported.
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions,
            users: None,
            tool_calls: None,
            messages: None,
            opened_files: None,
            summarization_logs: None,
        }
    }

    /// A backend implementing every capability.
    pub fn full<T>(backend: Arc<T>) -> Self
    where
        T: SessionStore
            + UserStore
            + ToolCallStore
            + MessageStore
            + OpenedFileStore
            + SummarizationLogStore
            + 'static,
    {
        Self {
            sessions: backend.clone(),
            users: Some(backend.clone()),
            tool_calls: Some(backend.clone()),
            messages: Some(backend.clone()),
            opened_files: Some(backend.clone()),
            summarization_logs: Some(backend),
        }
    }

    pub fn with_users(mut self, users: Arc<dyn UserStore>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Arc<dyn ToolCallStore>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn with_messages(mut self, messages: Arc<dyn MessageStore>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_opened_files(mut self, opened_files: Arc<dyn OpenedFileStore>) -> Self {
        self.opened_files = Some(opened_files);
        self
    }

    pub fn with_summarization_logs(mut self, logs: Arc<dyn SummarizationLogStore>) -> Self {
        self.summarization_logs = Some(logs);
        self
    }
}
