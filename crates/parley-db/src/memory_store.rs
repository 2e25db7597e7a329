use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use parley_common::{Error, Result, Session, SessionMessage, User};

use crate::store::{
    MessageStore, OpenedFileRecord, OpenedFileStore, SessionStore, SummarizationLogRecord,
    SummarizationLogStore, ToolCallOutcome, ToolCallRecord, ToolCallStore, UserStore,
};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    users: HashMap<String, User>,
    tool_calls: Vec<ToolCallRecord>,
    messages: HashMap<String, Vec<SessionMessage>>,
    opened_files: Vec<OpenedFileRecord>,
    summarization_logs: Vec<SummarizationLogRecord>,
}

/// Process-local store implementing every capability. Used by tests and by
/// deployments that do not need durability.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.tables.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn tool_calls_for(&self, session_id: &str) -> Vec<ToolCallRecord> {
        self.read(|t| {
            t.tool_calls
                .iter()
                .filter(|r| r.session_id == session_id)
                .cloned()
                .collect()
        })
    }

    pub fn messages_for(&self, session_id: &str) -> Vec<SessionMessage> {
        self.read(|t| t.messages.get(session_id).cloned().unwrap_or_default())
    }

    pub fn opened_files_for(&self, session_id: &str) -> Vec<OpenedFileRecord> {
        self.read(|t| {
            t.opened_files
                .iter()
                .filter(|r| r.session_id == session_id)
                .cloned()
                .collect()
        })
    }

    pub fn summarization_logs(&self) -> Vec<SummarizationLogRecord> {
        self.read(|t| t.summarization_logs.clone())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Session> {
        self.read(|t| t.sessions.get(id).cloned())
            .ok_or_else(|| Error::NotFound(format!("session '{id}'")))
    }

    async fn put(&self, session: &Session) -> Result<()> {
        self.write(|t| {
            t.sessions.insert(session.id.clone(), session.clone());
        });
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.write(|t| {
            t.sessions.remove(id);
        });
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.read(|t| {
            t.sessions
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect()
        });
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn list_all(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.read(|t| t.sessions.values().cloned().collect());
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.read(|t| t.users.get(id).cloned()))
    }

    async fn put_user(&self, user: &User) -> Result<()> {
        self.write(|t| {
            t.users.insert(user.id.clone(), user.clone());
        });
        Ok(())
    }
}

#[async_trait]
impl ToolCallStore for InMemoryStore {
    async fn insert_tool_call(&self, record: &ToolCallRecord) -> Result<()> {
        self.write(|t| {
            if t.tool_calls.iter().any(|r| r.id == record.id) {
                return Err(Error::Database(format!(
                    "tool call '{}' already recorded",
                    record.id
                )));
            }
            t.tool_calls.push(record.clone());
            Ok(())
        })
    }

    async fn complete_tool_call(&self, id: &str, outcome: &ToolCallOutcome) -> Result<bool> {
        Ok(self.write(|t| {
            match t
                .tool_calls
                .iter_mut()
                .find(|r| r.id == id && r.completed_at.is_none())
            {
                Some(record) => {
                    record.response = Some(outcome.response.clone());
                    record.error = outcome.error.clone();
                    record.duration_ms = Some(outcome.duration_ms);
                    record.completed_at = Some(Utc::now());
                    true
                }
                None => false,
            }
        }))
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append_messages(&self, session_id: &str, messages: &[SessionMessage]) -> Result<()> {
        self.write(|t| {
            t.messages
                .entry(session_id.to_string())
                .or_default()
                .extend(messages.iter().cloned());
        });
        Ok(())
    }
}

#[async_trait]
impl OpenedFileStore for InMemoryStore {
    async fn record_opened_file(&self, record: &OpenedFileRecord) -> Result<()> {
        self.write(|t| t.opened_files.push(record.clone()));
        Ok(())
    }
}

#[async_trait]
impl SummarizationLogStore for InMemoryStore {
    async fn record_summarization(&self, record: &SummarizationLogRecord) -> Result<()> {
        self.write(|t| t.summarization_logs.push(record.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::AgentType;

    fn record(id: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: id.to_string(),
            session_id: "u1-l-s0001".to_string(),
            user_id: "u1".to_string(),
            call_id: "call_1".to_string(),
            name: "current_time".to_string(),
            arguments: "{}".to_string(),
            response: None,
            error: None,
            duration_ms: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn get_missing_session_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_user() {
        let store = InMemoryStore::new();
        store
            .put(&Session::new("u1", AgentType::Low, 1))
            .await
            .unwrap();
        store
            .put(&Session::new("u1", AgentType::High, 1))
            .await
            .unwrap();
        store
            .put(&Session::new("u2", AgentType::Low, 1))
            .await
            .unwrap();

        assert_eq!(store.list("u1").await.unwrap().len(), 2);
        assert_eq!(store.list_all().await.unwrap().len(), 3);

        store.delete("u1-h-s0001").await.unwrap();
        assert_eq!(store.list("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tool_call_completes_once() {
        let store = InMemoryStore::new();
        store.insert_tool_call(&record("t1")).await.unwrap();
        assert!(store.insert_tool_call(&record("t1")).await.is_err());

        let outcome = ToolCallOutcome {
            response: "12:00".to_string(),
            error: None,
            duration_ms: 3,
        };
        assert!(store.complete_tool_call("t1", &outcome).await.unwrap());
        assert!(!store.complete_tool_call("t1", &outcome).await.unwrap());
        assert!(!store.complete_tool_call("missing", &outcome).await.unwrap());

        let saved = store.tool_calls_for("u1-l-s0001");
        assert_eq!(saved[0].response.as_deref(), Some("12:00"));
        assert_eq!(saved[0].duration_ms, Some(3));
    }
}
