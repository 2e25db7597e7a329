use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use parley_common::{Error, Result, Session, SessionMessage, User};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::migrations::MIGRATIONS;
use crate::store::{
    MessageStore, OpenedFileRecord, OpenedFileStore, SessionStore, SummarizationLogRecord,
    SummarizationLogStore, ToolCallOutcome, ToolCallRecord, ToolCallStore, UserStore,
};

/// SQLite-backed store. Sessions and users are kept as JSON documents; audit
/// records (tool calls, messages, opened files, summarization runs) get their
/// own tables.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening session store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let conn = self.conn.lock().await;
        user_version(&conn)
    }

    /// Tool-call audit rows for a session, oldest first.
    pub async fn tool_calls_for(&self, session_id: &str) -> Result<Vec<ToolCallRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, user_id, call_id, name, arguments, response, error,
                        duration_ms, created_at, completed_at
                 FROM tool_calls
                 WHERE session_id = ?1
                 ORDER BY rowid ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare tool call query: {e}")))?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                let created_raw: String = row.get(9)?;
                let completed_raw: Option<String> = row.get(10)?;
                Ok(ToolCallRecord {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    user_id: row.get(2)?,
                    call_id: row.get(3)?,
                    name: row.get(4)?,
                    arguments: row.get(5)?,
                    response: row.get(6)?,
                    error: row.get(7)?,
                    duration_ms: row.get::<_, Option<i64>>(8)?.map(|ms| ms.max(0) as u64),
                    created_at: parse_timestamp(&created_raw),
                    completed_at: completed_raw.map(|raw| parse_timestamp(&raw)),
                })
            })
            .map_err(|e| Error::Database(format!("failed to load tool calls: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(
                row.map_err(|e| Error::Database(format!("failed to read tool call row: {e}")))?,
            );
        }
        Ok(records)
    }

    /// Persisted message IDs for a session in insertion order.
    pub async fn message_ids_for(&self, session_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM messages WHERE session_id = ?1 ORDER BY rowid ASC")
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;
        let ids = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
        Ok(ids)
    }

    fn query_sessions(conn: &Connection, sql: &str, args: &[&str]) -> Result<Vec<Session>> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare session query: {e}")))?;
        let raw: Vec<String> = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| Error::Database(format!("failed to list sessions: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read session row: {e}")))?;

        let mut sessions = Vec::with_capacity(raw.len());
        for data in raw {
            match serde_json::from_str::<Session>(&data) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("skipping undecodable session row: {e}"),
            }
        }
        Ok(sessions)
    }
}

fn user_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))
        .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))
}

fn run_migrations(conn: &Connection) -> Result<()> {
    let current = user_version(conn)?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql).map_err(|e| {
            Error::Database(format!("migration {} failed: {e}", migration.name))
        })?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration.version))
            .map_err(|e| Error::Database(format!("failed to bump schema version: {e}")))?;
        info!(
            "applied store migration {} ({})",
            migration.version, migration.name
        );
    }
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Session> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load session: {e}")))?;

        let data = data.ok_or_else(|| Error::NotFound(format!("session '{id}'")))?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn put(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_string(session)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (id, user_id, agent_type, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               data = excluded.data,
               updated_at = excluded.updated_at",
            params![
                session.id,
                session.user_id,
                session.agent_type.as_str(),
                data,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(format!("failed to upsert session: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(|e| Error::Database(format!("failed to delete session: {e}")))?;
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        Self::query_sessions(
            &conn,
            "SELECT data FROM sessions WHERE user_id = ?1 ORDER BY created_at ASC, id ASC",
            &[user_id],
        )
    }

    async fn list_all(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        Self::query_sessions(&conn, "SELECT data FROM sessions ORDER BY id ASC", &[])
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row("SELECT data FROM users WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::Database(format!("failed to load user: {e}")))?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put_user(&self, user: &User) -> Result<()> {
        let data = serde_json::to_string(user)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![user.id, data, user.updated_at.to_rfc3339()],
        )
        .map_err(|e| Error::Database(format!("failed to upsert user: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ToolCallStore for SqliteStore {
    async fn insert_tool_call(&self, record: &ToolCallRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tool_calls (id, session_id, user_id, call_id, name, arguments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.session_id,
                record.user_id,
                record.call_id,
                record.name,
                record.arguments,
                record.created_at.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert tool call: {e}")))?;
        Ok(())
    }

    async fn complete_tool_call(&self, id: &str, outcome: &ToolCallOutcome) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tool_calls
                 SET response = ?2, error = ?3, duration_ms = ?4, completed_at = ?5
                 WHERE id = ?1 AND completed_at IS NULL",
                params![
                    id,
                    outcome.response,
                    outcome.error,
                    outcome.duration_ms as i64,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to complete tool call: {e}")))?;
        Ok(rows > 0)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append_messages(&self, session_id: &str, messages: &[SessionMessage]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        for stored in messages {
            let tool_calls = if stored.message.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&stored.message.tool_calls)?)
            };
            tx.execute(
                "INSERT OR IGNORE INTO messages
                   (id, session_id, role, content, tool_calls, tool_call_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stored.id,
                    session_id,
                    stored.message.role.as_str(),
                    stored.message.content,
                    tool_calls,
                    stored.message.tool_call_id,
                    stored.created_at.to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;
        }
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit messages: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl OpenedFileStore for SqliteStore {
    async fn record_opened_file(&self, record: &OpenedFileRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO opened_files (id, session_id, path, opened_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.session_id,
                record.path,
                record.opened_at.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(format!("failed to record opened file: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SummarizationLogStore for SqliteStore {
    async fn record_summarization(&self, record: &SummarizationLogRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO summarization_logs (id, session_id, archived_count, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.session_id,
                record.archived_count as i64,
                record.summary,
                record.created_at.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(format!("failed to record summarization: {e}")))?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
