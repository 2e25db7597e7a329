//! Periodic archival of long, recently active sessions.
//!
//! The scheduler runs without the per-user locks. Its copy of a session is
//! read at the start of a pass and the summary takes a model call, so the
//! session is read again right before writing. If a turn committed in
//! between, the session is skipped until the next tick rather than written
//! back over that turn. A commit landing between the re-read and the write
//! can still be lost, as can an archival overwritten by a turn that loaded
//! the session before it.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_agents::{LlmProvider, LlmRequest};
use parley_common::{ChatMessage, Error, Result, Session};
use parley_config::SummarizationConfig;
use parley_db::{SessionStore, Stores, SummarizationLogRecord, SummarizationLogStore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUMMARY_PROMPT: &str = "You maintain running summaries of chat conversations. \
Write a short plain-text summary of the conversation below: who wants what, decisions made, \
open questions. If a previous summary is given, fold it in. Reply with the summary only.";

const TITLE_PROMPT: &str = "Give the conversation below a title of at most six words. \
Reply with the title only, no quotes.";

const TITLE_MAX_TOKENS: u32 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummarizationReport {
    pub scanned: usize,
    pub summarized: usize,
    /// Changed by a turn while its summary was being written.
    pub skipped: usize,
    pub failed: usize,
}

enum Archival {
    Archived,
    Superseded,
}

pub struct SummarizationScheduler {
    sessions: Arc<dyn SessionStore>,
    logs: Option<Arc<dyn SummarizationLogStore>>,
    provider: Arc<dyn LlmProvider>,
    config: SummarizationConfig,
    model: String,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl SummarizationScheduler {
    /// `default_model` is used when the config names no summarization model.
    pub fn new(
        stores: &Stores,
        provider: Arc<dyn LlmProvider>,
        config: SummarizationConfig,
        default_model: impl Into<String>,
    ) -> Self {
        let model = config.model.clone().unwrap_or_else(|| default_model.into());
        Self {
            sessions: Arc::clone(&stores.sessions),
            logs: stores.summarization_logs.clone(),
            provider,
            config,
            model,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Spawn the periodic loop. Only the first call spawns; later calls
    /// return `None`. The first pass runs immediately.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("summarization scheduler already started");
            return None;
        }

        let this = Arc::clone(self);
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(interval_secs = period.as_secs(), "summarization scheduler started");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.run_once().await {
                            Ok(report) if report.summarized > 0 || report.failed > 0 => {
                                info!(?report, "summarization pass finished");
                            }
                            Ok(_) => {}
                            Err(e) => warn!("summarization pass failed: {e}"),
                        }
                    }
                }
            }
            info!("summarization scheduler stopped");
        }))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_eligible(&self, session: &Session, now: DateTime<Utc>) -> bool {
        // archiving would orphan the question's tool call
        if session.msgs.len() < self.config.min_messages
            || session.pending_clarification.is_some()
        {
            return false;
        }
        let fresh_summary = session
            .summarized_at
            .is_some_and(|at| now - at < seconds(self.config.staleness_secs));
        let recently_active = now - session.updated_at <= seconds(self.config.recency_secs);
        !fresh_summary && recently_active
    }

    /// One scan over every stored session. Failures on individual sessions
    /// are logged and counted; only a failed listing aborts the pass.
    pub async fn run_once(&self) -> Result<SummarizationReport> {
        let now = Utc::now();
        let sessions = self.sessions.list_all().await?;
        let mut report = SummarizationReport {
            scanned: sessions.len(),
            ..Default::default()
        };

        for mut session in sessions {
            if !self.is_eligible(&session, now) {
                continue;
            }
            match self.summarize(&mut session).await {
                Ok(Archival::Archived) => report.summarized += 1,
                Ok(Archival::Superseded) => {
                    report.skipped += 1;
                    debug!(session_id = %session.id, "session changed during summarization, skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(session_id = %session.id, "summarization failed: {e}");
                }
            }
        }
        Ok(report)
    }

    async fn summarize(&self, session: &mut Session) -> Result<Archival> {
        let transcript = render_transcript(session);

        let mut input = String::new();
        if let Some(previous) = session.summary.as_deref() {
            let _ = writeln!(input, "Previous summary:\n{previous}\n");
        }
        input.push_str(&transcript);

        let summary = self
            .complete(SUMMARY_PROMPT, input, self.config.max_summary_tokens)
            .await?;
        if summary.is_empty() {
            return Err(Error::Agent(format!(
                "empty summary for session {}",
                session.id
            )));
        }

        if session.title.is_none() {
            match self.complete(TITLE_PROMPT, transcript, TITLE_MAX_TOKENS).await {
                Ok(title) if !title.is_empty() => session.title = Some(title),
                Ok(_) => {}
                Err(e) => debug!(session_id = %session.id, "title generation failed: {e}"),
            }
        }

        let current = self.sessions.get(&session.id).await?;
        if current.updated_at != session.updated_at
            || current.msgs.len() != session.msgs.len()
            || current.pending_clarification.is_some()
        {
            return Ok(Archival::Superseded);
        }
        session.sequences.catch_up(&current.sequences);

        let log_id = session.generate_summarization_log_id();
        let archived = session.archive_active();
        let now = Utc::now();
        session.summary = Some(summary.clone());
        session.summarized_at = Some(now);
        session.updated_at = now;
        self.sessions.put(session).await?;

        if let Some(logs) = &self.logs {
            logs.record_summarization(&SummarizationLogRecord {
                id: log_id,
                session_id: session.id.clone(),
                archived_count: archived,
                summary,
                created_at: now,
            })
            .await?;
        }
        info!(session_id = %session.id, archived, "session archived");
        Ok(Archival::Archived)
    }

    async fn complete(&self, system: &str, input: String, max_tokens: u32) -> Result<String> {
        let mut request = LlmRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(system), ChatMessage::user(input)],
        );
        request.max_tokens = Some(max_tokens);
        request.temperature = Some(0.2);
        let response = self.provider.create_chat_completion(&request).await?;
        Ok(response.text().trim().trim_matches('"').to_string())
    }
}

impl Drop for SummarizationScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Flatten the active log to `role: text` lines. Tool traffic is included
/// so the summary can mention what was looked up.
fn render_transcript(session: &Session) -> String {
    let mut out = String::new();
    for stored in &session.msgs {
        let message = &stored.message;
        if message.content.trim().is_empty() {
            for call in &message.tool_calls {
                let _ = writeln!(out, "assistant called {}({})", call.name, call.arguments);
            }
            continue;
        }
        let _ = writeln!(out, "{}: {}", message.role.as_str(), message.content.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use parley_common::{AgentType, ToolCall};
    use parley_db::InMemoryStore;

    use super::*;

    struct Silent;

    #[async_trait::async_trait]
    impl LlmProvider for Silent {
        fn provider_id(&self) -> &str {
            "silent"
        }

        async fn create_chat_completion(
            &self,
            _request: &LlmRequest,
        ) -> Result<parley_agents::LlmResponse> {
            Err(Error::provider("silent", "unused"))
        }
    }

    fn scheduler() -> SummarizationScheduler {
        let stores = Stores::full(Arc::new(InMemoryStore::new()));
        SummarizationScheduler::new(&stores, Arc::new(Silent), SummarizationConfig::default(), "m")
    }

    fn session_with(count: usize, idle: chrono::Duration, now: DateTime<Utc>) -> Session {
        let mut session = Session::new("u", AgentType::Low, 1);
        for i in 0..count {
            session.push_message(ChatMessage::user(format!("message {i}")));
        }
        session.updated_at = now - idle;
        session
    }

    #[test]
    fn eligibility_thresholds() {
        let s = scheduler();
        let now = Utc::now();
        let ten_min = chrono::Duration::minutes(10);

        assert!(!s.is_eligible(&session_with(19, ten_min, now), now));
        assert!(s.is_eligible(&session_with(20, ten_min, now), now));
        assert!(!s.is_eligible(&session_with(20, chrono::Duration::hours(2), now), now));
    }

    #[test]
    fn recent_summary_blocks_resummarizing() {
        let s = scheduler();
        let now = Utc::now();
        let mut session = session_with(25, chrono::Duration::minutes(1), now);

        session.summarized_at = Some(now - chrono::Duration::minutes(30));
        assert!(!s.is_eligible(&session, now));

        session.summarized_at = Some(now - chrono::Duration::hours(2));
        assert!(s.is_eligible(&session, now));
    }

    #[test]
    fn open_question_blocks_archival() {
        let s = scheduler();
        let now = Utc::now();
        let mut session = session_with(20, chrono::Duration::minutes(5), now);
        session.pending_clarification = Some(parley_common::PendingClarification {
            tool_call_id: "c9".into(),
            question: "Which city?".into(),
        });
        assert!(!s.is_eligible(&session, now));

        session.pending_clarification = None;
        assert!(s.is_eligible(&session, now));
    }

    #[test]
    fn transcript_includes_tool_calls() {
        let mut session = Session::new("u", AgentType::High, 1);
        session.push_message(ChatMessage::user("what time is it?"));
        session.push_message(ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "current_time".into(),
                arguments: "{}".into(),
            }],
        ));
        session.push_message(ChatMessage::tool_result("c1", "12:00"));
        session.push_message(ChatMessage::assistant("It's noon."));

        let text = render_transcript(&session);
        assert_eq!(
            text,
            "user: what time is it?\nassistant called current_time({})\ntool: 12:00\nassistant: It's noon.\n"
        );
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let s = Arc::new(scheduler());
        let first = s.start();
        assert!(first.is_some());
        assert!(s.start().is_none());
        assert!(s.is_running());

        s.stop();
        first.unwrap().await.unwrap();
        assert!(!s.is_running());
    }
}
