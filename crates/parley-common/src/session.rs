use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::message::{ChatMessage, SessionMessage};
use crate::types::AgentType;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SequenceCounters {
    #[serde(default)]
    message_seq: u64,
    #[serde(default)]
    tool_seq: u64,
    #[serde(default)]
    opened_file_seq: u64,
    #[serde(default)]
    summarization_log_seq: u64,
}

/// Monotonic per-session counters. Every increment happens under the internal
/// lock, so concurrent callers sharing one session never observe the same value.
#[derive(Default)]
pub struct SequenceGenerator {
    counters: Mutex<SequenceCounters>,
}

impl SequenceGenerator {
    fn next(&self, pick: impl FnOnce(&mut SequenceCounters) -> &mut u64) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = pick(&mut counters);
        *slot += 1;
        *slot
    }

    fn snapshot(&self) -> SequenceCounters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_message(&self) -> u64 {
        self.next(|c| &mut c.message_seq)
    }

    pub fn next_tool(&self) -> u64 {
        self.next(|c| &mut c.tool_seq)
    }

    pub fn next_opened_file(&self) -> u64 {
        self.next(|c| &mut c.opened_file_seq)
    }

    pub fn next_summarization_log(&self) -> u64 {
        self.next(|c| &mut c.summarization_log_seq)
    }

    pub fn message_seq(&self) -> u64 {
        self.snapshot().message_seq
    }

    pub fn tool_seq(&self) -> u64 {
        self.snapshot().tool_seq
    }

    /// Raise every counter to at least `other`'s value.
    pub fn catch_up(&self, other: &SequenceGenerator) {
        let theirs = other.snapshot();
        let mut ours = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        ours.message_seq = ours.message_seq.max(theirs.message_seq);
        ours.tool_seq = ours.tool_seq.max(theirs.tool_seq);
        ours.opened_file_seq = ours.opened_file_seq.max(theirs.opened_file_seq);
        ours.summarization_log_seq = ours.summarization_log_seq.max(theirs.summarization_log_seq);
    }
}

impl Clone for SequenceGenerator {
    fn clone(&self) -> Self {
        Self {
            counters: Mutex::new(self.snapshot()),
        }
    }
}

impl fmt::Debug for SequenceGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SequenceGenerator")
            .field(&self.snapshot())
            .finish()
    }
}

impl Serialize for SequenceGenerator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SequenceGenerator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let counters = SequenceCounters::deserialize(deserializer)?;
        Ok(Self {
            counters: Mutex::new(counters),
        })
    }
}

/// A clarification question the model asked through the deferred tool. The
/// next inbound message answers it as that tool call's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClarification {
    pub tool_call_id: String,
    pub question: String,
}

/// One conversation thread between a user and one agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub msgs: Vec<SessionMessage>,
    #[serde(default)]
    pub archived_msgs: Vec<SessionMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sequences: SequenceGenerator,
    #[serde(default)]
    pub pending_clarification: Option<PendingClarification>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub summarized_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: &str, agent_type: AgentType, seq: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Self::format_id(user_id, agent_type, seq),
            user_id: user_id.to_string(),
            agent_type,
            msgs: Vec::new(),
            archived_msgs: Vec::new(),
            model: None,
            title: None,
            summary: None,
            tags: Vec::new(),
            sequences: SequenceGenerator::default(),
            pending_clarification: None,
            created_at: now,
            updated_at: now,
            summarized_at: None,
        }
    }

    /// `{user_id}-{agent_code}-s{seq:04}`
    pub fn format_id(user_id: &str, agent_type: AgentType, seq: u32) -> String {
        format!("{user_id}-{}-s{seq:04}", agent_type.code())
    }

    /// Recover the per-user sequence number from an ID built by `format_id`.
    pub fn parse_seq(session_id: &str) -> Option<u32> {
        let (_, tail) = session_id.rsplit_once("-s")?;
        tail.parse().ok()
    }

    pub fn generate_message_id(&self) -> String {
        format!("{}-m{}", self.id, self.sequences.next_message())
    }

    pub fn generate_tool_id(&self) -> String {
        format!("{}-t{}", self.id, self.sequences.next_tool())
    }

    pub fn generate_file_id(&self) -> String {
        format!("{}-f{}", self.id, self.sequences.next_opened_file())
    }

    pub fn generate_summarization_log_id(&self) -> String {
        format!("{}-l{}", self.id, self.sequences.next_summarization_log())
    }

    /// Assign the next message ID and append to the active log.
    pub fn push_message(&mut self, message: ChatMessage) -> &SessionMessage {
        let stored = SessionMessage {
            id: self.generate_message_id(),
            message,
            created_at: Utc::now(),
        };
        self.msgs.push(stored);
        &self.msgs[self.msgs.len() - 1]
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.msgs.iter().map(|m| m.message.clone()).collect()
    }

    /// Move every active message to the archive. Returns how many moved.
    pub fn archive_active(&mut self) -> usize {
        let moved = self.msgs.len();
        self.archived_msgs.append(&mut self.msgs);
        moved
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
