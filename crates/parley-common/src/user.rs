use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AgentType;

/// Ban and routing state for one end user, independent of any session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub is_banned: bool,
    /// `None` while banned means the ban never expires.
    #[serde(default)]
    pub ban_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ban_message: Option<String>,
    #[serde(default)]
    pub nonsense_count: u32,
    #[serde(default)]
    pub last_nonsense_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_session_ids: HashMap<AgentType, String>,
    #[serde(default)]
    pub session_seqs: HashMap<AgentType, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            is_banned: false,
            ban_until: None,
            ban_message: None,
            nonsense_count: 0,
            last_nonsense_time: None,
            active_session_ids: HashMap::new(),
            session_seqs: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A ban is current iff the flag is set and it is permanent or not yet expired.
    pub fn ban_active_at(&self, now: DateTime<Utc>) -> bool {
        self.is_banned && self.ban_until.is_none_or(|until| now < until)
    }

    pub fn ban(&mut self, until: Option<DateTime<Utc>>, message: impl Into<String>) {
        self.is_banned = true;
        self.ban_until = until;
        self.ban_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn lift_ban(&mut self) {
        self.is_banned = false;
        self.ban_until = None;
        self.ban_message = None;
        self.updated_at = Utc::now();
    }

    /// Advance and return this user's session sequence for `agent_type`.
    pub fn next_session_seq(&mut self, agent_type: AgentType) -> u32 {
        let seq = self.session_seqs.entry(agent_type).or_insert(0);
        *seq += 1;
        *seq
    }

    pub fn active_session(&self, agent_type: AgentType) -> Option<&str> {
        self.active_session_ids.get(&agent_type).map(String::as_str)
    }

    pub fn set_active_session(&mut self, agent_type: AgentType, session_id: impl Into<String>) {
        self.active_session_ids.insert(agent_type, session_id.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn permanent_ban_is_always_active() {
        let mut user = User::new("u1");
        user.ban(None, "banned");
        assert!(user.ban_active_at(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn timed_ban_expires() {
        let mut user = User::new("u1");
        let now = Utc::now();
        user.ban(Some(now + Duration::hours(1)), "cool off");
        assert!(user.ban_active_at(now));
        assert!(!user.ban_active_at(now + Duration::hours(1)));
    }

    #[test]
    fn flag_without_ban_is_inactive() {
        let user = User::new("u1");
        assert!(!user.ban_active_at(Utc::now()));
    }

    #[test]
    fn session_seqs_are_per_agent_type() {
        let mut user = User::new("u1");
        assert_eq!(user.next_session_seq(AgentType::Low), 1);
        assert_eq!(user.next_session_seq(AgentType::Low), 2);
        assert_eq!(user.next_session_seq(AgentType::High), 1);
    }
}
