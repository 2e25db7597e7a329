//! Admission filter for meaningless input with escalating bans.
//!
//! Per user the state moves `Clean -> Warned(n) -> Banned(duration)`. The
//! heuristic in [`crate::heuristics`] runs on every message; a model-backed
//! [`NonsenseVerifier`] is consulted only for users who already have a strike.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parley_common::{Result, User};
use parley_config::ModerationConfig;
use parley_db::UserStore;
use tracing::{debug, info, warn};

use crate::heuristics::detect_nonsense;

/// Second opinion on a message the heuristic flagged.
#[async_trait]
pub trait NonsenseVerifier: Send + Sync {
    /// `Ok(true)` confirms the message is nonsense.
    async fn is_nonsense(&self, text: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationVerdict {
    Allowed,
    /// Confirmed nonsense below the first ban threshold.
    Warned { count: u32, message: String },
    /// This message pushed the user over a threshold.
    Banned {
        count: u32,
        until: DateTime<Utc>,
        message: String,
    },
    /// A ban was already in force; nothing else was evaluated.
    AlreadyBanned { message: String },
}

impl ModerationVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Text to send back instead of an agent answer.
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Warned { message, .. }
            | Self::Banned { message, .. }
            | Self::AlreadyBanned { message } => Some(message),
        }
    }
}

pub struct ModerationGate {
    config: ModerationConfig,
    users: Arc<dyn UserStore>,
    verifier: Option<Arc<dyn NonsenseVerifier>>,
}

impl ModerationGate {
    pub fn new(
        config: ModerationConfig,
        users: Arc<dyn UserStore>,
        verifier: Option<Arc<dyn NonsenseVerifier>>,
    ) -> Self {
        Self {
            config,
            users,
            verifier,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn check(&self, user: &mut User, text: &str) -> Result<ModerationVerdict> {
        self.check_at(user, text, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        user: &mut User,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ModerationVerdict> {
        if !self.config.enabled {
            return Ok(ModerationVerdict::Allowed);
        }

        if user.is_banned {
            if user.ban_active_at(now) {
                let message = user
                    .ban_message
                    .clone()
                    .unwrap_or_else(|| self.config.ban_message.replace("{hours}", "?"));
                return Ok(ModerationVerdict::AlreadyBanned { message });
            }
            debug!(user_id = %user.id, "ban expired");
            user.lift_ban();
            self.users.put_user(user).await?;
        }

        if !self.is_confirmed_nonsense(user, text).await {
            if user.nonsense_count > 0 {
                user.nonsense_count = 0;
                user.updated_at = now;
                self.users.put_user(user).await?;
            }
            return Ok(ModerationVerdict::Allowed);
        }

        user.nonsense_count += 1;
        user.last_nonsense_time = Some(now);
        user.updated_at = now;
        let count = user.nonsense_count;

        let verdict = match self.ban_hours_for(count) {
            Some(hours) => {
                let until = now + Duration::hours(i64::from(hours));
                let message = self.config.ban_message.replace("{hours}", &hours.to_string());
                user.ban(Some(until), message.clone());
                info!(user_id = %user.id, count, hours, "user banned for nonsense");
                ModerationVerdict::Banned {
                    count,
                    until,
                    message,
                }
            }
            None => ModerationVerdict::Warned {
                count,
                message: self.config.warning_message.clone(),
            },
        };
        self.users.put_user(user).await?;
        Ok(verdict)
    }

    async fn is_confirmed_nonsense(&self, user: &User, text: &str) -> bool {
        let Some(signal) = detect_nonsense(text) else {
            return false;
        };
        if user.nonsense_count == 0 {
            debug!(user_id = %user.id, signal = signal.as_str(), "first heuristic flag");
            return true;
        }
        let Some(verifier) = &self.verifier else {
            return true;
        };
        match verifier.is_nonsense(text).await {
            Ok(confirmed) => {
                debug!(user_id = %user.id, signal = signal.as_str(), confirmed, "verifier ruled");
                confirmed
            }
            Err(e) => {
                warn!(user_id = %user.id, "nonsense verifier failed, keeping heuristic flag: {e}");
                true
            }
        }
    }

    /// Longest ban whose threshold `count` has reached.
    fn ban_hours_for(&self, count: u32) -> Option<u32> {
        self.config
            .thresholds
            .iter()
            .filter(|t| count >= t.count)
            .map(|t| t.ban_hours)
            .max()
    }
}
