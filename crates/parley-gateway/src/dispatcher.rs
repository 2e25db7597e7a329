//! Entry point for every inbound user message.
//!
//! Per user: fast-path queueing while a turn is running, then a per-user
//! mutex, moderation, session resolution, the tool loop, and a commit of the
//! finished turn. Messages that arrive while the mutex is held are merged
//! into the running turn or handled as the very next one before the user is
//! released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parley_agents::{
    ActionEvent, ActionKind, AgentProfile, PendingMessages, ToolCallLoop, Turn, TurnFailure,
    TurnInput, TurnOutcome, TurnReply,
};
use parley_common::{
    AgentType, ChatMessage, Error, PendingClarification, RequestContext, Result, Session,
    SessionMessage, StatusPhase, User,
};
use parley_db::{Stores, UserStore};
use parley_security::ModerationGate;
use tracing::{debug, info, instrument, warn};

use crate::locks::KeyedLocks;
use crate::progress::ProgressGuard;

/// Idle per-user locks are dropped once the registry grows past this.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The user already has a turn running; the message will be folded in.
    Queued,
    /// One reply per turn handled, in order. Ban and warning notices count
    /// as replies.
    Replied(Vec<String>),
}

impl DispatchOutcome {
    pub fn replies(&self) -> &[String] {
        match self {
            Self::Queued => &[],
            Self::Replied(replies) => replies,
        }
    }
}

/// Adapts the progress guard to the tool loop's view of queued messages.
struct QueuedForUser<'a> {
    progress: &'a ProgressGuard,
    user_id: &'a str,
}

impl PendingMessages for QueuedForUser<'_> {
    fn drain(&self) -> Vec<String> {
        self.progress.drain_queue(self.user_id)
    }
}

/// Clears the in-progress flag on every exit path, including errors and
/// cancellation. Declared after the mutex guard so it runs first.
struct InProgressReset<'a> {
    progress: &'a ProgressGuard,
    user_id: &'a str,
}

impl Drop for InProgressReset<'_> {
    fn drop(&mut self) {
        self.progress.set_in_progress(self.user_id, false);
    }
}

/// A turn that failed, with the user texts that still need an answer.
struct FailedTurn {
    error: Error,
    unanswered: Vec<String>,
}

impl FailedTurn {
    fn new(error: Error) -> Self {
        Self {
            error,
            unanswered: Vec::new(),
        }
    }
}

impl From<Error> for FailedTurn {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

pub struct RequestDispatcher {
    stores: Stores,
    users: Arc<dyn UserStore>,
    progress: Arc<ProgressGuard>,
    locks: KeyedLocks,
    moderation: ModerationGate,
    tool_loop: ToolCallLoop,
    profiles: HashMap<AgentType, AgentProfile>,
    default_agent: AgentType,
}

impl RequestDispatcher {
    /// `users` is the store's user capability, or a process-local stand-in
    /// when the store has none.
    pub fn new(
        stores: Stores,
        users: Arc<dyn UserStore>,
        moderation: ModerationGate,
        tool_loop: ToolCallLoop,
        profiles: Vec<AgentProfile>,
        default_agent: AgentType,
    ) -> Self {
        Self {
            stores,
            users,
            progress: Arc::new(ProgressGuard::new()),
            locks: KeyedLocks::new(),
            moderation,
            tool_loop,
            profiles: profiles.into_iter().map(|p| (p.agent_type, p)).collect(),
            default_agent,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressGuard> {
        &self.progress
    }

    pub fn default_agent(&self) -> AgentType {
        self.default_agent
    }

    pub async fn dispatch(&self, ctx: &RequestContext, text: &str) -> Result<DispatchOutcome> {
        self.dispatch_to(ctx, self.default_agent, text).await
    }

    #[instrument(skip_all, fields(user_id = %ctx.user_id, agent = %agent))]
    pub async fn dispatch_to(
        &self,
        ctx: &RequestContext,
        agent: AgentType,
        text: &str,
    ) -> Result<DispatchOutcome> {
        let user_id = ctx.user_id.as_str();
        ctx.emit(StatusPhase::Received, None);

        if self.progress.try_queue(user_id, text) {
            debug!("turn in progress, message queued");
            return Ok(DispatchOutcome::Queued);
        }

        if self.locks.len() > LOCK_PRUNE_THRESHOLD {
            self.locks.prune();
        }
        let _lock = self.locks.lock(user_id).await;
        self.progress.set_in_progress(user_id, true);
        let _reset = InProgressReset {
            progress: &self.progress,
            user_id,
        };

        // Messages left queued by an earlier failed turn go first.
        let backlog = self.progress.line_up(user_id, text);
        let mut callers_turn = backlog.is_none();
        let mut replies = Vec::new();
        let mut next = Some(backlog.unwrap_or_else(|| text.to_string()));
        while let Some(message) = next.take() {
            match self.handle_turn(ctx, agent, &message).await {
                Ok(reply) => replies.push(reply),
                Err(failed) => {
                    ctx.emit(StatusPhase::Error, Some(failed.error.to_string()));
                    let mut unanswered = failed.unanswered;
                    if !callers_turn {
                        // a queued message: nobody else will see the error
                        unanswered.insert(0, message);
                    }
                    self.progress.requeue_front(user_id, unanswered);
                    if replies.is_empty() {
                        return Err(failed.error);
                    }
                    warn!("follow-up turn failed, remaining messages stay queued: {}", failed.error);
                    break;
                }
            }
            callers_turn = false;
            next = self.progress.finish(user_id);
        }

        ctx.emit(StatusPhase::Completed, None);
        Ok(DispatchOutcome::Replied(replies))
    }

    async fn handle_turn(
        &self,
        ctx: &RequestContext,
        agent: AgentType,
        text: &str,
    ) -> std::result::Result<String, FailedTurn> {
        let mut user = self.load_user(&ctx.user_id).await?;

        ctx.emit(StatusPhase::Analyzing, None);
        let verdict = self.moderation.check(&mut user, text).await?;
        if let Some(reply) = verdict.reply() {
            info!(?verdict, "message stopped by moderation");
            return Ok(reply.to_string());
        }

        let profile = self.profile(agent)?;
        let mut session = self.resolve_session(&mut user, agent).await?;

        let (input, allow_escalation) = match session.pending_clarification.clone() {
            Some(pending) => (
                TurnInput::ClarificationAnswer {
                    tool_call_id: pending.tool_call_id,
                    answer: text.to_string(),
                },
                false,
            ),
            None => (TurnInput::User(text.to_string()), true),
        };

        let pending = QueuedForUser {
            progress: &self.progress,
            user_id: &ctx.user_id,
        };
        let result = self
            .tool_loop
            .run(Turn {
                ctx,
                session: &session,
                profile,
                input,
                pending: &pending,
                allow_escalation,
            })
            .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.save_counters(&session).await;
                return Err(failed_turn(failure));
            }
        };

        if let TurnReply::Escalate { reason, inputs } = &outcome.reply {
            // The weaker agent's messages are dropped, its IDs stay spent.
            self.save_counters(&session).await;
            return self
                .escalate(ctx, &mut user, profile, reason, inputs.clone(), &pending)
                .await;
        }

        session.pending_clarification = None;
        self.commit(&mut session, outcome).await.map_err(FailedTurn::from)
    }

    async fn escalate(
        &self,
        ctx: &RequestContext,
        user: &mut User,
        from: &AgentProfile,
        reason: &str,
        inputs: Vec<String>,
        pending: &dyn PendingMessages,
    ) -> std::result::Result<String, FailedTurn> {
        let unanswered = |error: Error| FailedTurn {
            error,
            unanswered: inputs.iter().skip(1).cloned().collect(),
        };

        let target = from.escalates_to.ok_or_else(|| {
            unanswered(Error::Agent(format!(
                "agent '{}' has no escalation target",
                from.agent_type
            )))
        })?;
        let profile = self.profile(target).map_err(unanswered)?;

        ctx.emit(
            StatusPhase::Routing,
            Some(format!("{} -> {target}", from.agent_type)),
        );
        info!(from = %from.agent_type, to = %target, %reason, "escalating request");

        let mut event = ActionEvent::new(&ctx.user_id, ActionKind::AgentRouting, target.as_str());
        if let Some(callback) = self.tool_loop.callback() {
            if let Err(text) = callback.before_action(&event).await {
                info!("escalation blocked by callback");
                return Ok(text);
            }
        }

        ctx.emit(StatusPhase::AgentCalling, Some(target.to_string()));
        let started = Instant::now();
        let mut session = self
            .resolve_session(user, target)
            .await
            .map_err(unanswered)?;
        let result = self
            .tool_loop
            .run(Turn {
                ctx,
                session: &session,
                profile,
                input: TurnInput::User(inputs.join("\n\n")),
                pending,
                allow_escalation: false,
            })
            .await;

        event.duration = started.elapsed();
        if let Ok(outcome) = &result {
            event.prompt_tokens = outcome.usage.prompt_tokens;
            event.completion_tokens = outcome.usage.completion_tokens;
        }
        if let Err(failure) = &result {
            event.error = Some(failure.error.to_string());
        }
        if let Some(callback) = self.tool_loop.callback() {
            callback.after_action(&event).await;
        }
        ctx.emit(StatusPhase::AgentDone, Some(target.to_string()));

        // The first input is the turn's own message; everything drained after
        // it, by either agent, still needs an answer.
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.save_counters(&session).await;
                return Err(FailedTurn {
                    error: failure.error,
                    unanswered: inputs.iter().skip(1).cloned().chain(failure.drained).collect(),
                });
            }
        };
        self.commit(&mut session, outcome)
            .await
            .map_err(FailedTurn::from)
    }

    /// Append the finished turn to the session and persist it. Returns the
    /// text to show the user.
    async fn commit(&self, session: &mut Session, outcome: TurnOutcome) -> Result<String> {
        let reply = match outcome.reply {
            TurnReply::Answer(text) => text,
            TurnReply::Clarification {
                tool_call_id,
                question,
            } => {
                session.pending_clarification = Some(PendingClarification {
                    tool_call_id,
                    question: question.clone(),
                });
                question
            }
            TurnReply::Escalate { .. } => {
                return Err(Error::Agent("escalation cannot be committed".into()));
            }
        };

        // IDs spent by anyone who wrote the session since it was loaded
        match self.stores.sessions.get(&session.id).await {
            Ok(current) => session.sequences.catch_up(&current.sequences),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let stored: Vec<SessionMessage> = outcome
            .messages
            .into_iter()
            .map(|message: ChatMessage| session.push_message(message).clone())
            .collect();
        session.model = Some(outcome.model);
        session.touch();

        self.stores.sessions.put(session).await?;
        if let Some(messages) = &self.stores.messages {
            messages.append_messages(&session.id, &stored).await?;
        }
        debug!(
            session_id = %session.id,
            added = stored.len(),
            iterations = outcome.iterations,
            "turn committed"
        );
        Ok(reply)
    }

    /// Persist the ID counters a turn advanced without keeping its messages.
    /// Merged into the stored copy so nothing else written meanwhile is lost.
    async fn save_counters(&self, working: &Session) {
        let saved = async {
            let stored = self.stores.sessions.get(&working.id).await?;
            stored.sequences.catch_up(&working.sequences);
            self.stores.sessions.put(&stored).await
        };
        if let Err(e) = saved.await {
            warn!(session_id = %working.id, "could not save session counters: {e}");
        }
    }

    fn profile(&self, agent: AgentType) -> Result<&AgentProfile> {
        self.profiles
            .get(&agent)
            .ok_or_else(|| Error::Config(format!("no profile configured for agent '{agent}'")))
    }

    async fn load_user(&self, user_id: &str) -> Result<User> {
        Ok(self
            .users
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| User::new(user_id)))
    }

    /// The user's active session for `agent`, adopting the newest stored one
    /// when the user record does not know it, or a new one otherwise.
    async fn resolve_session(&self, user: &mut User, agent: AgentType) -> Result<Session> {
        if let Some(id) = user.active_session(agent) {
            match self.stores.sessions.get(id).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_not_found() => {
                    warn!(session_id = %id, "active session missing from store, starting a new one");
                }
                Err(e) => return Err(e),
            }
        }

        let mut existing: Vec<(u32, Session)> = self
            .stores
            .sessions
            .list(&user.id)
            .await?
            .into_iter()
            .filter(|s| s.agent_type == agent)
            .filter_map(|s| Session::parse_seq(&s.id).map(|seq| (seq, s)))
            .collect();
        existing.sort_by_key(|(seq, _)| *seq);
        let highest = existing.last().map_or(0, |(seq, _)| *seq);

        let session = match existing.pop() {
            Some((_, latest)) if user.active_session(agent).is_none() => {
                debug!(session_id = %latest.id, "adopting stored session");
                latest
            }
            _ => {
                let known = user.session_seqs.get(&agent).copied().unwrap_or(0);
                let seq = known.max(highest) + 1;
                user.session_seqs.insert(agent, seq);
                let session = Session::new(&user.id, agent, seq);
                self.stores.sessions.put(&session).await?;
                info!(session_id = %session.id, "created session");
                session
            }
        };

        user.set_active_session(agent, session.id.clone());
        self.users.put_user(user).await?;
        Ok(session)
    }
}

fn failed_turn(failure: TurnFailure) -> FailedTurn {
    FailedTurn {
        error: failure.error,
        unanswered: failure.drained,
    }
}
