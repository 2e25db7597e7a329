//! Per-key "already working on it" flag plus a FIFO of messages that arrived
//! meanwhile.
//!
//! Nothing here is persisted: messages still queued when the process stops
//! are lost, the same as an in-flight request would be.

use std::collections::VecDeque;

use dashmap::DashMap;

#[derive(Debug, Default)]
struct ProgressState {
    in_progress: bool,
    queue: VecDeque<String>,
}

/// Every operation on one key runs under that key's shard lock, so checking
/// the flag and touching the queue is atomic per key.
#[derive(Debug, Default)]
pub struct ProgressGuard {
    states: DashMap<String, ProgressState>,
}

impl ProgressGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` if `key` is busy. Returns `false` without touching the
    /// queue when it is not.
    pub fn try_queue(&self, key: &str, message: &str) -> bool {
        match self.states.get_mut(key) {
            Some(mut state) if state.in_progress => {
                state.queue.push_back(message.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn set_in_progress(&self, key: &str, in_progress: bool) {
        if in_progress {
            self.states.entry(key.to_string()).or_default().in_progress = true;
        } else {
            if let Some(mut state) = self.states.get_mut(key) {
                state.in_progress = false;
            }
            self.forget_if_idle(key);
        }
    }

    pub fn is_in_progress(&self, key: &str) -> bool {
        self.states.get(key).is_some_and(|s| s.in_progress)
    }

    /// Remove and return everything queued for `key`, oldest first.
    pub fn drain_queue(&self, key: &str) -> Vec<String> {
        self.states
            .get_mut(key)
            .map(|mut s| s.queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Put messages back at the head of the queue, keeping their order.
    pub fn requeue_front(&self, key: &str, messages: Vec<String>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.states.entry(key.to_string()).or_default();
        for message in messages.into_iter().rev() {
            state.queue.push_front(message);
        }
    }

    /// Start of a turn. With a backlog left over from an earlier turn,
    /// `message` joins the back of the queue and the oldest entry is returned
    /// to be handled first. `None` means the queue was empty and `message`
    /// goes ahead as is.
    pub fn line_up(&self, key: &str, message: &str) -> Option<String> {
        let mut state = self.states.get_mut(key)?;
        let oldest = state.queue.pop_front()?;
        state.queue.push_back(message.to_string());
        Some(oldest)
    }

    pub fn queued_len(&self, key: &str) -> usize {
        self.states.get(key).map_or(0, |s| s.queue.len())
    }

    /// End of a turn. Pops the oldest queued message for the owner to handle
    /// as its next turn, keeping the flag set; with an empty queue the flag
    /// is cleared instead. Doing both under one lock means no message can
    /// land in the queue after the owner decided to stop.
    pub fn finish(&self, key: &str) -> Option<String> {
        let next = {
            let mut state = self.states.get_mut(key)?;
            let next = state.queue.pop_front();
            if next.is_none() {
                state.in_progress = false;
            }
            next
        };
        if next.is_none() {
            self.forget_if_idle(key);
        }
        next
    }

    fn forget_if_idle(&self, key: &str) {
        self.states
            .remove_if(key, |_, s| !s.in_progress && s.queue.is_empty());
    }

    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }
}
