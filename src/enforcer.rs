//! Task-completion enforcement.
//!
//! The upstream agent loop does not reliably call its completion tool before
//! stopping: it can end a turn with pending to-do items, or stop without
//! having done anything at all. This tracker closes that gap
//! deterministically — at every step boundary it decides whether the task is
//! genuinely finished or the session must be re-engaged with a continuation
//! prompt.

use crate::protocol::{StepFinishReason, TodoItem};

/// Consecutive continuation prompts allowed before the enforcer gives up and
/// finalizes anyway. Observed tool activity resets the budget; this only
/// bounds an agent that stops repeatedly without making progress.
pub const MAX_CONSECUTIVE_CONTINUATIONS: u32 = 3;

/// Verdict for one step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepVerdict {
    /// Mid-turn; no completion decision yet.
    Continue,
    /// The task is done.
    Complete,
    /// The agent stopped prematurely; re-engage it with a continuation
    /// prompt instead of finalizing.
    RequestContinuation,
}

#[derive(Debug, Default)]
pub struct CompletionEnforcer {
    tools_used: bool,
    completion_detected: bool,
    todos: Vec<TodoItem>,
    pending_continuation: bool,
    continuations_sent: u32,
}

impl CompletionEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that some tool ran this turn. Also counts as progress, so the
    /// continuation budget resets.
    pub fn mark_tools_used(&mut self) {
        self.tools_used = true;
        self.pending_continuation = false;
        self.continuations_sent = 0;
    }

    /// Record that the designated completion tool was invoked.
    pub fn set_completion_detected(&mut self) {
        self.completion_detected = true;
    }

    pub fn completion_detected(&self) -> bool {
        self.completion_detected
    }

    /// Replace the to-do snapshot with the latest one declared by the agent.
    pub fn update_todos(&mut self, todos: Vec<TodoItem>) {
        self.todos = todos;
    }

    pub fn has_incomplete_todos(&self) -> bool {
        self.todos.iter().any(|todo| !todo.is_complete())
    }

    /// Decide what happens at a step boundary.
    ///
    /// `error` reasons never reach here — the adapter finalizes those
    /// directly. Unknown reasons mean the agent did stop, so they are
    /// treated like `stop`.
    pub fn handle_step_finish(&mut self, reason: StepFinishReason) -> StepVerdict {
        match reason {
            StepFinishReason::ToolUse => StepVerdict::Continue,
            StepFinishReason::Error => StepVerdict::Complete,
            StepFinishReason::Stop | StepFinishReason::EndTurn | StepFinishReason::Unknown => {
                if self.completion_detected {
                    return StepVerdict::Complete;
                }
                let idle_turn = !self.tools_used;
                if (self.has_incomplete_todos() || idle_turn)
                    && self.continuations_sent < MAX_CONSECUTIVE_CONTINUATIONS
                {
                    self.pending_continuation = true;
                    self.continuations_sent += 1;
                    // The continuation opens a fresh turn.
                    self.tools_used = false;
                    tracing::debug!(
                        continuations = self.continuations_sent,
                        idle_turn,
                        "Premature stop detected, requesting continuation"
                    );
                    return StepVerdict::RequestContinuation;
                }
                if self.continuations_sent >= MAX_CONSECUTIVE_CONTINUATIONS {
                    tracing::warn!(
                        "Continuation budget exhausted after {} attempts, finalizing",
                        self.continuations_sent
                    );
                }
                StepVerdict::Complete
            }
        }
    }

    pub fn pending_continuation(&self) -> bool {
        self.pending_continuation
    }

    /// Clear all flags and snapshots for a new task.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
