//! Session and Worker entities (spec.md §3).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::expert::ExpertQuery;
use crate::types::Phase;

/// Cap on `Worker::recent_errors` — oldest evicted on overflow.
pub const RECENT_ERRORS_CAP: usize = 5;

/// A single append-only step in a worker's action log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAction {
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub description: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl WorkerAction {
    /// `action_type:description[:50]` — the signature the Arbiter and
    /// Repetition breaker compare for distinctness (spec.md §4.3, §4.5).
    pub fn signature(&self) -> String {
        let truncated: String = self.description.chars().take(50).collect();
        format!("{:?}:{truncated}", self.action_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    LlmPlan,
    CodeExecution,
    LlmError,
    ExpertGuidance,
}

/// A role-tagged conversation turn replayed into the next model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Structured result a worker produced on its last successful code run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub code: String,
    pub output: String,
    pub thought: String,
    pub preview_urls: Vec<String>,
}

/// One of the heterogeneous model-driven agents in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub profile: WorkerProfile,
    pub subtask: String,
    pub conversation: Vec<Message>,
    pub actions: Vec<WorkerAction>,
    pub recent_errors: VecDeque<String>,
    pub llm_confidence: f64,
    pub minutes_without_progress: f64,
    pub sandbox_handle: Option<String>,
    pub output: Option<WorkerOutput>,
    pub completed: bool,
    pub stuck: bool,
}

/// Model identifier plus an expertise tag (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub model: String,
    pub expertise: String,
}

impl Worker {
    pub fn new(id: impl Into<String>, profile: WorkerProfile, subtask: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            profile,
            subtask: subtask.into(),
            conversation: Vec::new(),
            actions: Vec::new(),
            recent_errors: VecDeque::new(),
            llm_confidence: 0.7,
            minutes_without_progress: 0.0,
            sandbox_handle: None,
            output: None,
            completed: false,
            stuck: false,
        }
    }

    /// Push an error onto the ring, evicting the oldest beyond the cap
    /// (spec.md §3 invariant on `Worker`).
    pub fn push_error(&mut self, error: impl Into<String>) {
        if self.recent_errors.len() >= RECENT_ERRORS_CAP {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error.into());
    }

    pub fn push_action(&mut self, action: WorkerAction) {
        self.actions.push(action);
    }

    /// Last `n` action signatures, most recent last.
    pub fn last_signatures(&self, n: usize) -> Vec<String> {
        self.actions
            .iter()
            .rev()
            .take(n)
            .map(WorkerAction::signature)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}

/// One end-to-end run of the orchestrator on a single user task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub task: String,
    pub phase: Phase,
    pub workers: Vec<Worker>,
    pub queries: Vec<ExpertQuery>,
    pub shared_memory: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub budget_note: Option<String>,
}

impl Session {
    pub fn new(task: impl Into<String>, workers: Vec<Worker>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            phase: Phase::Init,
            workers,
            queries: Vec::new(),
            shared_memory: Vec::new(),
            created_at: now,
            updated_at: now,
            budget_note: None,
        }
    }

    /// Move to `to`. Callers are responsible for checking the edge is
    /// legal (the Phase Engine is the only caller); terminal phases
    /// reject all further transitions.
    pub fn transition(&mut self, to: Phase, now: DateTime<Utc>) {
        debug_assert!(!self.phase.is_terminal(), "mutating a terminal session");
        self.phase = to;
        self.updated_at = now;
    }

    pub fn worker_mut(&mut self, id: &str) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> WorkerProfile {
        WorkerProfile { model: "test-model".into(), expertise: "general".into() }
    }

    #[test]
    fn recent_errors_caps_at_five() {
        let mut w = Worker::new("junior", profile(), "do a thing");
        for i in 0..8 {
            w.push_error(format!("err-{i}"));
        }
        assert_eq!(w.recent_errors.len(), RECENT_ERRORS_CAP);
        assert_eq!(w.recent_errors.front().unwrap(), "err-3");
        assert_eq!(w.recent_errors.back().unwrap(), "err-7");
    }

    #[test]
    fn action_signature_truncates_description() {
        let action = WorkerAction {
            timestamp: Utc::now(),
            action_type: ActionType::LlmPlan,
            description: "x".repeat(100),
            result: None,
            error: None,
        };
        let sig = action.signature();
        assert!(sig.len() < 100);
    }
}
