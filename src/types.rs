//! Shared entities that cut across components: the event vocabulary and
//! the phase enum that every other module routes on.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A session's position in the finite-state workflow (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    AssignTask,
    WorkerExecute,
    CheckProgress,
    Arbiter,
    HybridSearch,
    HumanReview,
    ExpertAnswer,
    BrowserbaseTest,
    GenerateReport,
    ExpertLearn,
    Completed,
    Failed,
}

impl Phase {
    /// Terminal phases accept no further mutation of the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::AssignTask => "assign_task",
            Phase::WorkerExecute => "worker_execute",
            Phase::CheckProgress => "check_progress",
            Phase::Arbiter => "arbiter",
            Phase::HybridSearch => "hybrid_search",
            Phase::HumanReview => "human_review",
            Phase::ExpertAnswer => "expert_answer",
            Phase::BrowserbaseTest => "browserbase_test",
            Phase::GenerateReport => "generate_report",
            Phase::ExpertLearn => "expert_learn",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Closed vocabulary of events published on the per-session bus
/// (spec.md §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    PhaseChange,
    SandboxReady,
    TaskAssigned,
    Thinking,
    Thought,
    CodeRunning,
    CodeResult,
    Completed,
    PreviewUrl,
    Error,
    Stuck,
    Escalated,
    ReviewPending,
    ExpertAnswerGenerated,
    ExpertError,
    ValidationStarted,
    ValidationComplete,
    ValidationError,
    SessionDone,
    BufferOverflow,
    SubscriberLagged,
}

/// A unit of observable progress, totally ordered within a session by
/// the monotone `seq` the Event Bus assigns on emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub session_id: Uuid,
    pub worker_id: Option<String>,
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
