//! External collaborator interfaces (spec.md §6.2-§6.4) and the
//! `SessionContext` dependency-injection root that wires them together
//! with the in-core components. No global singletons: every component
//! takes its context, or the specific handle it needs, by reference
//! (spec.md §9 design note on the cyclic owner graph).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::breakers::CircuitBreakers;
use crate::cache::KnowledgeCache;
use crate::config::OrchestratorConfig;
use crate::cost::CostController;
use crate::error::OrchestratorResult;
use crate::event_bus::EventBus;
use crate::review::ReviewGate;

/// Opaque handle to a running sandbox.
pub type SandboxHandle = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub exit_code: i32,
}

/// Isolated code-execution environment (spec.md §6.2). Consumed, never
/// implemented by the core.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, name: &str, language: &str) -> OrchestratorResult<SandboxHandle>;
    async fn exec(&self, handle: &SandboxHandle, cmd: &str) -> OrchestratorResult<ExecResult>;
    async fn upload(&self, handle: &SandboxHandle, path: &str, bytes: &[u8]) -> OrchestratorResult<()>;
    async fn preview_url(&self, handle: &SandboxHandle, port: u16) -> OrchestratorResult<Option<String>>;
    async fn find_by_name(&self, name: &str) -> OrchestratorResult<Option<SandboxHandle>>;
    async fn delete(&self, handle: &SandboxHandle) -> OrchestratorResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub usage: ModelUsage,
}

/// Chat-completions-compatible model inference endpoint (spec.md §6.3).
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn create(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> OrchestratorResult<ModelResponse>;
}

/// Prompt-refinement sub-system (spec.md §6.4). Specified only at its
/// interface; the learning internals are out of scope here.
#[async_trait]
pub trait LearningStore: Send + Sync {
    async fn track_answer(&self, query: &str, answer: &str, initial_confidence: f64) -> OrchestratorResult<String>;
    async fn evaluate(&self, answer_id: &str, outcome: LearningOutcome) -> OrchestratorResult<f64>;
    async fn get_context(&self, category: &str) -> OrchestratorResult<String>;
}

/// Inputs to the effectiveness formula in spec.md §6.4.
#[derive(Debug, Clone, Copy)]
pub struct LearningOutcome {
    pub success: bool,
    pub time_to_resolution_secs: f64,
    pub follow_up_count: u32,
    pub final_confidence: f64,
}

/// The dependency-injection root every phase-node function takes by
/// reference. Owns `Arc` handles so it can be cheaply cloned across
/// concurrent worker tasks while keeping single-writer discipline on
/// the ledger and the event buffer (spec.md §5).
pub struct SessionContext {
    pub config: OrchestratorConfig,
    pub events: Arc<EventBus>,
    pub cost: Arc<CostController>,
    pub breakers: Arc<CircuitBreakers>,
    pub cache: Arc<KnowledgeCache>,
    pub review: Arc<ReviewGate>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub model: Arc<dyn ModelClient>,
    pub learning: Arc<dyn LearningStore>,
}

// --- §6.1 inbound control surface: DTOs only, no transport binding ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub task: String,
    pub task_markdown: Option<String>,
    pub budget_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: uuid::Uuid,
    pub status: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: String,
    pub completed: bool,
    pub stuck: bool,
    pub action_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: uuid::Uuid,
    pub phase: String,
    pub workers: Vec<WorkerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummaryResponse {
    pub total_usd: f64,
    pub by_category: std::collections::HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecisionRequest {
    pub review_id: String,
    pub decision: String,
    pub reviewer_id: String,
    pub corrected_answer: Option<String>,
    pub reason: Option<String>,
}
