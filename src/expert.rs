//! Expert Driver (C7) and the query/answer types it produces and
//! consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::cache::SearchHit;
use crate::context::{ChatMessage, ModelClient, LearningOutcome, LearningStore};
use crate::error::OrchestratorResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    DocumentationGap,
    ApiError,
    ConceptualBlock,
    BugSuspected,
    ClarificationNeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertQuery {
    pub query_id: Uuid,
    pub question: String,
    pub worker_id: String,
    pub worker_context: String,
    pub category: String,
    pub issue_type: IssueType,
    pub urgency_score: f64,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
    pub cache_results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertAnswer {
    pub answer_id: Uuid,
    pub query_id: Uuid,
    pub content: String,
    pub estimated_confidence: f64,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

const EXPERT_SYSTEM_PROMPT: &str =
    "You are a senior engineer helping an AI coding agent that is stuck. \
     Answer precisely and give a concrete next step.";

const EXPERT_MODEL: &str = "claude-3-5-sonnet";
const EXPERT_TEMPERATURE: f32 = 0.2;

/// Generates answers for escalated queries, injecting learned context
/// and tracking the outcome through the Learning interface (spec.md
/// §4.7).
pub struct ExpertDriver {
    model: std::sync::Arc<dyn ModelClient>,
    learning: std::sync::Arc<dyn LearningStore>,
}

impl ExpertDriver {
    pub fn new(model: std::sync::Arc<dyn ModelClient>, learning: std::sync::Arc<dyn LearningStore>) -> Self {
        Self { model, learning }
    }

    #[instrument(skip(self, query))]
    pub async fn answer(&self, query: &ExpertQuery) -> OrchestratorResult<(ExpertAnswer, String)> {
        let learned_context = self.learning.get_context(&query.category).await.unwrap_or_default();

        let mut messages = vec![ChatMessage { role: "system".into(), content: EXPERT_SYSTEM_PROMPT.into() }];
        if !learned_context.is_empty() {
            messages.push(ChatMessage { role: "system".into(), content: learned_context });
        }
        messages.push(ChatMessage {
            role: "user".into(),
            content: format!("{}\n\n{}", query.question, query.worker_context),
        });

        let response = self.model.create(EXPERT_MODEL, &messages, EXPERT_TEMPERATURE, None).await?;

        // Heuristic confidence estimate; a real deployment might swap in
        // a classifier here without changing the driver's shape.
        let estimated_confidence = 0.7;

        let answer_id = self
            .learning
            .track_answer(&query.question, &response.content, estimated_confidence)
            .await?;

        let answer = ExpertAnswer {
            answer_id: Uuid::new_v4(),
            query_id: query.query_id,
            content: response.content,
            estimated_confidence,
            model_used: EXPERT_MODEL.to_string(),
            timestamp: Utc::now(),
        };

        Ok((answer, answer_id))
    }

    /// Reports the realized outcome of an answer back to Learning, per
    /// the effectiveness formula in spec.md §6.4.
    pub async fn track_outcome(&self, answer_id: &str, outcome: LearningOutcome) -> OrchestratorResult<f64> {
        self.learning.evaluate(answer_id, outcome).await
    }
}
