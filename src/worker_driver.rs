//! Worker Driver (C6): one execution step for a worker — prompt build,
//! model call, parse, optional sandbox submission, state update.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::instrument;

use crate::context::{ChatMessage, ModelClient, SandboxProvider};
use crate::cost::{CostCategory, CostController};
use crate::error::OrchestratorResult;
use crate::event_bus::EventBus;
use crate::session::{ActionType, Message, Role, Worker, WorkerAction, WorkerOutput};
use crate::types::EventType;

const WORKER_SYSTEM_PROMPT: &str =
    "You are a software engineer working inside an isolated sandbox. \
     Respond with a THOUGHT section, an optional fenced CODE block, and \
     a CONFIDENCE score between 0 and 1.";

const TEMPERATURE: f32 = 0.7;
pub(crate) const MAX_TOKENS: u32 = 2048;

/// Ports checked for a live preview after a successful run (spec.md
/// §4.6 step 5).
const PREVIEW_PORTS: [u16; 7] = [8080, 3000, 5000, 8000, 4000, 5173, 8888];

static THOUGHT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)THOUGHT:\s*(.*?)(?:CODE:|CONFIDENCE:|$)").unwrap());
static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\n(.*?)```").unwrap());
static CONFIDENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)CONFIDENCE:\s*([0-9]*\.?[0-9]+)").unwrap());

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub thought: String,
    pub code: String,
    pub confidence: f64,
}

/// Parses a model response into `{thought, code, confidence}`. Malformed
/// output yields empty fields and `confidence = 0.5`; any parsed
/// confidence is clamped to `[0, 1]` (spec.md §4.6 step 3, §9).
pub fn parse_response(content: &str) -> ParsedResponse {
    let thought = THOUGHT_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let code = CODE_FENCE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let confidence = CONFIDENCE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.5);

    ParsedResponse { thought, code, confidence }
}

pub struct WorkerDriver {
    model: Arc<dyn ModelClient>,
    sandbox: Arc<dyn SandboxProvider>,
    events: Arc<EventBus>,
    cost: Arc<CostController>,
}

impl WorkerDriver {
    pub fn new(
        model: Arc<dyn ModelClient>,
        sandbox: Arc<dyn SandboxProvider>,
        events: Arc<EventBus>,
        cost: Arc<CostController>,
    ) -> Self {
        Self { model, sandbox, events, cost }
    }

    /// One execution step for `worker` against `subtask` (spec.md §4.6).
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    pub async fn step(&self, session_id: uuid::Uuid, worker: &mut Worker, subtask: &str) -> OrchestratorResult<()> {
        let mut messages = vec![ChatMessage { role: "system".into(), content: WORKER_SYSTEM_PROMPT.into() }];
        for turn in &worker.conversation {
            messages.push(ChatMessage { role: role_label(turn.role).into(), content: turn.content.clone() });
        }
        messages.push(ChatMessage { role: "user".into(), content: subtask.into() });

        self.events.emit(session_id, Some(&worker.id), EventType::Thinking, json!({"subtask": subtask}));

        let response = self
            .model
            .create(&worker.profile.model, &messages, TEMPERATURE, Some(MAX_TOKENS))
            .await?;

        self.cost.record(CostCategory::Workers, &worker.profile.model, response.usage.tokens_in, response.usage.tokens_out);

        let parsed = parse_response(&response.content);

        worker.conversation.push(Message { role: Role::User, content: subtask.to_string() });
        worker.conversation.push(Message { role: Role::Assistant, content: response.content.clone() });

        self.events.emit(
            session_id,
            Some(&worker.id),
            EventType::Thought,
            json!({"thought": parsed.thought}),
        );
        worker.push_action(WorkerAction {
            timestamp: Utc::now(),
            action_type: ActionType::LlmPlan,
            description: truncate(&parsed.thought, 200),
            result: None,
            error: None,
        });

        if !parsed.code.is_empty() {
            self.run_code(session_id, worker, &parsed).await?;
        }

        worker.llm_confidence = parsed.confidence;
        worker.minutes_without_progress += 0.5;

        Ok(())
    }

    async fn run_code(&self, session_id: uuid::Uuid, worker: &mut Worker, parsed: &ParsedResponse) -> OrchestratorResult<()> {
        self.events.emit(session_id, Some(&worker.id), EventType::CodeRunning, json!({"code": parsed.code}));

        let handle = match &worker.sandbox_handle {
            Some(h) => h.clone(),
            None => {
                let handle = self.sandbox.create(&worker.id, "python").await?;
                worker.sandbox_handle = Some(handle.clone());
                handle
            }
        };

        let exec_result = self.sandbox.exec(&handle, &parsed.code).await;

        match exec_result {
            Ok(result) => {
                let success = result.exit_code == 0;
                self.events.emit(
                    session_id,
                    Some(&worker.id),
                    EventType::CodeResult,
                    json!({"success": success, "output": truncate(&result.stdout, 2000)}),
                );
                worker.push_action(WorkerAction {
                    timestamp: Utc::now(),
                    action_type: ActionType::CodeExecution,
                    description: truncate(&parsed.code, 200),
                    result: Some(truncate(&result.stdout, 500)),
                    error: if success { None } else { Some(truncate(&result.stdout, 500)) },
                });

                if success {
                    worker.minutes_without_progress = 0.0;
                    if !worker.actions.is_empty() {
                        worker.completed = true;
                        let mut preview_urls = Vec::new();
                        for port in PREVIEW_PORTS {
                            if let Ok(Some(url)) = self.sandbox.preview_url(&handle, port).await {
                                preview_urls.push(url);
                            }
                        }
                        worker.output = Some(WorkerOutput {
                            code: parsed.code.clone(),
                            output: result.stdout.clone(),
                            thought: parsed.thought.clone(),
                            preview_urls,
                        });
                        self.events.emit(session_id, Some(&worker.id), EventType::Completed, json!({}));
                    }
                } else {
                    worker.push_error(truncate(&result.stdout, 300));
                }
            }
            Err(err) => {
                worker.push_error(err.to_string());
                worker.push_action(WorkerAction {
                    timestamp: Utc::now(),
                    action_type: ActionType::LlmError,
                    description: "sandbox execution failed".into(),
                    result: None,
                    error: Some(err.to_string()),
                });
                self.events.emit(session_id, Some(&worker.id), EventType::Error, json!({"error": err.to_string()}));
            }
        }

        Ok(())
    }

    /// Applies an expert answer as synthetic guidance, then immediately
    /// re-runs one execution step with the unchanged subtask (spec.md
    /// §4.6 "Applying an expert answer").
    #[instrument(skip(self, worker, answer))]
    pub async fn apply_guidance(&self, session_id: uuid::Uuid, worker: &mut Worker, subtask: &str, answer: &str) -> OrchestratorResult<()> {
        worker.conversation.push(Message { role: Role::User, content: format!("Expert guidance: {answer}") });
        worker.push_action(WorkerAction {
            timestamp: Utc::now(),
            action_type: ActionType::ExpertGuidance,
            description: truncate(answer, 200),
            result: None,
            error: None,
        });
        worker.stuck = false;
        self.step(session_id, worker, subtask).await
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
