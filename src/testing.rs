//! In-memory fakes for the three external collaborator traits, used by
//! unit tests throughout this crate and by the scenario tests in
//! `tests/scenarios.rs`. Not compiled into release builds.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::{
    ChatMessage, ExecResult, LearningOutcome, LearningStore, ModelClient, ModelResponse, ModelUsage,
    SandboxHandle, SandboxProvider,
};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Always returns the same canned response content, regardless of the
/// prompt it receives. Tracks usage with a fixed small token count so
/// cost-controller tests have something deterministic to assert on.
pub struct FakeModelClient {
    response: String,
}

impl FakeModelClient {
    pub fn with_response(response: impl Into<String>) -> Self {
        Self { response: response.into() }
    }
}

#[async_trait]
impl ModelClient for FakeModelClient {
    async fn create(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: Option<u32>,
    ) -> OrchestratorResult<ModelResponse> {
        Ok(ModelResponse {
            content: self.response.clone(),
            usage: ModelUsage { tokens_in: 100, tokens_out: 50 },
        })
    }
}

/// An in-memory sandbox that always succeeds, echoing the submitted
/// code back as stdout. Useful for exercising the worker driver's
/// success path without a real container runtime.
pub struct FakeSandbox {
    succeed: bool,
    handles: Mutex<HashMap<SandboxHandle, ()>>,
}

impl FakeSandbox {
    pub fn always_succeeds() -> Self {
        Self { succeed: true, handles: Mutex::new(HashMap::new()) }
    }

    pub fn always_fails() -> Self {
        Self { succeed: false, handles: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(&self, name: &str, _language: &str) -> OrchestratorResult<SandboxHandle> {
        let handle = format!("sandbox-{name}-{}", Uuid::new_v4());
        self.handles.lock().unwrap().insert(handle.clone(), ());
        Ok(handle)
    }

    async fn exec(&self, _handle: &SandboxHandle, cmd: &str) -> OrchestratorResult<ExecResult> {
        if self.succeed {
            Ok(ExecResult { stdout: format!("ran: {cmd}"), exit_code: 0 })
        } else {
            Ok(ExecResult { stdout: "traceback: boom".into(), exit_code: 1 })
        }
    }

    async fn upload(&self, _handle: &SandboxHandle, _path: &str, _bytes: &[u8]) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn preview_url(&self, handle: &SandboxHandle, port: u16) -> OrchestratorResult<Option<String>> {
        if self.succeed && port == 8080 {
            Ok(Some(format!("https://{handle}-{port}.preview.invalid")))
        } else {
            Ok(None)
        }
    }

    async fn find_by_name(&self, name: &str) -> OrchestratorResult<Option<SandboxHandle>> {
        let handles = self.handles.lock().unwrap();
        Ok(handles.keys().find(|h| h.contains(name)).cloned())
    }

    async fn delete(&self, handle: &SandboxHandle) -> OrchestratorResult<()> {
        self.handles.lock().unwrap().remove(handle);
        Ok(())
    }
}

/// Records every category it was asked for context on, and returns a
/// fixed string for categories it was seeded with.
pub struct FakeLearningStore {
    contexts: HashMap<String, String>,
    seen: Mutex<Vec<String>>,
    answers: Mutex<HashMap<String, (String, String, f64)>>,
}

impl FakeLearningStore {
    pub fn empty() -> Self {
        Self { contexts: HashMap::new(), seen: Mutex::new(Vec::new()), answers: Mutex::new(HashMap::new()) }
    }

    pub fn with_context(category: impl Into<String>, text: impl Into<String>) -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(category.into(), text.into());
        Self { contexts, seen: Mutex::new(Vec::new()), answers: Mutex::new(HashMap::new()) }
    }

    pub fn saw_context_for(&self, category: &str) -> bool {
        self.seen.lock().unwrap().iter().any(|c| c == category)
    }
}

#[async_trait]
impl LearningStore for FakeLearningStore {
    async fn track_answer(&self, query: &str, answer: &str, initial_confidence: f64) -> OrchestratorResult<String> {
        let answer_id = Uuid::new_v4().to_string();
        self.answers
            .lock()
            .unwrap()
            .insert(answer_id.clone(), (query.to_string(), answer.to_string(), initial_confidence));
        Ok(answer_id)
    }

    async fn evaluate(&self, answer_id: &str, outcome: LearningOutcome) -> OrchestratorResult<f64> {
        if !self.answers.lock().unwrap().contains_key(answer_id) {
            return Err(OrchestratorError::Learning(format!("unknown answer id {answer_id}")));
        }
        // spec.md §6.4 effectiveness formula: success weighs heaviest,
        // fast resolution and few follow-ups earn a bonus, final
        // confidence nudges the result, clamped to [0, 1].
        let base = if outcome.success { 0.6 } else { 0.1 };
        let speed_bonus = (1.0 - (outcome.time_to_resolution_secs / 300.0).min(1.0)) * 0.2;
        let follow_up_penalty = (outcome.follow_up_count as f64 * 0.05).min(0.2);
        let confidence_component = outcome.final_confidence * 0.2;
        Ok((base + speed_bonus + confidence_component - follow_up_penalty).clamp(0.0, 1.0))
    }

    async fn get_context(&self, category: &str) -> OrchestratorResult<String> {
        self.seen.lock().unwrap().push(category.to_string());
        Ok(self.contexts.get(category).cloned().unwrap_or_default())
    }
}
