//! Phase Engine (C9): the finite-state machine driving a Session through
//! its phases, checking breakers and the budget at every boundary and
//! routing the four fan-out points (`check_progress`, `hybrid_search`,
//! `human_review`, `browserbase_test`).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::arbiter::Arbiter;
use crate::breakers::{ActionTag, BreakerOutcome};
use crate::context::SessionContext;
use crate::cost::{CheckOutcome, CostCategory, Decision};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::expert::ExpertDriver;
use crate::review::{ReviewDecision, ReviewGate};
use crate::session::{Session, Worker, WorkerProfile};
use crate::types::{EventType, Phase};
use crate::worker_driver::WorkerDriver;

const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const REVIEW_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs a single session from `init` to a terminal phase.
pub struct PhaseEngine {
    ctx: Arc<SessionContext>,
    worker_driver: WorkerDriver,
    expert_driver: ExpertDriver,
}

impl PhaseEngine {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let worker_driver =
            WorkerDriver::new(ctx.model.clone(), ctx.sandbox.clone(), ctx.events.clone(), ctx.cost.clone());
        let expert_driver = ExpertDriver::new(ctx.model.clone(), ctx.learning.clone());
        Self { ctx, worker_driver, expert_driver }
    }

    /// Build the fixed worker roster for a new session from the
    /// configured topology.
    fn build_workers(&self, task: &str) -> Vec<Worker> {
        self.ctx
            .config
            .topology
            .worker_profiles
            .iter()
            .map(|p| {
                Worker::new(
                    p.id.clone(),
                    WorkerProfile { model: p.model.clone(), expertise: p.expertise.clone() },
                    task.to_string(),
                )
            })
            .collect()
    }

    /// Drive `session` through phases until it reaches `completed` or
    /// `failed`. Emits `phase_change` on every transition and
    /// `session_done` exactly once on exit (spec.md §4.9, §8).
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn run(&self, session: &mut Session) -> OrchestratorResult<()> {
        loop {
            if let Some(tag) = self.check_breakers(session) {
                self.handle_breaker_trip(session, tag).await?;
                if session.phase.is_terminal() {
                    self.finish(session).await;
                    return Ok(());
                }
                // Fall through to run the (possibly just-transitioned)
                // phase body in this same iteration instead of looping
                // back to check_breakers immediately: a trip whose
                // triggering condition isn't cleared by the handler
                // (e.g. `Throttle`, which only emits a signal) would
                // otherwise re-trip forever before any phase ever ran.
            }

            let next = match session.phase {
                Phase::Init => self.phase_init(session).await,
                Phase::AssignTask => self.phase_assign_task(session).await,
                Phase::WorkerExecute => self.phase_worker_execute(session).await,
                Phase::CheckProgress => self.phase_check_progress(session),
                Phase::Arbiter => self.phase_arbiter(session).await,
                Phase::HybridSearch => self.phase_hybrid_search(session).await,
                Phase::HumanReview => self.phase_human_review(session).await,
                Phase::ExpertAnswer => self.phase_expert_answer(session).await,
                Phase::BrowserbaseTest => self.phase_browserbase_test(session).await,
                Phase::GenerateReport => self.phase_generate_report(session),
                Phase::ExpertLearn => self.phase_expert_learn(session).await,
                Phase::Completed | Phase::Failed => Ok(session.phase),
            };

            // Any error surfacing from a phase handler — fatal invariant
            // violations as well as collaborator failures the handler
            // didn't already downgrade to a recoverable worker error —
            // fails the session rather than unwinding the loop, so a
            // `session_done{status:failed}` event is always emitted
            // before `run` returns (spec.md §7: no silent swallows).
            let next = match next {
                Ok(p) => p,
                Err(err) => {
                    self.fail(session, &err.to_string());
                    Phase::Failed
                }
            };

            self.transition(session, next);

            if session.phase.is_terminal() {
                self.finish(session).await;
                return Ok(());
            }
        }
    }

    fn transition(&self, session: &mut Session, to: Phase) {
        let from = session.phase;
        session.transition(to, chrono::Utc::now());
        self.ctx.events.emit(
            session.id,
            None,
            EventType::PhaseChange,
            json!({"from": from.to_string(), "to": to.to_string()}),
        );
        info!(session_id = %session.id, %from, %to, "phase transition");
    }

    fn fail(&self, session: &mut Session, reason: &str) {
        self.ctx.events.emit(session.id, None, EventType::Error, json!({"reason": reason}));
        session.transition(Phase::Failed, chrono::Utc::now());
    }

    async fn finish(&self, session: &mut Session) {
        let status = if session.phase == Phase::Completed { "completed" } else { "failed" };
        self.ctx.events.emit(
            session.id,
            None,
            EventType::SessionDone,
            json!({"status": status, "budget_note": session.budget_note}),
        );
        self.ctx.events.cleanup(session.id);
    }

    fn check_breakers(&self, session: &Session) -> Option<ActionTag> {
        if session.phase.is_terminal() {
            return None;
        }
        match self.ctx.breakers.check_all(session, &self.ctx.cost) {
            BreakerOutcome::Trip(tag) => Some(tag),
            BreakerOutcome::Ok => None,
        }
    }

    async fn handle_breaker_trip(&self, session: &mut Session, tag: ActionTag) -> OrchestratorResult<()> {
        warn!(session_id = %session.id, ?tag, "circuit breaker tripped");
        match tag {
            ActionTag::PauseAndAlert => {
                self.fail(session, "consecutive expert failures without success");
            }
            ActionTag::ResetWorker => {
                for worker in &mut session.workers {
                    let sigs = worker.last_signatures(10);
                    let distinct: std::collections::HashSet<&String> = sigs.iter().collect();
                    if sigs.len() >= 10 && distinct.len() < 3 {
                        worker.recent_errors.clear();
                        worker.minutes_without_progress = 0.0;
                    }
                }
            }
            ActionTag::Throttle => {
                self.ctx.events.emit(session.id, None, EventType::Stuck, json!({"reason": "cost_spike_throttle"}));
            }
            ActionTag::SkipToReport => {
                self.transition(session, Phase::GenerateReport);
            }
            ActionTag::EscalateToHuman => {
                // Clear the stuck timer so routing through Arbiter counts
                // as the intervention that resets it, rather than the
                // NoProgress breaker re-tripping on the very next loop
                // iteration before Arbiter's body ever runs.
                for worker in &mut session.workers {
                    worker.minutes_without_progress = 0.0;
                }
                self.transition(session, Phase::Arbiter);
            }
        }
        Ok(())
    }

    async fn phase_init(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        self.ctx.events.emit(session.id, None, EventType::SessionStarted, json!({"task": session.task}));
        for worker in &session.workers {
            self.ctx.events.emit(session.id, Some(&worker.id), EventType::SandboxReady, json!({}));
        }
        Ok(Phase::AssignTask)
    }

    async fn phase_assign_task(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        if session.task.trim().is_empty() {
            return Err(OrchestratorError::InvariantViolation("empty task cannot be assigned".into()));
        }
        for worker in &session.workers {
            self.ctx
                .events
                .emit(session.id, Some(&worker.id), EventType::TaskAssigned, json!({"subtask": worker.subtask}));
        }
        Ok(Phase::WorkerExecute)
    }

    async fn phase_worker_execute(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        let subtasks: Vec<(usize, String)> =
            session.workers.iter().enumerate().filter(|(_, w)| !w.completed).map(|(i, w)| (i, w.subtask.clone())).collect();

        for (idx, subtask) in subtasks {
            let model = session.workers[idx].profile.model.clone();
            let projected = self.ctx.cost.estimate_cost(&model, crate::worker_driver::MAX_TOKENS);
            match self.ctx.cost.check_projected(projected) {
                CheckOutcome { decision: Decision::Deny, .. } => {
                    session.budget_note = Some("budget_exhausted".to_string());
                    return Ok(Phase::GenerateReport);
                }
                CheckOutcome { decision: Decision::Warn, message, .. } => {
                    warn!(session_id = %session.id, %message, "cost controller warning");
                }
                CheckOutcome { decision: Decision::Allow, .. } => {}
            }

            let worker = &mut session.workers[idx];
            let step = self.worker_driver.step(session.id, worker, &subtask);
            match tokio::time::timeout(MODEL_CALL_TIMEOUT, step).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_recoverable() => {
                    session.workers[idx].push_error(err.to_string());
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    session.workers[idx].push_error("model call timed out".to_string());
                }
            }
        }
        Ok(Phase::CheckProgress)
    }

    /// Stuck flag per spec.md §4.9: `minutes_without_progress >= 5.0` OR
    /// `|recent_errors| >= 3`. Distinct from the Arbiter's own, stricter
    /// `time_stuck` signal used for urgency scoring.
    fn phase_check_progress(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        for worker in &mut session.workers {
            worker.stuck = !worker.completed
                && (worker.minutes_without_progress >= 5.0 || worker.recent_errors.len() >= 3);
        }

        if session.workers.iter().all(|w| w.completed) {
            return Ok(Phase::BrowserbaseTest);
        }
        if session.workers.iter().any(|w| w.stuck) {
            return Ok(Phase::Arbiter);
        }
        Ok(Phase::WorkerExecute)
    }

    /// Processes stuck workers in worker-id lexicographic order, at most
    /// one query per worker per pass (spec.md §4.9 tie-break rule).
    async fn phase_arbiter(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        let mut stuck_ids: Vec<String> =
            session.workers.iter().filter(|w| w.stuck).map(|w| w.id.clone()).collect();
        stuck_ids.sort();

        let task = session.task.clone();
        let session_id = session.id;
        for worker_id in stuck_ids {
            let Some(worker) = session.worker_mut(&worker_id) else { continue };
            let query = Arbiter::build_query(&task, worker);
            self.ctx.events.emit(
                session_id,
                Some(&worker_id),
                EventType::Escalated,
                json!({"issue_type": format!("{:?}", query.issue_type), "urgency": query.urgency_score}),
            );
            session.queries.push(query);
        }

        if session.queries.is_empty() {
            return Ok(Phase::WorkerExecute);
        }
        Ok(Phase::HybridSearch)
    }

    async fn phase_hybrid_search(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        let Some(query) = session.queries.last_mut() else {
            return Ok(Phase::WorkerExecute);
        };
        let hits = self.ctx.cache.search(&query.question, self.ctx.config.cache.top_k);
        let top_score = hits.first().and_then(|h| h.entry.relevance_score);
        query.cache_results = hits.clone();
        query.cache_hit = top_score.map(|s| s >= crate::cache::CACHE_HIT_THRESHOLD).unwrap_or(false);

        if query.cache_hit {
            let worker_id = query.worker_id.clone();
            let subtask = session.workers.iter().find(|w| w.id == worker_id).map(|w| w.subtask.clone());
            if let (Some(hit), Some(subtask)) = (hits.first(), subtask) {
                self.ctx.cache.record_asked(hit.entry.id);
                let session_id = session.id;
                let answer = hit.entry.answer.clone();
                if let Some(worker) = session.worker_mut(&worker_id) {
                    self.worker_driver.apply_guidance(session_id, worker, &subtask, &answer).await?;
                }
            }
            return Ok(Phase::WorkerExecute);
        }
        Ok(Phase::HumanReview)
    }

    async fn phase_human_review(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        let Some(query) = session.queries.last().cloned() else {
            return Ok(Phase::WorkerExecute);
        };
        let review_id = self.ctx.review.submit(query, String::new());
        self.ctx.events.emit(session.id, None, EventType::ReviewPending, json!({"review_id": review_id.to_string()}));

        let decision = self.ctx.review.wait(review_id, REVIEW_TIMEOUT).await;
        match decision {
            ReviewDecision::Approved => Ok(Phase::ExpertAnswer),
            ReviewDecision::Rejected => Ok(Phase::WorkerExecute),
            ReviewDecision::Modified { corrected_answer, .. } => {
                let worker_id = session.queries.last().map(|q| q.worker_id.clone());
                if let Some(worker_id) = worker_id {
                    let session_id = session.id;
                    let subtask = session.workers.iter().find(|w| w.id == worker_id).map(|w| w.subtask.clone());
                    if let (Some(subtask), Some(worker)) = (subtask, session.worker_mut(&worker_id)) {
                        self.worker_driver.apply_guidance(session_id, worker, &subtask, &corrected_answer).await?;
                    }
                }
                Ok(Phase::WorkerExecute)
            }
        }
    }

    async fn phase_expert_answer(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        let Some(query) = session.queries.last().cloned() else {
            return Ok(Phase::WorkerExecute);
        };

        let answer_result = self.expert_driver.answer(&query).await;
        let (answer, answer_id) = match answer_result {
            Ok(pair) => pair,
            Err(err) if err.is_recoverable() => {
                self.ctx.events.emit(session.id, None, EventType::ExpertError, json!({"error": err.to_string()}));
                self.ctx.breakers.record_expert_guidance_outcome(false);
                return Ok(Phase::WorkerExecute);
            }
            Err(err) => return Err(err),
        };

        self.ctx.cost.record(CostCategory::Expert, &answer.model_used, 400, 200);
        self.ctx.events.emit(
            session.id,
            Some(&query.worker_id),
            EventType::ExpertAnswerGenerated,
            json!({"answer_id": answer.answer_id.to_string()}),
        );

        if let Err(store_err) =
            self.ctx.cache.store(&query.question, &answer.content, "expert-auto", &query.category, false)
        {
            warn!(session_id = %session.id, error = %store_err, "failed to store expert answer in knowledge cache");
            return Err(store_err);
        }

        let session_id = session.id;
        if let Some(worker) = session.worker_mut(&query.worker_id) {
            let subtask = worker.subtask.clone();
            let succeeded_before = worker.completed;
            self.worker_driver.apply_guidance(session_id, worker, &subtask, &answer.content).await?;
            self.ctx.breakers.record_expert_guidance_outcome(worker.completed && !succeeded_before);
        }

        let _ = answer_id;
        Ok(Phase::WorkerExecute)
    }

    async fn phase_browserbase_test(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        self.ctx.events.emit(session.id, None, EventType::ValidationStarted, json!({}));

        let pass = session.workers.iter().all(|w| w.completed && w.output.is_some());
        if pass {
            self.ctx.events.emit(session.id, None, EventType::ValidationComplete, json!({"pass": true}));
            Ok(Phase::GenerateReport)
        } else {
            self.ctx.events.emit(session.id, None, EventType::ValidationError, json!({"pass": false}));
            for worker in &mut session.workers {
                if !worker.completed {
                    worker.minutes_without_progress = 0.0;
                }
            }
            Ok(Phase::WorkerExecute)
        }
    }

    fn phase_generate_report(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        self.ctx.events.emit(
            session.id,
            None,
            EventType::Completed,
            json!({"total_cost_usd": self.ctx.cost.total_spent(), "advice": self.ctx.cost.advise()}),
        );
        Ok(Phase::ExpertLearn)
    }

    async fn phase_expert_learn(&self, session: &mut Session) -> OrchestratorResult<Phase> {
        for query in &session.queries {
            let _ = query;
        }
        let _ = session;
        Ok(Phase::Completed)
    }
}

/// Convenience constructor used by the inbound control surface and
/// integration tests: builds the worker roster, then runs the session
/// to completion (spec.md §6.1 `POST /sessions`).
pub async fn start_and_run_session(ctx: Arc<SessionContext>, task: impl Into<String>) -> OrchestratorResult<Session> {
    let engine = PhaseEngine::new(ctx);
    let task = task.into();
    let workers = engine.build_workers(&task);
    let mut session = Session::new(task, workers);
    engine.run(&mut session).await?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakers::{BreakerConfig, CircuitBreakers};
    use crate::cache::{HashingEmbedder, KnowledgeCache};
    use crate::config::OrchestratorConfig;
    use crate::cost::{BudgetConfig, CostController};
    use crate::event_bus::EventBus;
    use crate::review::ReviewMode;
    use crate::testing::{FakeLearningStore, FakeModelClient, FakeSandbox};
    use std::sync::Arc;

    fn context_with(
        budget: BudgetConfig,
        model: Arc<FakeModelClient>,
        sandbox: Arc<FakeSandbox>,
    ) -> Arc<SessionContext> {
        let mut config = OrchestratorConfig { budget: budget.clone(), ..Default::default() };
        config.topology.worker_profiles.truncate(1);
        Arc::new(SessionContext {
            config,
            events: Arc::new(EventBus::new()),
            cost: Arc::new(CostController::new(budget)),
            breakers: Arc::new(CircuitBreakers::new(BreakerConfig::default())),
            cache: Arc::new(KnowledgeCache::new(Box::new(HashingEmbedder::new(384)))),
            review: Arc::new(ReviewGate::new(ReviewMode::AutoApprove)),
            sandbox,
            model,
            learning: Arc::new(FakeLearningStore::empty()),
        })
    }

    #[tokio::test]
    async fn happy_path_single_worker_completes_first_try() {
        let model = Arc::new(FakeModelClient::with_response(
            "THOUGHT: print it\nCODE:\n```python\nprint(2+2)\n```\nCONFIDENCE: 0.9",
        ));
        let sandbox = Arc::new(FakeSandbox::always_succeeds());
        let ctx = context_with(BudgetConfig::default(), model, sandbox);

        let session = start_and_run_session(ctx, "print 2+2").await.unwrap();
        assert_eq!(session.phase, Phase::Completed);
        assert!(session.workers[0].completed);
    }

    #[tokio::test]
    async fn empty_task_fails_in_assign_task() {
        let model = Arc::new(FakeModelClient::with_response("THOUGHT: x\nCONFIDENCE: 0.5"));
        let sandbox = Arc::new(FakeSandbox::always_succeeds());
        let ctx = context_with(BudgetConfig::default(), model, sandbox);
        let session = start_and_run_session(ctx, "   ").await.unwrap();
        assert_eq!(session.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn budget_exhaustion_routes_to_generate_report_not_failed() {
        let model = Arc::new(FakeModelClient::with_response(
            "THOUGHT: print it\nCODE:\n```python\nprint(2+2)\n```\nCONFIDENCE: 0.9",
        ));
        let sandbox = Arc::new(FakeSandbox::always_succeeds());
        let budget = BudgetConfig { total: 0.001, ..Default::default() };
        let ctx = context_with(budget, model, sandbox);

        let session = start_and_run_session(ctx, "print 2+2").await.unwrap();
        assert_eq!(session.phase, Phase::Completed);
        assert_eq!(session.budget_note.as_deref(), Some("budget_exhausted"));
    }
}
