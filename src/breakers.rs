//! Circuit Breakers (C3): five independent, level-triggered tripwires
//! evaluated at every phase boundary. Each trip is a pure check that
//! returns a result variant — panics are reserved for invariant
//! violations, never for a breaker trip (spec.md §9).

use std::sync::Mutex;
use std::time::Duration;

use crate::cost::CostController;
use crate::session::Session;

/// What the Phase Engine should do in response to a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTag {
    PauseAndAlert,
    ResetWorker,
    Throttle,
    SkipToReport,
    EscalateToHuman,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    Ok,
    Trip(ActionTag),
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct BreakerConfig {
    pub consecutive_expert_failures: u32,
    pub cost_spike_multiple: f64,
    pub timeout_minutes: f64,
    pub no_progress_minutes: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { consecutive_expert_failures: 5, cost_spike_multiple: 2.0, timeout_minutes: 60.0, no_progress_minutes: 15.0 }
    }
}

/// Tracks the rolling state each breaker needs beyond what's on
/// `Session`/`Worker` directly (expert-failure streak, session start).
pub struct CircuitBreakers {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    consecutive_expert_failures_without_success: u32,
    session_started_at: chrono::DateTime<chrono::Utc>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                consecutive_expert_failures_without_success: 0,
                session_started_at: chrono::Utc::now(),
            }),
        }
    }

    /// Call after a worker receives expert guidance and takes its next
    /// step, so `ConsecutiveExpertFailure` can track the streak.
    pub fn record_expert_guidance_outcome(&self, worker_succeeded: bool) {
        let mut state = self.state.lock().unwrap();
        if worker_succeeded {
            state.consecutive_expert_failures_without_success = 0;
        } else {
            state.consecutive_expert_failures_without_success += 1;
        }
    }

    /// ConsecutiveExpertFailure: N=5 expert answers followed by worker
    /// non-success trips `pause_and_alert`.
    pub fn check_consecutive_expert_failure(&self) -> BreakerOutcome {
        let state = self.state.lock().unwrap();
        if state.consecutive_expert_failures_without_success >= self.config.consecutive_expert_failures {
            BreakerOutcome::Trip(ActionTag::PauseAndAlert)
        } else {
            BreakerOutcome::Ok
        }
    }

    /// Repetition: fewer than 3 distinct signatures among the last 10
    /// actions of any worker trips `reset_worker`.
    pub fn check_repetition(&self, session: &Session) -> BreakerOutcome {
        for worker in &session.workers {
            let sigs = worker.last_signatures(10);
            if sigs.len() >= 10 {
                let distinct: std::collections::HashSet<&String> = sigs.iter().collect();
                if distinct.len() < 3 {
                    return BreakerOutcome::Trip(ActionTag::ResetWorker);
                }
            }
        }
        BreakerOutcome::Ok
    }

    /// CostSpike: current cost-rate more than `cost_spike_multiple` over
    /// the first-observed baseline rate trips `throttle`.
    pub fn check_cost_spike(&self, cost: &CostController) -> BreakerOutcome {
        match cost.cost_rate_multiple_of_baseline() {
            Some(multiple) if multiple > self.config.cost_spike_multiple => BreakerOutcome::Trip(ActionTag::Throttle),
            _ => BreakerOutcome::Ok,
        }
    }

    /// Timeout: elapsed session minutes over the configured ceiling
    /// trips `skip_to_report`.
    pub fn check_timeout(&self) -> BreakerOutcome {
        let state = self.state.lock().unwrap();
        let elapsed = chrono::Utc::now() - state.session_started_at;
        let elapsed_minutes = elapsed.num_seconds() as f64 / 60.0;
        if elapsed_minutes > self.config.timeout_minutes {
            BreakerOutcome::Trip(ActionTag::SkipToReport)
        } else {
            BreakerOutcome::Ok
        }
    }

    /// NoProgress: no worker in the session has made progress within
    /// the configured window trips `escalate_to_human`.
    pub fn check_no_progress(&self, session: &Session) -> BreakerOutcome {
        let worst = session
            .workers
            .iter()
            .map(|w| w.minutes_without_progress)
            .fold(0.0_f64, f64::max);
        if worst >= self.config.no_progress_minutes {
            BreakerOutcome::Trip(ActionTag::EscalateToHuman)
        } else {
            BreakerOutcome::Ok
        }
    }

    /// Run all five breakers; returns the first trip encountered, in the
    /// table order from spec.md §4.3.
    pub fn check_all(&self, session: &Session, cost: &CostController) -> BreakerOutcome {
        for outcome in [
            self.check_consecutive_expert_failure(),
            self.check_repetition(session),
            self.check_cost_spike(cost),
            self.check_timeout(),
            self.check_no_progress(session),
        ] {
            if let BreakerOutcome::Trip(_) = outcome {
                return outcome;
            }
        }
        BreakerOutcome::Ok
    }

    #[cfg(test)]
    pub fn backdate_session_start(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.session_started_at -= chrono::Duration::from_std(by).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ActionType, Worker, WorkerAction, WorkerProfile};

    fn profile() -> WorkerProfile {
        WorkerProfile { model: "test-model".into(), expertise: "general".into() }
    }

    fn worker_with_identical_actions(count: usize) -> Worker {
        let mut w = Worker::new("junior", profile(), "task");
        for _ in 0..count {
            w.push_action(WorkerAction {
                timestamp: chrono::Utc::now(),
                action_type: ActionType::LlmPlan,
                description: "same plan".into(),
                result: None,
                error: None,
            });
        }
        w
    }

    #[test]
    fn repetition_breaker_trips_on_low_distinct_count() {
        let breakers = CircuitBreakers::new(BreakerConfig::default());
        let session = Session::new("task", vec![worker_with_identical_actions(10)]);
        assert_eq!(breakers.check_repetition(&session), BreakerOutcome::Trip(ActionTag::ResetWorker));
    }

    #[test]
    fn consecutive_expert_failure_trips_at_five() {
        let breakers = CircuitBreakers::new(BreakerConfig::default());
        for _ in 0..5 {
            breakers.record_expert_guidance_outcome(false);
        }
        assert_eq!(breakers.check_consecutive_expert_failure(), BreakerOutcome::Trip(ActionTag::PauseAndAlert));
    }

    #[test]
    fn no_progress_trips_at_fifteen_minutes() {
        let breakers = CircuitBreakers::new(BreakerConfig::default());
        let mut worker = Worker::new("junior", profile(), "task");
        worker.minutes_without_progress = 15.0;
        let session = Session::new("task", vec![worker]);
        assert_eq!(breakers.check_no_progress(&session), BreakerOutcome::Trip(ActionTag::EscalateToHuman));
    }

    #[test]
    fn timeout_trips_after_sixty_minutes() {
        let breakers = CircuitBreakers::new(BreakerConfig::default());
        breakers.backdate_session_start(Duration::from_secs(61 * 60));
        assert_eq!(breakers.check_timeout(), BreakerOutcome::Trip(ActionTag::SkipToReport));
    }
}
