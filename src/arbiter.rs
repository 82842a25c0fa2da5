//! Arbiter (C5): multi-signal stuck detection, issue classification, and
//! the query builder that turns a stuck worker into an `ExpertQuery`.

use std::collections::HashSet;

use chrono::Utc;
use uuid::Uuid;

use crate::expert::{ExpertQuery, IssueType};
use crate::session::Worker;

#[derive(Debug, Clone, Copy, Default)]
pub struct Signals {
    pub time_stuck: bool,
    pub error_loop: bool,
    pub low_confidence: bool,
    pub repetition: bool,
    pub dead_end: bool,
}

impl Signals {
    /// Weighted sum from spec.md §4.5.
    pub fn urgency(&self) -> f64 {
        0.30 * self.time_stuck as u8 as f64
            + 0.25 * self.error_loop as u8 as f64
            + 0.20 * self.low_confidence as u8 as f64
            + 0.15 * self.repetition as u8 as f64
            + 0.10 * self.dead_end as u8 as f64
    }

    pub fn should_escalate(&self) -> bool {
        self.urgency() > 0.5 || (self.time_stuck && self.error_loop) || self.dead_end
    }
}

pub struct Arbiter;

impl Arbiter {
    /// Derive the boolean signals from a worker snapshot (spec.md §4.5).
    pub fn signals(worker: &Worker) -> Signals {
        let time_stuck = worker.minutes_without_progress > 5.0;
        let error_loop = worker.recent_errors.len() > 3;
        let low_confidence = worker.llm_confidence < 0.6;

        let last_ten = worker.last_signatures(10);
        let repetition = last_ten.len() >= 10 && distinct_count(&last_ten) < 3;

        let dead_end = Self::is_dead_end(worker);

        Signals { time_stuck, error_loop, low_confidence, repetition, dead_end }
    }

    fn is_dead_end(worker: &Worker) -> bool {
        let last_ten_actions: Vec<_> = worker.actions.iter().rev().take(10).collect();

        let error_count = last_ten_actions.iter().filter(|a| a.error.is_some()).count();
        if last_ten_actions.len() >= 5 && error_count >= 5 {
            return true;
        }

        if last_ten_actions.len() >= 5 {
            let first_type = last_ten_actions[0].action_type;
            if last_ten_actions.iter().take(5).all(|a| a.action_type == first_type) {
                return true;
            }
        }

        let last_six = worker.last_signatures(6);
        if last_six.len() >= 6 && distinct_count(&last_six) <= 2 {
            return true;
        }

        false
    }

    /// Priority-ordered classification: first match wins (spec.md §4.5).
    pub fn classify(signals: &Signals) -> IssueType {
        if signals.error_loop && signals.repetition {
            IssueType::BugSuspected
        } else if signals.error_loop {
            IssueType::ApiError
        } else if signals.dead_end {
            IssueType::ConceptualBlock
        } else if signals.low_confidence && signals.time_stuck {
            IssueType::ClarificationNeeded
        } else {
            IssueType::DocumentationGap
        }
    }

    /// Keyword heuristic over the subtask text; defaults to `general`.
    pub fn category_for(subtask: &str) -> String {
        let lower = subtask.to_lowercase();
        let buckets: &[(&str, &[&str])] = &[
            ("auth", &["auth", "login", "token", "oauth"]),
            ("db", &["database", "sql", "query", "migration"]),
            ("testing", &["test", "assert", "mock"]),
            ("deploy", &["deploy", "release", "ci/cd", "pipeline"]),
            ("api_usage", &["api", "endpoint", "request", "response"]),
        ];
        for (category, keywords) in buckets {
            if keywords.iter().any(|kw| lower.contains(kw)) {
                return category.to_string();
            }
        }
        "general".to_string()
    }

    /// Compose `worker_context` and the issue-type-templated question,
    /// returning a fully-formed `ExpertQuery` not yet enriched with
    /// cache results.
    pub fn build_query(task: &str, worker: &Worker) -> ExpertQuery {
        let signals = Self::signals(worker);
        let issue_type = Self::classify(&signals);
        let category = Self::category_for(&worker.subtask);

        let recent_actions: Vec<String> = worker
            .actions
            .iter()
            .rev()
            .take(5)
            .map(|a| {
                let desc: String = a.description.chars().take(100).collect();
                format!("{:?}: {desc}", a.action_type)
            })
            .collect();

        let recent_errors: Vec<String> = worker
            .recent_errors
            .iter()
            .rev()
            .take(3)
            .map(|e| e.chars().take(150).collect())
            .collect();

        let worker_context = format!(
            "task: {task}\nrecent actions: {}\nrecent errors: {}\nminutes stuck: {:.1}\nconfidence: {:.2}",
            recent_actions.join(" | "),
            recent_errors.join(" | "),
            worker.minutes_without_progress,
            worker.llm_confidence,
        );

        let question = match issue_type {
            IssueType::DocumentationGap => format!("What documentation covers: {}?", worker.subtask),
            IssueType::ApiError => format!("Why is this API call failing: {}?", worker.subtask),
            IssueType::ConceptualBlock => format!("What approach should be used for: {}?", worker.subtask),
            IssueType::BugSuspected => format!("Is there a bug blocking: {}?", worker.subtask),
            IssueType::ClarificationNeeded => format!("Can you clarify the requirement: {}?", worker.subtask),
        };

        ExpertQuery {
            query_id: Uuid::new_v4(),
            question,
            worker_id: worker.id.clone(),
            worker_context,
            category,
            issue_type,
            urgency_score: signals.urgency(),
            timestamp: Utc::now(),
            cache_hit: false,
            cache_results: Vec::new(),
        }
    }
}

fn distinct_count(signatures: &[String]) -> usize {
    signatures.iter().collect::<HashSet<_>>().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ActionType, WorkerAction, WorkerProfile};

    fn profile() -> WorkerProfile {
        WorkerProfile { model: "test-model".into(), expertise: "general".into() }
    }

    #[test]
    fn three_errors_not_stuck_four_is() {
        let mut w = Worker::new("junior", profile(), "task");
        for i in 0..3 {
            w.push_error(format!("e{i}"));
        }
        assert!(!Arbiter::signals(&w).error_loop);
        w.push_error("e4");
        assert!(Arbiter::signals(&w).error_loop);
    }

    #[test]
    fn five_minutes_not_stuck_above_is() {
        let mut w = Worker::new("junior", profile(), "task");
        w.minutes_without_progress = 5.0;
        assert!(!Arbiter::signals(&w).time_stuck);
        w.minutes_without_progress = 5.0001;
        assert!(Arbiter::signals(&w).time_stuck);
    }

    #[test]
    fn classification_priority_bug_suspected_beats_api_error() {
        let signals = Signals { error_loop: true, repetition: true, ..Default::default() };
        assert_eq!(Arbiter::classify(&signals), IssueType::BugSuspected);
    }

    #[test]
    fn error_loop_classifies_api_error_when_not_repeating() {
        let signals = Signals { error_loop: true, ..Default::default() };
        assert_eq!(Arbiter::classify(&signals), IssueType::ApiError);
    }

    #[test]
    fn stuck_worker_with_401_errors_escalates_as_api_error() {
        let mut w = Worker::new("junior", profile(), "call the auth api");
        for _ in 0..4 {
            w.push_error("401 unauthorized");
        }
        w.minutes_without_progress = 6.0;
        let signals = Arbiter::signals(&w);
        assert!(signals.should_escalate());
        assert_eq!(Arbiter::classify(&signals), IssueType::ApiError);
        assert_eq!(Arbiter::category_for(&w.subtask), "auth");
        let _ = WorkerAction {
            timestamp: Utc::now(),
            action_type: ActionType::LlmPlan,
            description: String::new(),
            result: None,
            error: None,
        };
    }
}
