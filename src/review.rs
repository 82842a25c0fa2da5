//! Review Gate (C8): a blocking handoff between the Phase Engine and an
//! external human decider, or an auto-approve policy in degraded mode
//! (spec.md §4.8, §9).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::expert::ExpertQuery;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approved,
    Rejected,
    Modified { corrected_answer: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewMode {
    /// `wait` blocks until a human posts a decision, or times out.
    Blocking,
    /// Missing/timed-out decisions resolve to `approved` immediately.
    AutoApprove,
}

pub struct PendingReview {
    pub query: ExpertQuery,
    pub arbiter_context: String,
}

pub struct ReviewGate {
    mode: ReviewMode,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ReviewDecision>>>,
    receivers: Mutex<HashMap<Uuid, oneshot::Receiver<ReviewDecision>>>,
    submitted: Mutex<HashMap<Uuid, PendingReview>>,
}

impl ReviewGate {
    pub fn new(mode: ReviewMode) -> Self {
        Self {
            mode,
            pending: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            submitted: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a review item and return immediately. The sender half is
    /// held for `decide`, the receiver half for `wait` — a oneshot
    /// channel buffers a send that arrives before the receiver is ever
    /// polled, so `decide` racing ahead of `wait` still delivers.
    pub fn submit(&self, query: ExpertQuery, arbiter_context: String) -> Uuid {
        let review_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(review_id, tx);
        self.receivers.lock().unwrap().insert(review_id, rx);
        self.submitted.lock().unwrap().insert(review_id, PendingReview { query, arbiter_context });
        review_id
    }

    /// In `Blocking` mode, wait (cooperatively) until a decision is
    /// posted or `default_timeout` elapses, defaulting to `Approved` on
    /// timeout or a dropped sender. In `AutoApprove` mode there is no
    /// human to wait for, so resolve to `Approved` immediately — unless
    /// a decision already landed, which a fast `decide` racing ahead of
    /// `wait` can still deliver (spec.md §4.8's MVP default).
    pub async fn wait(&self, review_id: Uuid, default_timeout: Duration) -> ReviewDecision {
        let rx = match self.receivers.lock().unwrap().remove(&review_id) {
            Some(rx) => rx,
            None => return ReviewDecision::Approved,
        };

        if self.mode == ReviewMode::AutoApprove {
            return match rx.try_recv() {
                Ok(decision) => decision,
                Err(_) => ReviewDecision::Approved,
            };
        }

        match timeout(default_timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) | Err(_) => {
                warn!(%review_id, mode = ?self.mode, "review timed out or sender dropped, defaulting to approved");
                ReviewDecision::Approved
            }
        }
    }

    /// Resolve an outstanding `wait`.
    pub fn decide(&self, review_id: Uuid, decision: ReviewDecision) -> bool {
        let sender = self.pending.lock().unwrap().remove(&review_id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expert::IssueType;
    use chrono::Utc;

    fn sample_query() -> ExpertQuery {
        ExpertQuery {
            query_id: Uuid::new_v4(),
            question: "why does this fail?".into(),
            worker_id: "junior".into(),
            worker_context: "ctx".into(),
            category: "general".into(),
            issue_type: IssueType::DocumentationGap,
            urgency_score: 0.6,
            timestamp: Utc::now(),
            cache_hit: false,
            cache_results: Vec::new(),
        }
    }

    #[tokio::test]
    async fn decide_resolves_a_pending_wait() {
        let gate = std::sync::Arc::new(ReviewGate::new(ReviewMode::Blocking));
        let review_id = gate.submit(sample_query(), "ctx".into());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(review_id, Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        gate.decide(review_id, ReviewDecision::Rejected);

        let decision = waiter.await.unwrap();
        matches!(decision, ReviewDecision::Rejected);
    }

    #[tokio::test]
    async fn missing_decision_times_out_to_approved_in_mvp_mode() {
        let gate = ReviewGate::new(ReviewMode::AutoApprove);
        let review_id = gate.submit(sample_query(), "ctx".into());
        let decision = gate.wait(review_id, Duration::from_millis(20)).await;
        matches!(decision, ReviewDecision::Approved);
    }
}
