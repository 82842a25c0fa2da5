//! Cost Controller (C2): thread-safe accounting, category budgets, and
//! advisory/hard limits, checked on every cost-incurring action.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Spend categories tracked independently against per-category caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    Workers,
    Expert,
    Browser,
    EmbeddingsAndStorage,
}

impl CostCategory {
    fn label(self) -> &'static str {
        match self {
            CostCategory::Workers => "workers",
            CostCategory::Expert => "expert",
            CostCategory::Browser => "browser",
            CostCategory::EmbeddingsAndStorage => "embeddings_storage",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub total: f64,
    pub workers_cap: f64,
    pub expert_cap: f64,
    pub browser_cap: f64,
    pub embeddings_storage_cap: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { total: 50.00, workers_cap: 30.00, expert_cap: 15.00, browser_cap: 3.00, embeddings_storage_cap: 2.00 }
    }
}

impl BudgetConfig {
    fn cap_for(&self, category: CostCategory) -> f64 {
        match category {
            CostCategory::Workers => self.workers_cap,
            CostCategory::Expert => self.expert_cap,
            CostCategory::Browser => self.browser_cap,
            CostCategory::EmbeddingsAndStorage => self.embeddings_storage_cap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub category: CostCategory,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Warn,
    Deny,
}

pub struct CheckOutcome {
    pub decision: Decision,
    pub message: String,
    pub remaining: f64,
}

/// Per-million-token (input, output) USD rates. Unknown models resolve
/// to a conservative default rather than erroring (spec.md §4.2).
fn rate_for_model(model: &str) -> (f64, f64) {
    match model {
        "gpt-4o" => (5.0, 15.0),
        "gpt-4o-mini" => (0.15, 0.60),
        "claude-3-5-sonnet" => (3.0, 15.0),
        "claude-3-haiku" => (0.25, 1.25),
        "embedding-small" => (0.02, 0.0),
        other => {
            warn!(model = other, "unknown model id, using conservative default rate");
            (10.0, 30.0)
        }
    }
}

/// Ledger mutex guarantees every operation below is atomic (spec.md §4.2,
/// §5).
pub struct CostController {
    budget: BudgetConfig,
    inner: Mutex<Ledger>,
}

struct Ledger {
    entries: Vec<LedgerEntry>,
    by_category: HashMap<CostCategory, f64>,
    baseline_rate_per_min: Option<f64>,
    session_start: DateTime<Utc>,
}

impl CostController {
    pub fn new(budget: BudgetConfig) -> Self {
        Self {
            budget,
            inner: Mutex::new(Ledger {
                entries: Vec::new(),
                by_category: HashMap::new(),
                baseline_rate_per_min: None,
                session_start: Utc::now(),
            }),
        }
    }

    /// Compute cost from the model rate table and append to the ledger.
    pub fn record(&self, category: CostCategory, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        let (in_rate, out_rate) = rate_for_model(model);
        let cost_usd = (tokens_in as f64 / 1_000_000.0) * in_rate + (tokens_out as f64 / 1_000_000.0) * out_rate;

        let mut ledger = self.inner.lock().unwrap();
        ledger.entries.push(LedgerEntry {
            timestamp: Utc::now(),
            category,
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost_usd,
        });
        *ledger.by_category.entry(category).or_insert(0.0) += cost_usd;

        let elapsed_min = (Utc::now() - ledger.session_start).num_seconds() as f64 / 60.0;
        if elapsed_min > 0.0 {
            let total: f64 = ledger.by_category.values().sum();
            let rate = total / elapsed_min;
            if ledger.baseline_rate_per_min.is_none() {
                ledger.baseline_rate_per_min = Some(rate.max(1e-9));
            }
        }

        cost_usd
    }

    /// `deny` if total exceeds budget or expert cap is exceeded; `warn`
    /// if any category is above 70% of its cap or remaining budget is
    /// below the buffer; otherwise `allow`.
    pub fn check(&self) -> CheckOutcome {
        self.check_projected(0.0)
    }

    /// Same thresholds as `check`, but weighed against `total_spent() +
    /// projected_cost` rather than just what has already been recorded.
    /// Called before a model call with that call's worst-case cost
    /// (`estimate_cost`) so a single expensive call can be denied before
    /// it runs, rather than only after it has already overspent the
    /// budget (spec.md §4.2).
    pub fn check_projected(&self, projected_cost: f64) -> CheckOutcome {
        let ledger = self.inner.lock().unwrap();
        let total: f64 = ledger.by_category.values().sum();
        let projected_total = total + projected_cost;
        let remaining = self.budget.total - projected_total;

        let expert_spend = *ledger.by_category.get(&CostCategory::Expert).unwrap_or(&0.0);
        if projected_total > self.budget.total || expert_spend > self.budget.expert_cap {
            return CheckOutcome {
                decision: Decision::Deny,
                message: format!(
                    "budget would be exceeded: {total:.4} + projected {projected_cost:.4} over {:.4}",
                    self.budget.total
                ),
                remaining: remaining.max(0.0),
            };
        }

        let buffer = self.budget.embeddings_storage_cap;
        let over_threshold = [CostCategory::Workers, CostCategory::Expert, CostCategory::Browser]
            .iter()
            .any(|c| {
                let spend = *ledger.by_category.get(c).unwrap_or(&0.0);
                let cap = self.budget.cap_for(*c);
                cap > 0.0 && spend / cap > 0.7
            });

        if over_threshold || remaining < buffer {
            return CheckOutcome {
                decision: Decision::Warn,
                message: "approaching budget limits".to_string(),
                remaining,
            };
        }

        CheckOutcome { decision: Decision::Allow, message: "within budget".to_string(), remaining }
    }

    /// Worst-case pre-call cost estimate for a model, assuming it uses
    /// its full token budget on both sides of the exchange. Used to
    /// deny a call before it happens rather than only after recording
    /// its actual (possibly much smaller) cost.
    pub fn estimate_cost(&self, model: &str, max_tokens: u32) -> f64 {
        let (in_rate, out_rate) = rate_for_model(model);
        (max_tokens as f64 / 1_000_000.0) * (in_rate + out_rate)
    }

    /// Human-readable mitigation hint naming the dominant category.
    pub fn advise(&self) -> String {
        let ledger = self.inner.lock().unwrap();
        let dominant = ledger
            .by_category
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));

        match dominant {
            Some((category, _)) => format!(
                "spend is concentrated in {}; consider trimming that category's usage",
                category.label()
            ),
            None => "no spend recorded yet".to_string(),
        }
    }

    /// `Decision::Deny` implies this returns `true`: total spend has not
    /// exceeded the configured budget (spec.md §8 invariant).
    pub fn within_budget(&self) -> bool {
        let ledger = self.inner.lock().unwrap();
        let total: f64 = ledger.by_category.values().sum();
        total <= self.budget.total
    }

    pub fn total_spent(&self) -> f64 {
        self.inner.lock().unwrap().by_category.values().sum()
    }

    pub fn by_category(&self) -> HashMap<CostCategory, f64> {
        self.inner.lock().unwrap().by_category.clone()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// `CostSpike` breaker input: current rate vs the first-observed
    /// baseline (spec.md §4.3).
    pub fn cost_rate_multiple_of_baseline(&self) -> Option<f64> {
        let ledger = self.inner.lock().unwrap();
        let baseline = ledger.baseline_rate_per_min?;
        let elapsed_min = (Utc::now() - ledger.session_start).num_seconds() as f64 / 60.0;
        if elapsed_min <= 0.0 {
            return None;
        }
        let total: f64 = ledger.by_category.values().sum();
        Some((total / elapsed_min) / baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_sum_per_category_matches_recorded_entries() {
        let controller = CostController::new(BudgetConfig::default());
        controller.record(CostCategory::Workers, "gpt-4o-mini", 1000, 500);
        controller.record(CostCategory::Workers, "gpt-4o-mini", 2000, 1000);

        let entries = controller.entries();
        let sum: f64 = entries
            .iter()
            .filter(|e| e.category == CostCategory::Workers)
            .map(|e| e.cost_usd)
            .sum();
        let by_category = controller.by_category();
        assert!((sum - by_category[&CostCategory::Workers]).abs() < 1e-9);
    }

    #[test]
    fn deny_when_total_exceeds_budget() {
        let controller = CostController::new(BudgetConfig { total: 0.001, ..Default::default() });
        controller.record(CostCategory::Workers, "gpt-4o", 10_000, 10_000);
        assert_eq!(controller.check().decision, Decision::Deny);
        assert!(!controller.within_budget());
    }

    #[test]
    fn unknown_model_resolves_to_default_rate_not_error() {
        let controller = CostController::new(BudgetConfig::default());
        let cost = controller.record(CostCategory::Workers, "mystery-model-v9", 1_000_000, 0);
        assert!((cost - 10.0).abs() < 1e-9);
    }

    #[test]
    fn warn_above_seventy_percent_of_category_cap() {
        let controller = CostController::new(BudgetConfig { total: 100.0, workers_cap: 10.0, ..Default::default() });
        controller.record(CostCategory::Workers, "gpt-4o", 1_600_000, 0); // 8.0 usd -> 80% of 10 cap
        let outcome = controller.check();
        assert_eq!(outcome.decision, Decision::Warn);
    }
}
