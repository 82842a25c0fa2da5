//! Configuration (C10): file/string/env loading, validation, and the
//! defaults every sub-component already carries on its own `Default`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breakers::BreakerConfig;
use crate::cost::BudgetConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::review::ReviewMode;

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> OrchestratorResult<OrchestratorConfig> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> OrchestratorResult<OrchestratorConfig> {
        let config: OrchestratorConfig =
            toml::from_str(content).map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Start from defaults, then apply `FOCUSGROUP_*` overrides.
    pub fn load_from_env() -> OrchestratorResult<OrchestratorConfig> {
        let mut config = OrchestratorConfig::default();

        if let Ok(val) = std::env::var("FOCUSGROUP_LOG_LEVEL") {
            config.logging.level = val;
        }
        if let Ok(val) = std::env::var("FOCUSGROUP_BUDGET_TOTAL_USD") {
            config.budget.total = val
                .parse()
                .map_err(|_| OrchestratorError::InvalidConfig(format!("invalid FOCUSGROUP_BUDGET_TOTAL_USD: {val}")))?;
        }
        if let Ok(val) = std::env::var("FOCUSGROUP_REVIEW_MODE") {
            config.review_mode = match val.as_str() {
                "blocking" => ReviewMode::Blocking,
                "auto_approve" => ReviewMode::AutoApprove,
                other => return Err(OrchestratorError::InvalidConfig(format!("unknown review mode: {other}"))),
            };
        }
        if let Ok(val) = std::env::var("FOCUSGROUP_WORKER_COUNT") {
            config.topology.worker_profiles = match val.parse::<usize>() {
                Ok(n) if n > 0 => default_worker_profiles(n),
                _ => return Err(OrchestratorError::InvalidConfig(format!("invalid FOCUSGROUP_WORKER_COUNT: {val}"))),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub service: ServiceConfig,
    pub budget: BudgetConfig,
    pub breakers: BreakerConfig,
    pub cache: CacheConfig,
    pub review_mode: ReviewMode,
    pub topology: WorkerTopology,
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            budget: BudgetConfig::default(),
            breakers: BreakerConfig::default(),
            cache: CacheConfig::default(),
            review_mode: ReviewMode::AutoApprove,
            topology: WorkerTopology::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        self.service.validate()?;
        self.cache.validate()?;
        self.topology.validate()?;
        self.logging.validate()?;
        if self.budget.total <= 0.0 {
            return Err(OrchestratorError::InvalidConfig("budget.total must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl ServiceConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.name.is_empty() {
            return Err(OrchestratorError::InvalidConfig("service.name cannot be empty".into()));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "focusgroup-orchestrator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub embedding_dimension: usize,
    pub top_k: usize,
}

impl CacheConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.embedding_dimension == 0 {
            return Err(OrchestratorError::InvalidConfig("cache.embedding_dimension must be nonzero".into()));
        }
        if self.top_k == 0 {
            return Err(OrchestratorError::InvalidConfig("cache.top_k must be nonzero".into()));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { embedding_dimension: 384, top_k: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProfileConfig {
    pub id: String,
    pub model: String,
    pub expertise: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTopology {
    pub worker_profiles: Vec<WorkerProfileConfig>,
}

impl WorkerTopology {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.worker_profiles.is_empty() {
            return Err(OrchestratorError::InvalidConfig("topology.worker_profiles cannot be empty".into()));
        }
        Ok(())
    }
}

impl Default for WorkerTopology {
    fn default() -> Self {
        Self { worker_profiles: default_worker_profiles(3) }
    }
}

/// The session's focus-group membership: heterogeneous models standing
/// in for junior/senior/specialist workers (spec.md §3).
fn default_worker_profiles(n: usize) -> Vec<WorkerProfileConfig> {
    let templates = [
        ("junior", "gpt-4o-mini", "general"),
        ("senior", "gpt-4o", "architecture"),
        ("specialist", "claude-3-5-sonnet", "testing"),
        ("fast", "claude-3-haiku", "general"),
    ];
    (0..n)
        .map(|i| {
            let (id, model, expertise) = templates[i % templates.len()];
            let id = if i < templates.len() { id.to_string() } else { format!("{id}-{i}") };
            WorkerProfileConfig { id, model: model.to_string(), expertise: expertise.to_string() }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl LoggingConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.level.as_str()) {
            return Err(OrchestratorError::InvalidConfig(format!("invalid log level: {}", self.level)));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_service_name() {
        let mut config = OrchestratorConfig::default();
        config.service.name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_minimal_toml_with_defaults_merged_in_missing_sections() {
        let toml_str = r#"
            [service]
            name = "focusgroup-orchestrator"
            version = "0.1.0"
            environment = "staging"

            [budget]
            total = 25.0
            workers_cap = 15.0
            expert_cap = 7.0
            browser_cap = 2.0
            embeddings_storage_cap = 1.0

            [breakers]
            consecutive_expert_failures = 5
            cost_spike_multiple = 2.0
            timeout_minutes = 60.0
            no_progress_minutes = 15.0

            [cache]
            embedding_dimension = 384
            top_k = 5

            review_mode = "blocking"

            [topology]
            worker_profiles = [
                { id = "junior", model = "gpt-4o-mini", expertise = "general" },
            ]

            [logging]
            level = "debug"
            json = true
        "#;
        let config = ConfigLoader::load_from_str(toml_str).unwrap();
        assert_eq!(config.service.environment, "staging");
        assert_eq!(config.review_mode, ReviewMode::Blocking);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = OrchestratorConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }
}
