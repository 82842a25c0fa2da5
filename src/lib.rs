//! A session-orchestration engine that coordinates a focus group of
//! heterogeneous LLM workers, each in its own sandbox, through a phase
//! state machine with stuck detection, a hybrid knowledge cache, and
//! budget/circuit-breaker discipline.

pub mod arbiter;
pub mod breakers;
pub mod cache;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod event_bus;
pub mod expert;
pub mod phase_engine;
pub mod review;
pub mod session;
pub mod testing;
pub mod types;
pub mod worker_driver;

pub use error::{OrchestratorError, OrchestratorResult};

/// Initialize structured logging from `RUST_LOG`, falling back to the
/// crate's default filter when unset. Call once at process startup.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("focusgroup_orchestrator=info,tokio=warn"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
