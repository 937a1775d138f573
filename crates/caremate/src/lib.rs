pub mod api;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod model_runtime;
pub mod safety;
pub mod scheduler;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod test_support;

// Public API exports
pub use config::Config;
pub use context_engine::{ChatExchange, ProactiveDelivery, SessionManager, Summarizer};
pub use error::{CareError, CareResult};
pub use memory::{Role, Turn};
pub use memory_db::MemoryDatabase;
pub use model_runtime::BackendRouter;
pub use safety::{SafetyCategory, SafetyFilter, SafetyVerdict};
pub use scheduler::{CareScheduler, TriggerSpec};
pub use server::run_server;
