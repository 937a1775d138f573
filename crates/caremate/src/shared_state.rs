//! Shared state handed to every API handler.
//!
//! Components are built once at startup and shared through `Arc`s; handlers
//! never own a component, they only borrow it through [`UnifiedAppState`].

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::context_engine::SessionManager;
use crate::error::CareResult;
use crate::memory_db::MemoryDatabase;
use crate::model_runtime::BackendRouter;
use crate::scheduler::CareScheduler;

/// Core shared system state container
pub struct SharedSystemState {
    /// Read-only after initialization
    pub config: Arc<Config>,
    pub database: Arc<MemoryDatabase>,
    pub router: Arc<BackendRouter>,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<CareScheduler>,
}

impl SharedSystemState {
    pub fn new(config: Config, database: Arc<MemoryDatabase>, router: Arc<BackendRouter>) -> CareResult<Self> {
        info!("Initializing shared system state");
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&database),
            Arc::clone(&router),
            &config,
        )?);
        let scheduler = Arc::new(CareScheduler::new(Arc::clone(&sessions), &config)?);
        Ok(Self {
            config: Arc::new(config),
            database,
            router,
            sessions,
            scheduler,
        })
    }
}

/// Unified application state for all API handlers.
#[derive(Clone)]
pub struct UnifiedAppState {
    pub shared_state: Arc<SharedSystemState>,
}

impl UnifiedAppState {
    pub fn new(shared_state: Arc<SharedSystemState>) -> Self {
        Self { shared_state }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.shared_state.sessions
    }

    pub fn scheduler(&self) -> &CareScheduler {
        &self.shared_state.scheduler
    }
}
