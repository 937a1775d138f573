//! HTTP handlers. Each one borrows components from [`UnifiedAppState`](crate::shared_state::UnifiedAppState)
//! and maps [`CareError`](crate::error::CareError) through [`ApiError`].

pub mod error;
pub mod health_api;
pub mod schedule_api;
pub mod session_api;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use health_api::healthz;
pub use schedule_api::{
    create_schedule, delete_schedule, get_memory, list_schedules, list_summaries, set_schedule_enabled,
    trigger_schedule, update_schedule,
};
pub use session_api::{
    archive_session, create_session, delete_session, export_session, get_history, list_sessions, send_message,
};
