//! Context engine: token budgeting, context assembly, rolling summaries and
//! the session manager that drives each turn.

pub mod budget;
pub mod context_builder;
pub mod prompts;
pub mod session_manager;
pub mod summarizer;

pub use context_builder::{AssembledContext, ContextBuilder};
pub use prompts::TimeOfDay;
pub use session_manager::{check_in_instruction_at, ChatExchange, ProactiveDelivery, SessionManager};
pub use summarizer::{Summarizer, SummaryDraft};
