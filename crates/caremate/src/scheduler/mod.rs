//! Proactive check-ins: trigger parsing and the scheduler loop.

pub mod care_scheduler;
pub mod trigger;

pub use care_scheduler::CareScheduler;
pub use trigger::{parse_timezone, CronExpr, TriggerSpec};
