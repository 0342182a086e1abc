//! Queue module - rate budget, job handles and the dispatcher

pub mod dispatcher;
pub mod job;
pub mod rate_budget;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use job::{JobHandle, JobState};
pub use rate_budget::{RateBudget, SharedBudget};
