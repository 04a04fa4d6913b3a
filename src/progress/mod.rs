//! Progress tracking, milestones and notification throttling.

pub mod manager;
pub mod milestone;

pub use manager::{ProgressManager, ProgressReport, ProgressSnapshot, estimate_completion};
pub use milestone::QuestMilestone;
