//! Event-driven quest creation.

pub mod model;
pub mod system;

pub use model::{ConditionOperator, EventType, Payload, QuestEvent, QuestTrigger, TriggerCondition};
pub use system::{TriggerStats, TriggerSystem};
