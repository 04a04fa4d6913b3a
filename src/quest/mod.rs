//! Quest lifecycle: definitions, state machine, scheduling and execution.

pub mod definitions;
pub mod engine;
pub mod handler;
pub mod model;
pub mod registry;
pub mod schedule;
pub mod state;

pub use definitions::builtin_definitions;
pub use engine::{ExecutionOutcome, ProgressWrite, QuestEngine, RecoveryReport};
pub use handler::{ExecutionContext, QuestHandler};
pub use model::{
    AutonomousState, Cadence, Checkpoint, Quest, QuestDefinition, QuestType, lock_key,
    META_CHAT_ID, META_DEFINITION_ID, META_EVENT_ID, META_EVENT_TYPE, META_TRIGGER_ID,
};
pub use registry::QuestRegistry;
pub use schedule::should_execute;
pub use state::QuestStatus;
