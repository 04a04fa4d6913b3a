//! Definition and handler registries.
//!
//! Filled at startup, then moved into the engine where it is never mutated.

use std::collections::HashMap;
use std::sync::Arc;

use super::definitions::builtin_definitions;
use super::handler::QuestHandler;
use super::model::{QuestDefinition, QuestType};

/// Registered quest definitions and per-type handlers.
///
/// Handlers are keyed by [`QuestType`], not by definition: registering a
/// second handler for a type replaces the first. Per-definition behavior is
/// dispatched inside the handler via `ExecutionContext::definition`.
#[derive(Default, Clone)]
pub struct QuestRegistry {
    definitions: HashMap<String, QuestDefinition>,
    handlers: HashMap<QuestType, Arc<dyn QuestHandler>>,
}

impl QuestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in definitions.
    pub fn with_builtin_definitions() -> Self {
        let mut registry = Self::new();
        for definition in builtin_definitions() {
            registry.register_definition(definition);
        }
        registry
    }

    pub fn register_definition(&mut self, definition: QuestDefinition) {
        tracing::debug!(definition_id = %definition.id, "Registered quest definition");
        self.definitions.insert(definition.id.clone(), definition);
    }

    /// Register the handler for a quest type. Last registration wins.
    pub fn register_handler(&mut self, quest_type: QuestType, handler: Arc<dyn QuestHandler>) {
        if self.handlers.insert(quest_type, handler).is_some() {
            tracing::debug!(quest_type = %quest_type, "Replaced quest handler");
        } else {
            tracing::debug!(quest_type = %quest_type, "Registered quest handler");
        }
    }

    pub fn definition(&self, id: &str) -> Option<&QuestDefinition> {
        self.definitions.get(id)
    }

    pub fn handler(&self, quest_type: QuestType) -> Option<Arc<dyn QuestHandler>> {
        self.handlers.get(&quest_type).cloned()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &QuestDefinition> {
        self.definitions.values()
    }

    pub fn has_handler(&self, quest_type: QuestType) -> bool {
        self.handlers.contains_key(&quest_type)
    }
}
