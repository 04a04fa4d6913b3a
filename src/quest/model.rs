//! Core quest types.
//!
//! A quest is a schedulable, resumable unit of autonomous work materialized
//! from an immutable [`QuestDefinition`].

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::QuestStatus;

/// Metadata key holding the owning chat/session.
pub const META_CHAT_ID: &str = "chat_id";
/// Metadata key holding the originating definition.
pub const META_DEFINITION_ID: &str = "definition_id";
/// Metadata keys stamped on trigger-spawned quests.
pub const META_EVENT_ID: &str = "event_id";
pub const META_EVENT_TYPE: &str = "event_type";
pub const META_TRIGGER_ID: &str = "trigger_id";

/// Open resume state a handler persists across executions.
pub type Checkpoint = serde_json::Map<String, serde_json::Value>;

/// Distributed lock key prefix.
const LOCK_PREFIX: &str = "quest:lock:";

/// What kind of work a quest performs. Handlers are registered per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestType {
    Routine,
    Triggered,
    Goal,
    Arbitrage,
}

impl QuestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routine => "routine",
            Self::Triggered => "triggered",
            Self::Goal => "goal",
            Self::Arbitrage => "arbitrage",
        }
    }
}

impl std::fmt::Display for QuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "routine" => Ok(Self::Routine),
            "triggered" => Ok(Self::Triggered),
            "goal" => Ok(Self::Goal),
            "arbitrage" => Ok(Self::Arbitrage),
            other => Err(format!("unknown quest type: {other}")),
        }
    }
}

/// Recurrence class of a quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every minute.
    Micro,
    Hourly,
    Daily,
    Weekly,
    /// Never picked up by the scheduling loop.
    #[serde(rename = "onetime")]
    OneTime,
}

impl Cadence {
    /// Minimum elapsed time between runs, `None` for one-time quests.
    pub fn interval(&self) -> Option<chrono::Duration> {
        match self {
            Self::Micro => Some(chrono::Duration::minutes(1)),
            Self::Hourly => Some(chrono::Duration::hours(1)),
            Self::Daily => Some(chrono::Duration::hours(24)),
            Self::Weekly => Some(chrono::Duration::days(7)),
            Self::OneTime => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Micro => "micro",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::OneTime => "onetime",
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "micro" => Ok(Self::Micro),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "onetime" => Ok(Self::OneTime),
            other => Err(format!("unknown cadence: {other}")),
        }
    }
}

/// Immutable quest template, registered once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub quest_type: QuestType,
    pub cadence: Cadence,
    /// Objective text handed to the handler.
    pub prompt: String,
    pub default_target: i64,
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quest {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub quest_type: QuestType,
    pub cadence: Cadence,
    pub status: QuestStatus,

    // Progress (`target_count <= 0` means no completion threshold)
    pub current_count: i64,
    pub target_count: i64,
    #[serde(default)]
    pub checkpoint: Checkpoint,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Empty when healthy.
    #[serde(default)]
    pub last_error: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Quest {
    /// Materialize a pending quest from a definition.
    pub fn from_definition(
        definition: &QuestDefinition,
        owner: &str,
        target_override: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        let mut metadata = HashMap::new();
        metadata.insert(META_CHAT_ID.to_string(), owner.to_string());
        metadata.insert(META_DEFINITION_ID.to_string(), definition.id.clone());

        Self {
            id: Uuid::new_v4(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            quest_type: definition.quest_type,
            cadence: definition.cadence,
            status: QuestStatus::Pending,
            current_count: 0,
            target_count: target_override.unwrap_or(definition.default_target),
            checkpoint: Checkpoint::new(),
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            completed_at: None,
            last_error: String::new(),
            metadata,
        }
    }

    /// Owning chat/session, if any.
    pub fn owner(&self) -> Option<&str> {
        self.metadata
            .get(META_CHAT_ID)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn definition_id(&self) -> Option<&str> {
        self.metadata.get(META_DEFINITION_ID).map(String::as_str)
    }

    /// `min(100, current*100/target)`, or 0 without a threshold.
    pub fn percent_complete(&self) -> f64 {
        percent_of(self.current_count, self.target_count)
    }

    /// Whether the progress threshold has been met.
    pub fn target_reached(&self) -> bool {
        self.target_count > 0 && self.current_count >= self.target_count
    }

    /// Key guarding cross-process execution of this quest.
    pub fn lock_key(&self) -> String {
        lock_key(self.id)
    }
}

pub fn lock_key(id: Uuid) -> String {
    format!("{LOCK_PREFIX}{id}")
}

pub(crate) fn percent_of(current: i64, target: i64) -> f64 {
    if target <= 0 {
        return 0.0;
    }
    (current as f64 * 100.0 / target as f64).clamp(0.0, 100.0)
}

/// Per-owner autonomous mode toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousState {
    pub chat_id: String,
    pub is_active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_quest_ids: Vec<Uuid>,
}

impl AutonomousState {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            is_active: false,
            started_at: None,
            paused_at: None,
            active_quest_ids: Vec::new(),
        }
    }
}
