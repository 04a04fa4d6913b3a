//! `QuestStore` trait: durable persistence for quests and autonomous state.
//!
//! The engine treats the store as best-effort: its in-memory table stays
//! authoritative and store failures are logged, never propagated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::quest::{AutonomousState, Checkpoint, Quest, QuestStatus};

/// Backend-agnostic quest persistence.
///
/// Lookups of absent records return [`DatabaseError::NotFound`], distinct
/// from transport/query failures.
#[async_trait]
pub trait QuestStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Quests ──────────────────────────────────────────────────────

    /// Insert or replace a quest record.
    async fn save_quest(&self, quest: &Quest) -> Result<(), DatabaseError>;

    async fn get_quest(&self, id: Uuid) -> Result<Quest, DatabaseError>;

    /// List quests, optionally filtered by owner and/or status.
    async fn list_quests(
        &self,
        owner: Option<&str>,
        status: Option<QuestStatus>,
    ) -> Result<Vec<Quest>, DatabaseError>;

    async fn update_quest_progress(
        &self,
        id: Uuid,
        current_count: i64,
        checkpoint: &Checkpoint,
    ) -> Result<(), DatabaseError>;

    async fn update_last_executed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Autonomous mode ─────────────────────────────────────────────

    /// Insert or replace the owner's state (one record per owner).
    async fn save_autonomous_state(&self, state: &AutonomousState) -> Result<(), DatabaseError>;

    async fn get_autonomous_state(&self, chat_id: &str) -> Result<AutonomousState, DatabaseError>;
}
