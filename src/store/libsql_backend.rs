//! libSQL backend: async `QuestStore` implementation.
//!
//! Supports local file and in-memory databases. Checkpoints and metadata are
//! stored as JSON text, timestamps as RFC 3339.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::lock::LibSqlLock;
use crate::quest::{AutonomousState, Checkpoint, Quest, QuestStatus};
use crate::store::migrations;
use crate::store::traits::QuestStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Quest database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Handle to the shared connection.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    /// Lease-table lock sharing this database.
    pub fn lock(&self) -> LibSqlLock {
        LibSqlLock::new(self.connection())
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const QUEST_COLUMNS: &str = "id, name, description, quest_type, cadence, status, current_count, target_count, checkpoint, metadata, last_error, created_at, updated_at, last_executed_at, completed_at";

/// Map a libsql Row to a Quest. Column order matches QUEST_COLUMNS.
fn row_to_quest(row: &libsql::Row) -> Result<Quest, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("quest row parse: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let type_str: String = row.get(3).map_err(col)?;
    let cadence_str: String = row.get(4).map_err(col)?;
    let status_str: String = row.get(5).map_err(col)?;
    let checkpoint_str: String = row.get(8).map_err(col)?;
    let metadata_str: String = row.get(9).map_err(col)?;
    let created_str: String = row.get(11).map_err(col)?;
    let updated_str: String = row.get(12).map_err(col)?;
    let last_executed_str: Option<String> = row.get(13).ok();
    let completed_str: Option<String> = row.get(14).ok();

    let checkpoint: Checkpoint = serde_json::from_str(&checkpoint_str)
        .map_err(|e| DatabaseError::Serialization(format!("checkpoint: {e}")))?;
    let metadata: HashMap<String, String> = serde_json::from_str(&metadata_str)
        .map_err(|e| DatabaseError::Serialization(format!("metadata: {e}")))?;

    Ok(Quest {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("quest id: {e}")))?,
        name: row.get(1).map_err(col)?,
        description: row.get(2).map_err(col)?,
        quest_type: type_str.parse().map_err(DatabaseError::Serialization)?,
        cadence: cadence_str.parse().map_err(DatabaseError::Serialization)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        current_count: row.get(6).map_err(col)?,
        target_count: row.get(7).map_err(col)?,
        checkpoint,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        last_executed_at: parse_optional_datetime(&last_executed_str),
        completed_at: parse_optional_datetime(&completed_str),
        last_error: row.get(10).map_err(col)?,
        metadata,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl QuestStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Quests ──────────────────────────────────────────────────────

    async fn save_quest(&self, quest: &Quest) -> Result<(), DatabaseError> {
        let checkpoint = to_json(&quest.checkpoint)?;
        let metadata = to_json(&quest.metadata)?;

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO quests (id, name, description, quest_type, cadence, status, chat_id, current_count, target_count, checkpoint, metadata, last_error, created_at, updated_at, last_executed_at, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    quest.id.to_string(),
                    quest.name.as_str(),
                    quest.description.as_str(),
                    quest.quest_type.as_str(),
                    quest.cadence.as_str(),
                    quest.status.as_str(),
                    quest.owner().unwrap_or_default(),
                    quest.current_count,
                    quest.target_count,
                    checkpoint,
                    metadata,
                    quest.last_error.as_str(),
                    quest.created_at.to_rfc3339(),
                    quest.updated_at.to_rfc3339(),
                    opt_datetime(quest.last_executed_at),
                    opt_datetime(quest.completed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_quest: {e}")))?;

        debug!(quest_id = %quest.id, status = %quest.status, "Quest saved");
        Ok(())
    }

    async fn get_quest(&self, id: Uuid) -> Result<Quest, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {QUEST_COLUMNS} FROM quests WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_quest: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_quest(&row),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "quest".to_string(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_quest: {e}"))),
        }
    }

    async fn list_quests(
        &self,
        owner: Option<&str>,
        status: Option<QuestStatus>,
    ) -> Result<Vec<Quest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEST_COLUMNS} FROM quests
                     WHERE (?1 IS NULL OR chat_id = ?1) AND (?2 IS NULL OR status = ?2)
                     ORDER BY created_at ASC"
                ),
                params![opt_text(owner), opt_text(status.as_ref().map(QuestStatus::as_str))],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_quests: {e}")))?;

        let mut quests = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_quests: {e}")))?
        {
            quests.push(row_to_quest(&row)?);
        }
        Ok(quests)
    }

    async fn update_quest_progress(
        &self,
        id: Uuid,
        current_count: i64,
        checkpoint: &Checkpoint,
    ) -> Result<(), DatabaseError> {
        let checkpoint = to_json(checkpoint)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE quests SET current_count = ?1, checkpoint = ?2, updated_at = ?3 WHERE id = ?4",
                params![current_count, checkpoint, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_quest_progress: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "quest".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_last_executed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE quests SET last_executed_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![at.to_rfc3339(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_last_executed: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "quest".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Autonomous mode ─────────────────────────────────────────────

    async fn save_autonomous_state(&self, state: &AutonomousState) -> Result<(), DatabaseError> {
        let ids = to_json(&state.active_quest_ids)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO autonomous_states (chat_id, is_active, started_at, paused_at, active_quest_ids, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.chat_id.as_str(),
                    state.is_active as i64,
                    opt_datetime(state.started_at),
                    opt_datetime(state.paused_at),
                    ids,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_autonomous_state: {e}")))?;

        debug!(chat_id = %state.chat_id, active = state.is_active, "Autonomous state saved");
        Ok(())
    }

    async fn get_autonomous_state(&self, chat_id: &str) -> Result<AutonomousState, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT chat_id, is_active, started_at, paused_at, active_quest_ids FROM autonomous_states WHERE chat_id = ?1",
                params![chat_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_autonomous_state: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "autonomous_state".to_string(),
                    id: chat_id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("get_autonomous_state: {e}"))),
        };

        let col = |e: libsql::Error| DatabaseError::Query(format!("autonomous row parse: {e}"));
        let started_str: Option<String> = row.get(2).ok();
        let paused_str: Option<String> = row.get(3).ok();
        let ids_str: String = row.get(4).map_err(col)?;

        Ok(AutonomousState {
            chat_id: row.get(0).map_err(col)?,
            is_active: row.get::<i64>(1).map_err(col)? != 0,
            started_at: parse_optional_datetime(&started_str),
            paused_at: parse_optional_datetime(&paused_str),
            active_quest_ids: serde_json::from_str(&ids_str)
                .map_err(|e| DatabaseError::Serialization(format!("active_quest_ids: {e}")))?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
