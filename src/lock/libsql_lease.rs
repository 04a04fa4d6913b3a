//! Lease table in the quest database.
//!
//! Acquisition is an upsert that only overwrites an expired row, so the
//! database serializes competing instances. Release deletes the row only
//! when this instance is the recorded holder.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, params};
use tracing::debug;
use uuid::Uuid;

use super::DistributedLock;
use crate::error::DatabaseError;

/// libSQL-backed distributed lock. Requires the `quest_locks` table
/// (created by the store migrations).
#[derive(Clone)]
pub struct LibSqlLock {
    conn: Connection,
    holder: String,
}

impl LibSqlLock {
    /// Create a lock handle for one engine instance.
    pub fn new(conn: Connection) -> Self {
        Self::with_holder(conn, Uuid::new_v4().to_string())
    }

    pub fn with_holder(conn: Connection, holder: impl Into<String>) -> Self {
        Self {
            conn,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl DistributedLock for LibSqlLock {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool, DatabaseError> {
        let now_ms = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let expires_ms = now_ms.saturating_add(lease_ms);

        let changed = self
            .conn
            .execute(
                "INSERT INTO quest_locks (key, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE quest_locks.expires_at <= ?4",
                params![key, self.holder.as_str(), expires_ms, now_ms],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire: {e}")))?;

        let acquired = changed > 0;
        debug!(key, holder = %self.holder, acquired, "Lease acquisition");
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "DELETE FROM quest_locks WHERE key = ?1 AND holder = ?2",
                params![key, self.holder.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn second_holder_is_excluded() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = LibSqlLock::with_holder(db.connection(), "a");
        let b = LibSqlLock::with_holder(db.connection(), "b");

        assert!(a.try_acquire("quest:lock:1", Duration::from_secs(300)).await.unwrap());
        assert!(!b.try_acquire("quest:lock:1", Duration::from_secs(300)).await.unwrap());
        assert!(b.try_acquire("quest:lock:2", Duration::from_secs(300)).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = LibSqlLock::with_holder(db.connection(), "a");
        let b = LibSqlLock::with_holder(db.connection(), "b");

        assert!(a.try_acquire("k", Duration::from_secs(300)).await.unwrap());
        b.release("k").await.unwrap();
        assert!(!b.try_acquire("k", Duration::from_secs(300)).await.unwrap());

        a.release("k").await.unwrap();
        assert!(b.try_acquire("k", Duration::from_secs(300)).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_lease_does_not_wrap() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = LibSqlLock::with_holder(db.connection(), "a");
        let b = LibSqlLock::with_holder(db.connection(), "b");

        assert!(a.try_acquire("k", Duration::MAX).await.unwrap());
        assert!(!b.try_acquire("k", Duration::from_secs(300)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = LibSqlLock::with_holder(db.connection(), "a");
        let b = LibSqlLock::with_holder(db.connection(), "b");

        assert!(a.try_acquire("k", Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(b.try_acquire("k", Duration::from_secs(300)).await.unwrap());
    }
}
