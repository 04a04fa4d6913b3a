//! Lease-based mutual exclusion for quest executions.
//!
//! A lease is set-if-absent with a TTL and released by delete. Expiry is the
//! safety net for holders that crash mid-execution.

pub mod libsql_lease;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::DatabaseError;

pub use libsql_lease::LibSqlLock;

/// Cross-process lock keyed by string.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lease for `key` unless another holder has an unexpired one.
    /// `Ok(false)` means contention, not failure.
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool, DatabaseError>;

    /// Drop the lease for `key` if this instance holds it.
    async fn release(&self, key: &str) -> Result<(), DatabaseError>;
}

/// Single-instance mode: every acquisition succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn try_acquire(&self, _key: &str, _lease: Duration) -> Result<bool, DatabaseError> {
        Ok(true)
    }

    async fn release(&self, _key: &str) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Process-local leases. Shared between engine instances in one process
/// (tests, embedded deployments) it behaves like a real backend.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an unexpired lease exists for `key`.
    pub fn is_held(&self, key: &str) -> bool {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.get(key).is_some_and(|exp| *exp > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool, DatabaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(expires_at) = leases.get(key)
            && *expires_at > now
        {
            return Ok(false);
        }
        leases.insert(key.to_string(), now + lease);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), DatabaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_always_acquires() {
        let lock = NoopLock;
        assert!(lock.try_acquire("k", Duration::from_secs(1)).await.unwrap());
        assert!(lock.try_acquire("k", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_excludes_second_holder() {
        let lock = InMemoryLock::new();
        assert!(lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        assert!(!lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        assert!(lock.try_acquire("other", Duration::from_secs(60)).await.unwrap());

        lock.release("k").await.unwrap();
        assert!(lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn in_memory_lease_expires() {
        let lock = InMemoryLock::new();
        assert!(lock.try_acquire("k", Duration::from_secs(300)).await.unwrap());
        assert!(lock.is_held("k"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!lock.is_held("k"));
        assert!(lock.try_acquire("k", Duration::from_secs(300)).await.unwrap());
    }
}
