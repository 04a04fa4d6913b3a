//! Outbound progress notifications.
//!
//! The progress manager hands every update to a [`NotificationSink`]. Sinks
//! are fire-and-forget from the manager's point of view: failures are
//! logged there and never touch quest state.

pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::NotifyError;

pub use webhook::WebhookSink;

/// Why an update was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Started,
    Progress,
    Milestone,
    Completed,
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub quest_id: Uuid,
    pub quest_name: String,
    pub kind: UpdateKind,
    pub current: i64,
    pub target: i64,
    pub percent: f64,
    /// Quest status, or the milestone name for milestone updates.
    pub status: String,
    /// Human-readable ETA ("1h 5m"), empty when unknown.
    pub time_remaining: String,
}

/// Delivers updates to a numeric recipient.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, recipient: i64, update: ProgressUpdate) -> Result<(), NotifyError>;
}

/// Logs updates instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, recipient: i64, update: ProgressUpdate) -> Result<(), NotifyError> {
        tracing::info!(
            recipient,
            quest_id = %update.quest_id,
            kind = ?update.kind,
            percent = update.percent,
            status = %update.status,
            eta = %update.time_remaining,
            "Quest progress: {} {}/{}",
            update.quest_name,
            update.current,
            update.target
        );
        Ok(())
    }
}

/// Forwards updates onto an mpsc channel, for embedding and tests.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<(i64, ProgressUpdate)>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<(i64, ProgressUpdate)>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(i64, ProgressUpdate)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, recipient: i64, update: ProgressUpdate) -> Result<(), NotifyError> {
        self.tx
            .send((recipient, update))
            .await
            .map_err(|_| NotifyError::SendFailed {
                recipient,
                reason: "receiver dropped".to_string(),
            })
    }
}

/// Render a duration as "2d 3h", "1h 5m", "4m" or "30s".
pub fn format_remaining(remaining: chrono::Duration) -> String {
    let secs = remaining.num_seconds().max(0);
    let (days, hours, mins) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    match (days, hours, mins) {
        (d, h, _) if d > 0 => format!("{d}d {h}h"),
        (_, h, m) if h > 0 => format!("{h}h {m}m"),
        (_, _, m) if m > 0 => format!("{m}m"),
        _ => format!("{secs}s"),
    }
}
