//! Handler boundary into trading logic.

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::model::{Quest, QuestDefinition};

/// Execution-scoped context handed to a handler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub quest_id: Uuid,
    /// Definition the quest was created from, when still registered.
    pub definition: Option<QuestDefinition>,
    /// Cancelled once the execution budget runs out.
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution has been cancelled. Handlers select on
    /// this around long waits.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Executes quests of one [`QuestType`](super::model::QuestType).
///
/// A handler may mutate only `current_count` and `checkpoint` on the quest
/// it receives; the engine copies back those two fields and owns the rest.
/// The returned error's display text becomes the quest's `last_error`.
#[async_trait]
pub trait QuestHandler: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, quest: &mut Quest) -> anyhow::Result<()>;
}
