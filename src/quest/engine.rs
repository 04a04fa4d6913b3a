//! Quest execution engine.
//!
//! Owns the in-memory quest table, the autonomous-mode state per owner and
//! the scheduling loop. Each tick sweeps stale terminal quests, then spawns
//! an independent execution for every active quest whose cadence is due.
//! Executions are serialized per quest by a distributed lease so several
//! engine instances can share one store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DatabaseError, QuestError};
use crate::lock::DistributedLock;
use crate::quest::handler::ExecutionContext;
use crate::quest::model::{AutonomousState, Checkpoint, Quest, QuestType};
use crate::quest::registry::QuestRegistry;
use crate::quest::schedule::{default_min_spacing, should_execute};
use crate::quest::state::QuestStatus;
use crate::store::QuestStore;

/// What happened to one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler ran; the quest now has this status.
    Executed { status: QuestStatus },
    /// Another holder owns the lease (or the lock backend failed).
    Skipped,
    /// The quest was no longer active once the lease was taken.
    NotActive,
    /// No handler registered for the quest's type.
    NoHandler,
}

/// Result of a progress write.
#[derive(Debug, Clone)]
pub struct ProgressWrite {
    pub previous_count: i64,
    pub quest: Quest,
    /// The write moved the quest into `completed`.
    pub completed_now: bool,
}

/// Quests reloaded at startup.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub restored: Vec<Uuid>,
    pub paused: Vec<Uuid>,
}

/// The quest engine.
pub struct QuestEngine {
    config: EngineConfig,
    registry: QuestRegistry,
    store: Option<Arc<dyn QuestStore>>,
    lock: Arc<dyn DistributedLock>,
    quests: Arc<RwLock<HashMap<Uuid, Quest>>>,
    autonomous: Arc<RwLock<HashMap<String, AutonomousState>>>,
    /// Serializes store writes so the last write always carries the latest state.
    persist_gate: Arc<Mutex<()>>,
    /// Executions and persistence writes in flight.
    tasks: TaskTracker,
    shutdown: CancellationToken,
    permits: Option<Arc<Semaphore>>,
}

impl QuestEngine {
    pub fn new(
        config: EngineConfig,
        registry: QuestRegistry,
        store: Option<Arc<dyn QuestStore>>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        let permits = config
            .max_concurrent_executions
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        Self {
            config,
            registry,
            store,
            lock,
            quests: Arc::new(RwLock::new(HashMap::new())),
            autonomous: Arc::new(RwLock::new(HashMap::new())),
            persist_gate: Arc::new(Mutex::new(())),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            permits,
        }
    }

    pub fn registry(&self) -> &QuestRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Materialize a pending quest from a registered definition.
    pub async fn create_quest(
        &self,
        definition_id: &str,
        owner: &str,
        target_override: Option<i64>,
    ) -> Result<Quest, QuestError> {
        let definition =
            self.registry
                .definition(definition_id)
                .ok_or_else(|| QuestError::DefinitionNotFound {
                    id: definition_id.to_string(),
                })?;

        let quest = Quest::from_definition(definition, owner, target_override);
        self.quests.write().await.insert(quest.id, quest.clone());
        self.persist(quest.id);

        info!(
            quest_id = %quest.id,
            definition_id,
            owner,
            "Quest created"
        );
        Ok(quest)
    }

    /// Create a quest and stamp extra metadata before it is first persisted.
    pub async fn create_quest_with_metadata(
        &self,
        definition_id: &str,
        owner: &str,
        target_override: Option<i64>,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Quest, QuestError> {
        let definition =
            self.registry
                .definition(definition_id)
                .ok_or_else(|| QuestError::DefinitionNotFound {
                    id: definition_id.to_string(),
                })?;

        let mut quest = Quest::from_definition(definition, owner, target_override);
        quest.metadata.extend(metadata);
        self.quests.write().await.insert(quest.id, quest.clone());
        self.persist(quest.id);

        info!(quest_id = %quest.id, definition_id, owner, "Quest created");
        Ok(quest)
    }

    pub async fn get_quest(&self, id: Uuid) -> Result<Quest, QuestError> {
        self.quests
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(QuestError::NotFound { id })
    }

    /// List in-memory quests, optionally filtered by owner and status,
    /// oldest first.
    pub async fn list_quests(&self, owner: Option<&str>, status: Option<QuestStatus>) -> Vec<Quest> {
        let quests = self.quests.read().await;
        let mut list: Vec<Quest> = quests
            .values()
            .filter(|q| owner.is_none_or(|o| q.owner() == Some(o)))
            .filter(|q| status.is_none_or(|s| q.status == s))
            .cloned()
            .collect();
        list.sort_by_key(|q| q.created_at);
        list
    }

    pub async fn active_count(&self) -> usize {
        self.quests
            .read()
            .await
            .values()
            .filter(|q| q.status == QuestStatus::Active)
            .count()
    }

    /// Move a quest to `active`. One-time quests are not picked up by the
    /// ticker, so they are dispatched right away.
    pub async fn activate_quest(self: &Arc<Self>, id: Uuid) -> Result<Quest, QuestError> {
        let quest = self
            .set_status(id, QuestStatus::Active, |q| q.last_error.clear())
            .await?;

        if quest.cadence.interval().is_none() {
            self.dispatch(id);
        }
        Ok(quest)
    }

    pub async fn pause_quest(&self, id: Uuid) -> Result<Quest, QuestError> {
        self.set_status(id, QuestStatus::Paused, |_| {}).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        target: QuestStatus,
        also: impl FnOnce(&mut Quest),
    ) -> Result<Quest, QuestError> {
        let updated = {
            let mut quests = self.quests.write().await;
            let quest = quests.get_mut(&id).ok_or(QuestError::NotFound { id })?;
            transition(quest, target)?;
            also(quest);
            quest.clone()
        };
        self.persist(id);
        debug!(quest_id = %id, status = %target, "Quest status changed");
        Ok(updated)
    }

    /// Record handler-reported progress.
    ///
    /// Reaching a positive target always completes the quest.
    pub async fn update_progress(
        &self,
        id: Uuid,
        current_count: i64,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ProgressWrite, QuestError> {
        let write = {
            let mut quests = self.quests.write().await;
            let quest = quests.get_mut(&id).ok_or(QuestError::NotFound { id })?;
            let previous_count = quest.current_count;
            let now = Utc::now();

            quest.current_count = current_count;
            if let Some(checkpoint) = checkpoint {
                quest.checkpoint = checkpoint;
            }
            quest.updated_at = now;

            let completed_now = quest.target_reached() && quest.status != QuestStatus::Completed;
            if completed_now {
                quest.status = QuestStatus::Completed;
                quest.completed_at = Some(now);
            }

            ProgressWrite {
                previous_count,
                quest: quest.clone(),
                completed_now,
            }
        };

        if write.completed_now {
            self.persist(id);
        } else {
            self.persist_progress(id, false);
        }

        Ok(write)
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Spawn the scheduling loop. Stops on [`QuestEngine::stop`].
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // interval() panics on a zero period
            let period = engine.config.tick_interval.max(std::time::Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            info!(
                interval_secs = engine.config.tick_interval.as_secs(),
                "Quest scheduler started"
            );
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.tick(Utc::now()).await;
                    }
                }
            }
            info!("Quest scheduler stopped");
        })
    }

    /// One scheduling pass. Returns the number of executions dispatched;
    /// they run on their own and are not awaited.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let swept = self.cleanup(now).await;
        if swept > 0 {
            debug!(swept, "Swept terminal quests");
        }

        let min_spacing =
            chrono::Duration::from_std(self.config.min_spacing).unwrap_or(default_min_spacing());
        let due: Vec<Uuid> = {
            let quests = self.quests.read().await;
            quests
                .values()
                .filter(|q| q.status == QuestStatus::Active && should_execute(q, now, min_spacing))
                .map(|q| q.id)
                .collect()
        };

        for id in &due {
            self.dispatch(*id);
        }
        due.len()
    }

    /// Drop terminal quests untouched for longer than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = now - retention;

        let mut quests = self.quests.write().await;
        let before = quests.len();
        quests.retain(|_, q| !(q.status.is_terminal() && q.updated_at < cutoff));
        before - quests.len()
    }

    fn dispatch(self: &Arc<Self>, id: Uuid) {
        let engine = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = engine.execute_quest(id).await {
                warn!(quest_id = %id, "Quest execution aborted: {}", e);
            }
        });
    }

    /// Run one execution of a quest under its distributed lease.
    pub async fn execute_quest(&self, id: Uuid) -> Result<ExecutionOutcome, QuestError> {
        let snapshot = self.get_quest(id).await?;

        let Some(handler) = self.registry.handler(snapshot.quest_type) else {
            warn!(
                quest_id = %id,
                quest_type = %snapshot.quest_type,
                "No handler registered, skipping execution"
            );
            return Ok(ExecutionOutcome::NoHandler);
        };

        let _permit = match &self.permits {
            Some(permits) => match Arc::clone(permits).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Ok(ExecutionOutcome::Skipped),
            },
            None => None,
        };

        let timeout = self.config.execution_timeout;
        let key = snapshot.lock_key();
        match self.lock.try_acquire(&key, timeout).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(quest_id = %id, "Lease held elsewhere, skipping execution");
                return Ok(ExecutionOutcome::Skipped);
            }
            Err(e) => {
                warn!(quest_id = %id, "Lock backend error, skipping execution: {}", e);
                return Ok(ExecutionOutcome::Skipped);
            }
        }

        let outcome = self.run_locked(id, handler, timeout).await;

        if let Err(e) = self.lock.release(&key).await {
            warn!(quest_id = %id, "Failed to release lease (expires on its own): {}", e);
        }
        outcome
    }

    async fn run_locked(
        &self,
        id: Uuid,
        handler: Arc<dyn crate::quest::QuestHandler>,
        timeout: std::time::Duration,
    ) -> Result<ExecutionOutcome, QuestError> {
        // Re-read under the lease: a concurrent run may have finished it.
        let current = self.get_quest(id).await?;
        if current.status != QuestStatus::Active {
            debug!(quest_id = %id, status = %current.status, "Quest no longer active");
            return Ok(ExecutionOutcome::NotActive);
        }

        let cancel = CancellationToken::new();
        let ctx = ExecutionContext {
            quest_id: id,
            definition: current
                .definition_id()
                .and_then(|d| self.registry.definition(d))
                .cloned(),
            cancel: cancel.clone(),
            deadline: Instant::now() + timeout,
        };

        let started = std::time::Instant::now();
        let mut working = current;
        let result = match tokio::time::timeout(timeout, handler.execute(&ctx, &mut working)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "execution deadline of {}s exceeded",
                timeout.as_secs()
            )),
        };
        cancel.cancel();

        let now = Utc::now();
        let updated = {
            let mut quests = self.quests.write().await;
            let quest = quests.get_mut(&id).ok_or(QuestError::NotFound { id })?;
            quest.current_count = working.current_count;
            quest.checkpoint = working.checkpoint;
            quest.updated_at = now;

            match &result {
                Err(e) => {
                    quest.last_error = format!("{e:#}");
                    if quest.status.can_transition_to(QuestStatus::Failed) {
                        quest.status = QuestStatus::Failed;
                    }
                }
                Ok(()) => {
                    quest.last_executed_at = Some(now);
                    quest.last_error.clear();
                    if quest.quest_type != QuestType::Routine
                        && quest.status.can_transition_to(QuestStatus::Completed)
                    {
                        quest.status = QuestStatus::Completed;
                        quest.completed_at = Some(now);
                    }
                }
            }
            quest.clone()
        };

        match &result {
            Ok(()) => info!(
                quest_id = %id,
                status = %updated.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Quest executed"
            ),
            Err(e) => warn!(quest_id = %id, "Quest execution failed: {:#}", e),
        }

        if updated.quest_type == QuestType::Routine && result.is_ok() {
            self.persist_progress(id, true);
        } else {
            self.persist(id);
        }

        Ok(ExecutionOutcome::Executed {
            status: updated.status,
        })
    }

    // ── Autonomous mode ─────────────────────────────────────────────

    /// Turn on autonomous mode for an owner: pause what was running for
    /// them (and any ownerless legacy quests), then start the default set.
    pub async fn begin_autonomous(self: &Arc<Self>, owner: &str) -> Result<AutonomousState, QuestError> {
        if owner.is_empty() {
            return Err(QuestError::Validation("owner must not be empty".to_string()));
        }
        for definition_id in &self.config.autonomous_definitions {
            if self.registry.definition(definition_id).is_none() {
                return Err(QuestError::DefinitionNotFound {
                    id: definition_id.clone(),
                });
            }
        }

        let paused: Vec<Uuid> = {
            let mut quests = self.quests.write().await;
            quests
                .values_mut()
                .filter(|q| {
                    q.status == QuestStatus::Active && q.owner().is_none_or(|o| o == owner)
                })
                .map(|q| {
                    q.status = QuestStatus::Paused;
                    q.updated_at = Utc::now();
                    q.id
                })
                .collect()
        };
        for id in &paused {
            self.persist(*id);
        }
        if !paused.is_empty() {
            info!(owner, count = paused.len(), "Paused previously active quests");
        }

        let mut started = Vec::new();
        for definition_id in &self.config.autonomous_definitions {
            let quest = self.create_quest(definition_id, owner, None).await?;
            self.activate_quest(quest.id).await?;
            started.push(quest.id);
        }

        let state = {
            let mut states = self.autonomous.write().await;
            let state = states
                .entry(owner.to_string())
                .or_insert_with(|| AutonomousState::new(owner));
            state.is_active = true;
            state.started_at = Some(Utc::now());
            state.paused_at = None;
            state.active_quest_ids = started;
            state.clone()
        };
        self.persist_autonomous(owner);

        info!(owner, quests = state.active_quest_ids.len(), "Autonomous mode started");
        Ok(state)
    }

    /// Turn off autonomous mode for an owner and pause its quests.
    pub async fn pause_autonomous(&self, owner: &str) -> Result<AutonomousState, QuestError> {
        let (state, to_pause) = {
            let mut states = self.autonomous.write().await;
            let state = states
                .get_mut(owner)
                .ok_or_else(|| QuestError::NoAutonomousState {
                    owner: owner.to_string(),
                })?;
            state.is_active = false;
            state.paused_at = Some(Utc::now());
            let to_pause = std::mem::take(&mut state.active_quest_ids);
            (state.clone(), to_pause)
        };

        for id in to_pause {
            match self.pause_quest(id).await {
                Ok(_) => {}
                Err(e) => debug!(quest_id = %id, "Not paused: {}", e),
            }
        }
        self.persist_autonomous(owner);

        info!(owner, "Autonomous mode paused");
        Ok(state)
    }

    pub async fn autonomous_state(&self, owner: &str) -> Option<AutonomousState> {
        self.autonomous.read().await.get(owner).cloned()
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Reload quests that were active when the previous process stopped.
    ///
    /// Only execution-class quests with an owner stay active, at most one
    /// per owner; everything else is paused and persisted as paused.
    pub async fn recover(&self) -> Result<RecoveryReport, DatabaseError> {
        let Some(store) = self.store.clone() else {
            return Ok(RecoveryReport::default());
        };

        let active = store.list_quests(None, Some(QuestStatus::Active)).await?;
        let mut report = RecoveryReport::default();
        let mut owners = HashSet::new();
        let mut to_save = Vec::new();

        {
            let mut quests = self.quests.write().await;
            for mut quest in active {
                let keep = match (quest.owner(), quest.definition_id()) {
                    (Some(owner), Some(definition_id)) if self.is_execution_class(definition_id) => {
                        owners.insert(owner.to_string())
                    }
                    _ => false,
                };

                if keep {
                    report.restored.push(quest.id);
                } else {
                    quest.status = QuestStatus::Paused;
                    quest.updated_at = Utc::now();
                    report.paused.push(quest.id);
                    to_save.push(quest.clone());
                }
                quests.insert(quest.id, quest);
            }
        }

        for quest in &to_save {
            if let Err(e) = store.save_quest(quest).await {
                warn!(quest_id = %quest.id, "Failed to persist paused quest: {}", e);
            }
        }

        for owner in owners {
            match store.get_autonomous_state(&owner).await {
                Ok(mut state) => {
                    state
                        .active_quest_ids
                        .retain(|id| report.restored.contains(id));
                    self.autonomous.write().await.insert(owner, state);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(owner = %owner, "Failed to load autonomous state: {}", e),
            }
        }

        info!(
            restored = report.restored.len(),
            paused = report.paused.len(),
            "Quest recovery complete"
        );
        Ok(report)
    }

    fn is_execution_class(&self, definition_id: &str) -> bool {
        self.config
            .autonomous_definitions
            .iter()
            .any(|d| d == definition_id)
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Signal the scheduling loop to stop. In-flight executions keep running.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for every in-flight execution and store write to finish.
    pub async fn quiesce(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Mirror the current in-memory record to the store in the background.
    fn persist(&self, id: Uuid) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let quests = Arc::clone(&self.quests);
        let gate = Arc::clone(&self.persist_gate);
        self.tasks.spawn(async move {
            let _guard = gate.lock().await;
            let Some(quest) = quests.read().await.get(&id).cloned() else {
                return;
            };
            if let Err(e) = store.save_quest(&quest).await {
                warn!(quest_id = %id, "Failed to persist quest: {}", e);
            }
        });
    }

    /// Partial write of progress (and the last run time after a successful
    /// routine execution), taken from the latest in-memory record.
    fn persist_progress(&self, id: Uuid, executed: bool) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let quests = Arc::clone(&self.quests);
        let gate = Arc::clone(&self.persist_gate);
        self.tasks.spawn(async move {
            let _guard = gate.lock().await;
            let Some(quest) = quests.read().await.get(&id).cloned() else {
                return;
            };
            let mut result = store
                .update_quest_progress(id, quest.current_count, &quest.checkpoint)
                .await;
            if executed
                && result.is_ok()
                && let Some(at) = quest.last_executed_at
            {
                result = store.update_last_executed(id, at).await;
            }
            if let Err(e) = result {
                warn!(quest_id = %id, "Failed to persist quest progress: {}", e);
            }
        });
    }

    fn persist_autonomous(&self, owner: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let states = Arc::clone(&self.autonomous);
        let gate = Arc::clone(&self.persist_gate);
        let owner = owner.to_string();
        self.tasks.spawn(async move {
            let _guard = gate.lock().await;
            let Some(state) = states.read().await.get(&owner).cloned() else {
                return;
            };
            if let Err(e) = store.save_autonomous_state(&state).await {
                warn!(owner = %owner, "Failed to persist autonomous state: {}", e);
            }
        });
    }
}

fn transition(quest: &mut Quest, target: QuestStatus) -> Result<(), QuestError> {
    if !quest.status.can_transition_to(target) {
        return Err(QuestError::InvalidTransition {
            id: quest.id,
            state: quest.status.to_string(),
            target: target.to_string(),
        });
    }
    quest.status = target;
    quest.updated_at = Utc::now();
    Ok(())
}
