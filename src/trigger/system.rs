//! Event-driven trigger system.
//!
//! Producers push events onto a bounded mailbox without blocking; a single
//! consumer drains it in FIFO order and evaluates every registered trigger.
//! A match creates and activates a quest through the engine.
//!
//! The registry lock is never held across an engine call: each pass works
//! on a snapshot, then claims the trigger under a short write lock that
//! re-checks the guards before counting the activation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TriggerConfig;
use crate::error::TriggerError;
use crate::quest::{META_EVENT_ID, META_EVENT_TYPE, META_TRIGGER_ID, QuestEngine};
use crate::trigger::model::{ConditionOperator, EventType, Payload, QuestEvent, QuestTrigger};

/// Registered trigger plus its compiled `matches` pattern.
#[derive(Clone)]
struct TriggerEntry {
    trigger: QuestTrigger,
    pattern: Option<Regex>,
}

/// Snapshot of the trigger system counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    /// Events offered to the mailbox.
    pub received: u64,
    /// Events rejected because the mailbox was full.
    pub dropped: u64,
    /// Trigger activations (guards and condition passed).
    pub matched: u64,
    pub quests_created: u64,
    pub creation_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    matched: AtomicU64,
    quests_created: AtomicU64,
    creation_failures: AtomicU64,
}

pub struct TriggerSystem {
    config: TriggerConfig,
    engine: Arc<QuestEngine>,
    triggers: RwLock<HashMap<Uuid, TriggerEntry>>,
    tx: mpsc::Sender<QuestEvent>,
    /// Taken by the consumer on start.
    rx: Mutex<Option<mpsc::Receiver<QuestEvent>>>,
    shutdown: CancellationToken,
    counters: Counters,
}

impl TriggerSystem {
    pub fn new(config: TriggerConfig, engine: Arc<QuestEngine>) -> Self {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        Self {
            config,
            engine,
            triggers: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register (or replace, by id) a trigger.
    pub async fn register_trigger(&self, trigger: QuestTrigger) -> Result<Uuid, TriggerError> {
        if self
            .engine
            .registry()
            .definition(&trigger.definition_id)
            .is_none()
        {
            return Err(TriggerError::Validation(format!(
                "unknown quest definition '{}'",
                trigger.definition_id
            )));
        }

        let pattern = match &trigger.condition {
            Some(c) if c.operator == ConditionOperator::Matches => {
                let source = c.value.as_str().ok_or_else(|| {
                    TriggerError::Validation(format!(
                        "condition on '{}' needs a string pattern",
                        c.field
                    ))
                })?;
                Some(Regex::new(source).map_err(|e| {
                    TriggerError::Validation(format!("invalid pattern '{source}': {e}"))
                })?)
            }
            _ => None,
        };

        let id = trigger.id;
        info!(
            trigger_id = %id,
            event_type = %trigger.event_type,
            definition_id = %trigger.definition_id,
            "Trigger registered"
        );
        self.triggers
            .write()
            .await
            .insert(id, TriggerEntry { trigger, pattern });
        Ok(id)
    }

    pub async fn unregister_trigger(&self, id: Uuid) -> Result<QuestTrigger, TriggerError> {
        let entry = self
            .triggers
            .write()
            .await
            .remove(&id)
            .ok_or(TriggerError::NotFound { id })?;
        info!(trigger_id = %id, "Trigger unregistered");
        Ok(entry.trigger)
    }

    pub async fn get_trigger(&self, id: Uuid) -> Result<QuestTrigger, TriggerError> {
        self.triggers
            .read()
            .await
            .get(&id)
            .map(|e| e.trigger.clone())
            .ok_or(TriggerError::NotFound { id })
    }

    /// Triggers scoped to `owner` (or all of them), oldest first.
    pub async fn list_triggers(&self, owner: Option<&str>) -> Vec<QuestTrigger> {
        let triggers = self.triggers.read().await;
        let mut list: Vec<QuestTrigger> = triggers
            .values()
            .filter(|e| owner.is_none_or(|o| e.trigger.owner.as_deref() == Some(o)))
            .map(|e| e.trigger.clone())
            .collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub async fn set_trigger_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<QuestTrigger, TriggerError> {
        let mut triggers = self.triggers.write().await;
        let entry = triggers.get_mut(&id).ok_or(TriggerError::NotFound { id })?;
        entry.trigger.enabled = enabled;
        debug!(trigger_id = %id, enabled, "Trigger toggled");
        Ok(entry.trigger.clone())
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Enqueue an event. Never blocks: a full mailbox drops the event.
    pub fn emit_event(&self, event: QuestEvent) -> Result<(), TriggerError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    capacity = self.config.mailbox_capacity,
                    "Event mailbox full, dropping event"
                );
                Err(TriggerError::MailboxFull {
                    capacity: self.config.mailbox_capacity,
                    event_id: event.id,
                })
            }
            Err(TrySendError::Closed(_)) => Err(TriggerError::Closed),
        }
    }

    /// Build an event stamped now and enqueue it. Returns the event id.
    pub fn emit_event_async(
        &self,
        event_type: EventType,
        owner: &str,
        payload: Payload,
    ) -> Result<Uuid, TriggerError> {
        let event = QuestEvent::new(event_type, owner, payload);
        let id = event.id;
        self.emit_event(event)?;
        Ok(id)
    }

    /// Events waiting in the mailbox.
    pub fn pending_events(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    // ── Consumer ────────────────────────────────────────────────────

    /// Spawn the consumer. It exits on [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>, TriggerError> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TriggerError::AlreadyStarted)?;

        let system = Arc::clone(self);
        Ok(tokio::spawn(async move {
            info!("Trigger consumer started");
            loop {
                tokio::select! {
                    biased;
                    _ = system.shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            system.process_event(&event).await;
                        }
                        None => break,
                    },
                }
            }
            info!("Trigger consumer stopped");
        }))
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    // ── Evaluation ──────────────────────────────────────────────────

    /// Evaluate every trigger against one event. Returns the number of
    /// quests created and activated.
    pub async fn process_event(&self, event: &QuestEvent) -> usize {
        self.process_event_at(event, Utc::now()).await
    }

    /// Like [`process_event`](Self::process_event) with an explicit clock.
    /// Cooldowns run on `now`; the producer's timestamp is metadata only.
    pub async fn process_event_at(&self, event: &QuestEvent, now: DateTime<Utc>) -> usize {
        let mut candidates: Vec<TriggerEntry> = {
            let triggers = self.triggers.read().await;
            triggers
                .values()
                .filter(|e| e.trigger.listens_to(event) && e.trigger.can_trigger(now))
                .cloned()
                .collect()
        };
        candidates.sort_by_key(|e| e.trigger.created_at);

        let mut created = 0;
        for entry in candidates {
            if let Some(condition) = &entry.trigger.condition
                && !condition.evaluate_with(&event.payload, entry.pattern.as_ref())
            {
                continue;
            }

            let Some(trigger) = self.claim(entry.trigger.id, event, now).await else {
                debug!(trigger_id = %entry.trigger.id, "Trigger no longer eligible");
                continue;
            };
            self.counters.matched.fetch_add(1, Ordering::Relaxed);

            if self.spawn_quest(&trigger, event).await {
                created += 1;
            }
        }
        created
    }

    /// Re-check the guards under the write lock and count the activation.
    async fn claim(
        &self,
        id: Uuid,
        event: &QuestEvent,
        now: DateTime<Utc>,
    ) -> Option<QuestTrigger> {
        let mut triggers = self.triggers.write().await;
        let entry = triggers.get_mut(&id)?;
        if !entry.trigger.listens_to(event) || !entry.trigger.can_trigger(now) {
            return None;
        }
        entry.trigger.trigger_count += 1;
        entry.trigger.last_trigger = Some(now);
        Some(entry.trigger.clone())
    }

    async fn spawn_quest(&self, trigger: &QuestTrigger, event: &QuestEvent) -> bool {
        let metadata = [
            (META_EVENT_ID.to_string(), event.id.to_string()),
            (META_EVENT_TYPE.to_string(), event.event_type.to_string()),
            (META_TRIGGER_ID.to_string(), trigger.id.to_string()),
        ];

        let result = match self
            .engine
            .create_quest_with_metadata(&trigger.definition_id, &event.chat_id, None, metadata)
            .await
        {
            Ok(quest) => self.engine.activate_quest(quest.id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(quest) => {
                self.counters.quests_created.fetch_add(1, Ordering::Relaxed);
                info!(
                    trigger_id = %trigger.id,
                    event_id = %event.id,
                    quest_id = %quest.id,
                    "Trigger fired"
                );
                true
            }
            Err(e) => {
                self.counters
                    .creation_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    trigger_id = %trigger.id,
                    event_id = %event.id,
                    "Failed to create quest from trigger: {}",
                    e
                );
                false
            }
        }
    }

    pub fn stats(&self) -> TriggerStats {
        TriggerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            quests_created: self.counters.quests_created.load(Ordering::Relaxed),
            creation_failures: self.counters.creation_failures.load(Ordering::Relaxed),
        }
    }
}
