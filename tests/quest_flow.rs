//! End-to-end quest flows against the libSQL store.
//!
//! Each test wires the engine, trigger system and progress manager the way
//! `questd` does, with handlers that record what they were asked to do.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::time::timeout;

use quest_engine::config::{EngineConfig, ProgressConfig, TriggerConfig};
use quest_engine::lock::{DistributedLock, LibSqlLock, NoopLock};
use quest_engine::notify::{ChannelSink, UpdateKind};
use quest_engine::progress::ProgressManager;
use quest_engine::quest::{
    ExecutionContext, ExecutionOutcome, META_TRIGGER_ID, Quest, QuestEngine, QuestHandler,
    QuestRegistry, QuestStatus, QuestType,
};
use quest_engine::store::{LibSqlBackend, QuestStore};
use quest_engine::trigger::{EventType, Payload, QuestTrigger, TriggerSystem};

/// Maximum time any wait is allowed before we consider the test hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts calls; optionally holds the lease for a while.
struct Recording {
    calls: Arc<AtomicUsize>,
    hold: Duration,
}

#[async_trait]
impl QuestHandler for Recording {
    async fn execute(&self, _ctx: &ExecutionContext, quest: &mut Quest) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        quest.current_count += 1;
        Ok(())
    }
}

fn registry_with(calls: &Arc<AtomicUsize>, hold: Duration) -> QuestRegistry {
    let mut registry = QuestRegistry::with_builtin_definitions();
    for quest_type in [QuestType::Routine, QuestType::Triggered, QuestType::Goal] {
        registry.register_handler(
            quest_type,
            Arc::new(Recording {
                calls: calls.clone(),
                hold,
            }),
        );
    }
    registry
}

fn engine(
    registry: QuestRegistry,
    store: Arc<dyn QuestStore>,
    lock: Arc<dyn DistributedLock>,
) -> Arc<QuestEngine> {
    Arc::new(QuestEngine::new(
        EngineConfig::default(),
        registry,
        Some(store),
        lock,
    ))
}

#[tokio::test]
async fn price_event_becomes_completed_quest_in_store() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry_with(&calls, Duration::ZERO),
        db.clone(),
        Arc::new(db.lock()),
    );

    let triggers = Arc::new(TriggerSystem::new(TriggerConfig::default(), engine.clone()));
    let trigger_id = triggers
        .register_trigger(QuestTrigger::price_movement("price_breakout", 5.0))
        .await
        .unwrap();
    let consumer = triggers.start().unwrap();

    let mut payload = Payload::new();
    payload.insert("price_change_pct".into(), json!(6.0));
    payload.insert("symbol".into(), json!("BTC-USD"));
    triggers
        .emit_event_async(EventType::PriceMovement, "123", payload)
        .unwrap();

    timeout(TEST_TIMEOUT, async {
        while triggers.stats().quests_created == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("trigger never fired");

    triggers.stop();
    consumer.await.unwrap();
    engine.quiesce().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = db.list_quests(Some("123"), None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, QuestStatus::Completed);
    assert_eq!(
        stored[0].metadata.get(META_TRIGGER_ID),
        Some(&trigger_id.to_string())
    );
}

#[tokio::test]
async fn two_instances_share_one_lease() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let hold = Duration::from_millis(150);

    let a = engine(
        registry_with(&calls, hold),
        db.clone(),
        Arc::new(LibSqlLock::with_holder(db.connection(), "instance-a")),
    );
    let quest = a.create_quest("scalp_execution", "1", None).await.unwrap();
    a.activate_quest(quest.id).await.unwrap();
    a.quiesce().await;

    // Second instance picks the quest up from the shared store
    let b = engine(
        registry_with(&calls, hold),
        db.clone(),
        Arc::new(LibSqlLock::with_holder(db.connection(), "instance-b")),
    );
    let report = b.recover().await.unwrap();
    assert_eq!(report.restored, vec![quest.id]);

    let outcomes = join_all([a.execute_quest(quest.id), b.execute_quest(quest.id)]).await;
    let outcomes: Vec<ExecutionOutcome> = outcomes.into_iter().map(Result::unwrap).collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(outcomes.contains(&ExecutionOutcome::Skipped));
    assert!(outcomes.contains(&ExecutionOutcome::Executed {
        status: QuestStatus::Active
    }));
}

#[tokio::test]
async fn restart_keeps_one_scheduler_per_owner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quests.db");
    let calls = Arc::new(AtomicUsize::new(0));

    let (chat1, chat2, scan) = {
        let db = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let first = engine(
            registry_with(&calls, Duration::ZERO),
            db.clone(),
            Arc::new(NoopLock),
        );
        let chat1 = first.begin_autonomous("1").await.unwrap();
        let chat2 = first.begin_autonomous("2").await.unwrap();
        let scan = first.create_quest("market_scan", "1", None).await.unwrap();
        first.activate_quest(scan.id).await.unwrap();
        first.stop();
        first.quiesce().await;
        (chat1, chat2, scan)
    };

    let db = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let second = engine(
        registry_with(&calls, Duration::ZERO),
        db.clone(),
        Arc::new(NoopLock),
    );
    let report = second.recover().await.unwrap();

    assert_eq!(report.restored.len(), 2);
    assert!(report.restored.contains(&chat1.active_quest_ids[0]));
    assert!(report.restored.contains(&chat2.active_quest_ids[0]));
    assert_eq!(report.paused, vec![scan.id]);
    assert_eq!(
        db.get_quest(scan.id).await.unwrap().status,
        QuestStatus::Paused
    );

    let state = second.autonomous_state("1").await.unwrap();
    assert!(state.is_active);
    assert_eq!(state.active_quest_ids, chat1.active_quest_ids);
}

#[tokio::test]
async fn goal_progress_is_mirrored_and_notified() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = engine(
        registry_with(&calls, Duration::ZERO),
        db.clone(),
        Arc::new(NoopLock),
    );
    let (sink, mut rx) = ChannelSink::channel(32);
    let progress = ProgressManager::new(ProgressConfig::default(), engine.clone(), Arc::new(sink));

    let quest = engine.create_quest("profit_goal", "555", Some(40)).await.unwrap();
    progress.initialize_quest_progress(quest.id, 40).await.unwrap();

    let report = progress.update_quest_progress(quest.id, 20, None).await.unwrap();
    assert_eq!(report.milestone.map(|m| m.percent), Some(25));
    let report = progress.update_quest_progress(quest.id, 40, None).await.unwrap();
    assert!(report.completed_now);

    engine.quiesce().await;
    progress.quiesce().await;

    let stored = db.get_quest(quest.id).await.unwrap();
    assert_eq!(stored.current_count, 40);
    assert_eq!(stored.status, QuestStatus::Completed);

    let mut kinds = Vec::new();
    while let Ok((recipient, update)) = rx.try_recv() {
        assert_eq!(recipient, 555);
        kinds.push(update.kind);
    }
    assert!(kinds.contains(&UpdateKind::Started));
    assert!(kinds.contains(&UpdateKind::Completed));
    assert_eq!(
        kinds.iter().filter(|k| **k == UpdateKind::Milestone).count(),
        2
    );
}
