//! Progress & milestone manager.
//!
//! Wraps the engine's progress write with percent, ETA and milestone
//! derivation, and throttles outbound notifications. Notifications run as
//! tracked background tasks with their own timeout; a failed or slow sink
//! never affects quest state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProgressConfig;
use crate::error::{NotifyError, QuestError};
use crate::notify::{NotificationSink, ProgressUpdate, UpdateKind, format_remaining};
use crate::progress::milestone::{QuestMilestone, milestones_for, reach_next};
use crate::quest::model::percent_of;
use crate::quest::{Checkpoint, Quest, QuestEngine};

/// What one progress update produced.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub quest_id: Uuid,
    pub previous_percent: f64,
    pub percent: f64,
    /// Milestone reached by this update, if any.
    pub milestone: Option<QuestMilestone>,
    pub estimated_completion: Option<DateTime<Utc>>,
    /// This update completed the quest.
    pub completed_now: bool,
    /// The milestone or routine notification sent, if any. A completion
    /// notification is sent in addition whenever `completed_now` is set.
    pub notified: Option<UpdateKind>,
}

/// Current tracking state of one quest.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub quest_id: Uuid,
    pub percent: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_notified: Option<DateTime<Utc>>,
    pub milestones_reached: usize,
}

#[derive(Debug, Default)]
struct Tracker {
    milestones: Vec<QuestMilestone>,
    last_notified: Option<DateTime<Utc>>,
    eta: Option<DateTime<Utc>>,
}

pub struct ProgressManager {
    config: ProgressConfig,
    engine: Arc<QuestEngine>,
    sink: Arc<dyn NotificationSink>,
    trackers: RwLock<HashMap<Uuid, Tracker>>,
    tasks: TaskTracker,
}

impl ProgressManager {
    pub fn new(
        config: ProgressConfig,
        engine: Arc<QuestEngine>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            engine,
            sink,
            trackers: RwLock::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    fn new_tracker(&self) -> Tracker {
        Tracker {
            milestones: if self.config.milestones_enabled {
                milestones_for(&self.config.milestone_percents)
            } else {
                Vec::new()
            },
            ..Tracker::default()
        }
    }

    /// Start tracking a quest, resetting any earlier tracking state.
    pub async fn initialize_quest_progress(
        &self,
        id: Uuid,
        target_count: i64,
    ) -> Result<(), QuestError> {
        let quest = self.engine.get_quest(id).await?;
        if target_count != quest.target_count {
            debug!(
                quest_id = %id,
                target_count,
                quest_target = quest.target_count,
                "Initial target differs from the quest's; the quest's target drives percent"
            );
        }

        let mut tracker = self.new_tracker();
        if self.config.notify_on_start {
            tracker.last_notified = Some(Utc::now());
            self.dispatch(&quest, UpdateKind::Started, quest.status.to_string(), None);
        }
        self.trackers.write().await.insert(id, tracker);
        Ok(())
    }

    /// Record progress and derive milestone, ETA and notifications.
    pub async fn update_quest_progress(
        &self,
        id: Uuid,
        current_count: i64,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ProgressReport, QuestError> {
        // Engine first, so the completion invariant already holds.
        let write = self.engine.update_progress(id, current_count, checkpoint).await?;
        let quest = write.quest;
        let now = Utc::now();

        let previous_percent = percent_of(write.previous_count, quest.target_count);
        let percent = quest.percent_complete();
        let eta = estimate_completion(
            write.previous_count,
            quest.current_count,
            quest.target_count,
            self.config.update_interval,
            now,
        );

        let (milestone, notified) = {
            let mut trackers = self.trackers.write().await;
            let tracker = trackers.entry(id).or_insert_with(|| self.new_tracker());

            let routine_due = tracker.last_notified.is_none_or(|last| {
                chrono::Duration::from_std(self.config.update_interval)
                    .map(|interval| now - last >= interval)
                    .unwrap_or(true)
            });
            let milestone = reach_next(&mut tracker.milestones, previous_percent, percent, now);
            tracker.eta = eta;

            let notified = if milestone.is_some() && self.config.notify_on_milestone {
                Some(UpdateKind::Milestone)
            } else if routine_due {
                Some(UpdateKind::Progress)
            } else {
                None
            };
            if notified.is_some() || write.completed_now {
                tracker.last_notified = Some(now);
            }
            (milestone, notified)
        };

        match (notified, &milestone) {
            (Some(UpdateKind::Milestone), Some(m)) => {
                self.dispatch(&quest, UpdateKind::Milestone, m.name.clone(), eta);
            }
            (Some(kind), _) => {
                self.dispatch(&quest, kind, quest.status.to_string(), eta);
            }
            (None, _) => {}
        }
        if write.completed_now && self.config.notify_on_complete {
            self.dispatch(&quest, UpdateKind::Completed, quest.status.to_string(), None);
        }

        Ok(ProgressReport {
            quest_id: id,
            previous_percent,
            percent,
            milestone,
            estimated_completion: eta,
            completed_now: write.completed_now,
            notified,
        })
    }

    pub async fn milestones(&self, id: Uuid) -> Vec<QuestMilestone> {
        self.trackers
            .read()
            .await
            .get(&id)
            .map(|t| t.milestones.clone())
            .unwrap_or_default()
    }

    pub async fn progress_snapshot(&self, id: Uuid) -> Result<ProgressSnapshot, QuestError> {
        let quest = self.engine.get_quest(id).await?;
        let trackers = self.trackers.read().await;
        let tracker = trackers.get(&id);
        Ok(ProgressSnapshot {
            quest_id: id,
            percent: quest.percent_complete(),
            estimated_completion: tracker.and_then(|t| t.eta),
            last_notified: tracker.and_then(|t| t.last_notified),
            milestones_reached: tracker
                .map(|t| t.milestones.iter().filter(|m| m.is_reached()).count())
                .unwrap_or(0),
        })
    }

    /// Drop tracking for one quest.
    pub async fn forget(&self, id: Uuid) -> bool {
        self.trackers.write().await.remove(&id).is_some()
    }

    /// Drop tracking for quests the engine no longer holds.
    pub async fn prune(&self) -> usize {
        let ids: Vec<Uuid> = self.trackers.read().await.keys().copied().collect();
        let mut removed = 0;
        for id in ids {
            if self.engine.get_quest(id).await.is_err() && self.forget(id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Wait for in-flight notifications.
    pub async fn quiesce(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn dispatch(
        &self,
        quest: &Quest,
        kind: UpdateKind,
        status: String,
        eta: Option<DateTime<Utc>>,
    ) {
        let Some(owner) = quest.owner() else {
            debug!(quest_id = %quest.id, "Quest has no owner, notification skipped");
            return;
        };
        let Ok(recipient) = owner.parse::<i64>() else {
            warn!(quest_id = %quest.id, owner, "Owner is not a numeric recipient, notification skipped");
            return;
        };

        let update = ProgressUpdate {
            quest_id: quest.id,
            quest_name: quest.name.clone(),
            kind,
            current: quest.current_count,
            target: quest.target_count,
            percent: quest.percent_complete(),
            status,
            time_remaining: eta
                .map(|eta| format_remaining(eta - Utc::now()))
                .unwrap_or_default(),
        };

        let sink = Arc::clone(&self.sink);
        let timeout = self.config.notify_timeout;
        let quest_id = quest.id;
        self.tasks.spawn(async move {
            let result = match tokio::time::timeout(timeout, sink.notify(recipient, update)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout { recipient, timeout }),
            };
            if let Err(e) = result {
                warn!(quest_id = %quest_id, kind = ?kind, "Notification failed: {}", e);
            }
        });
    }
}

/// Linear extrapolation: the last update's delta is the rate per update
/// cycle. `None` unless progress increased and the target is still ahead.
pub fn estimate_completion(
    previous: i64,
    current: i64,
    target: i64,
    cycle: std::time::Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let rate = current - previous;
    if rate <= 0 || target <= 0 || current >= target {
        return None;
    }
    let cycles = (target - current) as f64 / rate as f64;
    let millis = (cycle.as_millis() as f64 * cycles).round();
    if !millis.is_finite() || millis > i64::MAX as f64 {
        return None;
    }
    chrono::Duration::try_milliseconds(millis as i64).and_then(|d| now.checked_add_signed(d))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::lock::NoopLock;
    use crate::notify::ChannelSink;
    use crate::quest::{QuestRegistry, QuestStatus};

    fn engine() -> Arc<QuestEngine> {
        Arc::new(QuestEngine::new(
            EngineConfig::default(),
            QuestRegistry::with_builtin_definitions(),
            None,
            Arc::new(NoopLock),
        ))
    }

    fn manager_with_channel(
        engine: Arc<QuestEngine>,
    ) -> (ProgressManager, mpsc::Receiver<(i64, ProgressUpdate)>) {
        let (sink, rx) = ChannelSink::channel(64);
        (
            ProgressManager::new(ProgressConfig::default(), engine, Arc::new(sink)),
            rx,
        )
    }

    async fn drain(
        manager: &ProgressManager,
        rx: &mut mpsc::Receiver<(i64, ProgressUpdate)>,
    ) -> Vec<(i64, ProgressUpdate)> {
        manager.quiesce().await;
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    async fn goal(engine: &Arc<QuestEngine>, owner: &str, target: i64) -> Uuid {
        let quest = engine
            .create_quest("profit_goal", owner, Some(target))
            .await
            .unwrap();
        engine.activate_quest(quest.id).await.unwrap();
        quest.id
    }

    #[tokio::test]
    async fn initialize_builds_milestones_and_notifies_start() {
        let engine = engine();
        let (manager, mut rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "123", 100).await;

        manager.initialize_quest_progress(id, 100).await.unwrap();
        let percents: Vec<u32> = manager.milestones(id).await.iter().map(|m| m.percent).collect();
        assert_eq!(percents, [25, 50, 75, 90, 100]);

        let sent = drain(&manager, &mut rx).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 123);
        assert_eq!(sent[0].1.kind, UpdateKind::Started);
    }

    #[tokio::test]
    async fn initialize_unknown_quest() {
        let (manager, _rx) = manager_with_channel(engine());
        assert!(matches!(
            manager.initialize_quest_progress(Uuid::new_v4(), 10).await,
            Err(QuestError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn crossing_quarter_reaches_first_milestone_once() {
        let engine = engine();
        let (manager, mut rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "123", 100).await;
        manager.initialize_quest_progress(id, 100).await.unwrap();

        let report = manager.update_quest_progress(id, 20, None).await.unwrap();
        assert!(report.milestone.is_none());

        let report = manager.update_quest_progress(id, 26, None).await.unwrap();
        assert_eq!(report.milestone.as_ref().map(|m| m.percent), Some(25));
        assert_eq!(report.notified, Some(UpdateKind::Milestone));
        assert_eq!(report.previous_percent, 20.0);
        assert_eq!(report.percent, 26.0);

        // Same progress again: nothing new
        let report = manager.update_quest_progress(id, 26, None).await.unwrap();
        assert!(report.milestone.is_none());

        let sent = drain(&manager, &mut rx).await;
        let milestone_updates: Vec<_> = sent
            .iter()
            .filter(|(_, u)| u.kind == UpdateKind::Milestone)
            .collect();
        assert_eq!(milestone_updates.len(), 1);
        assert_eq!(milestone_updates[0].1.status, "Quarter Way");
    }

    #[tokio::test]
    async fn routine_updates_are_throttled() {
        let engine = engine();
        let (manager, mut rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "7", 1000).await;

        // No tracker yet and nothing sent: first update is due
        let first = manager.update_quest_progress(id, 1, None).await.unwrap();
        assert_eq!(first.notified, Some(UpdateKind::Progress));
        let second = manager.update_quest_progress(id, 2, None).await.unwrap();
        assert_eq!(second.notified, None);

        let sent = drain(&manager, &mut rx).await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn routine_update_is_due_again_after_interval() {
        let engine = engine();
        let (sink, mut rx) = ChannelSink::channel(16);
        let config = ProgressConfig {
            update_interval: Duration::from_millis(150),
            ..ProgressConfig::default()
        };
        let manager = ProgressManager::new(config, engine.clone(), Arc::new(sink));
        let id = goal(&engine, "7", 1000).await;

        let first = manager.update_quest_progress(id, 1, None).await.unwrap();
        assert_eq!(first.notified, Some(UpdateKind::Progress));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let later = manager.update_quest_progress(id, 2, None).await.unwrap();
        assert_eq!(later.notified, Some(UpdateKind::Progress));

        let sent = drain(&manager, &mut rx).await;
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn zero_update_interval_notifies_every_update() {
        let engine = engine();
        let (sink, _rx) = ChannelSink::channel(16);
        let config = ProgressConfig {
            update_interval: Duration::ZERO,
            ..ProgressConfig::default()
        };
        let manager = ProgressManager::new(config, engine.clone(), Arc::new(sink));
        let id = goal(&engine, "7", 1000).await;

        for count in 1..=3 {
            let report = manager.update_quest_progress(id, count, None).await.unwrap();
            assert_eq!(report.notified, Some(UpdateKind::Progress));
        }
    }

    #[tokio::test]
    async fn completion_sends_milestone_and_completion() {
        let engine = engine();
        let (manager, mut rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "9", 10).await;
        manager.initialize_quest_progress(id, 10).await.unwrap();

        let report = manager.update_quest_progress(id, 10, None).await.unwrap();
        assert!(report.completed_now);
        assert_eq!(report.percent, 100.0);
        assert!(report.estimated_completion.is_none());
        // First unreached milestone in order wins
        assert_eq!(report.milestone.as_ref().map(|m| m.percent), Some(25));

        let quest = engine.get_quest(id).await.unwrap();
        assert_eq!(quest.status, QuestStatus::Completed);

        let kinds: Vec<UpdateKind> = drain(&manager, &mut rx)
            .await
            .into_iter()
            .map(|(_, u)| u.kind)
            .collect();
        assert_eq!(kinds.len(), 3);
        for kind in [UpdateKind::Started, UpdateKind::Milestone, UpdateKind::Completed] {
            assert!(kinds.contains(&kind), "{kind:?} missing from {kinds:?}");
        }

        // Already complete: no second completion notification
        let report = manager.update_quest_progress(id, 11, None).await.unwrap();
        assert!(!report.completed_now);
    }

    #[tokio::test]
    async fn eta_extrapolates_last_delta() {
        let engine = engine();
        let (manager, _rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "1", 100).await;

        manager.update_quest_progress(id, 10, None).await.unwrap();
        let before = Utc::now();
        let report = manager.update_quest_progress(id, 20, None).await.unwrap();

        // 80 remaining at 10 per 5-minute cycle = 40 minutes
        let eta = report.estimated_completion.unwrap();
        let expected = before + chrono::Duration::minutes(40);
        assert!((eta - expected).num_seconds().abs() <= 5, "{eta} vs {expected}");

        let snapshot = manager.progress_snapshot(id).await.unwrap();
        assert_eq!(snapshot.estimated_completion, Some(eta));
        assert_eq!(snapshot.percent, 20.0);
    }

    #[test]
    fn eta_requires_forward_progress() {
        let now = Utc::now();
        let cycle = Duration::from_secs(300);
        assert!(estimate_completion(10, 10, 100, cycle, now).is_none());
        assert!(estimate_completion(20, 10, 100, cycle, now).is_none());
        assert!(estimate_completion(0, 10, 0, cycle, now).is_none());
        assert!(estimate_completion(90, 100, 100, cycle, now).is_none());
        assert_eq!(
            estimate_completion(0, 50, 100, cycle, now),
            Some(now + chrono::Duration::minutes(5))
        );
    }

    #[tokio::test]
    async fn non_numeric_owner_is_not_notified() {
        let engine = engine();
        let (manager, mut rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "chat-abc", 4).await;

        manager.initialize_quest_progress(id, 4).await.unwrap();
        let report = manager.update_quest_progress(id, 4, None).await.unwrap();
        assert!(report.completed_now);
        assert!(drain(&manager, &mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn milestones_disabled() {
        let engine = engine();
        let (sink, _rx) = ChannelSink::channel(8);
        let config = ProgressConfig {
            milestones_enabled: false,
            ..ProgressConfig::default()
        };
        let manager = ProgressManager::new(config, engine.clone(), Arc::new(sink));
        let id = goal(&engine, "1", 100).await;

        manager.initialize_quest_progress(id, 100).await.unwrap();
        assert!(manager.milestones(id).await.is_empty());
        let report = manager.update_quest_progress(id, 60, None).await.unwrap();
        assert!(report.milestone.is_none());
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl NotificationSink for Hanging {
        async fn notify(&self, _recipient: i64, _update: ProgressUpdate) -> Result<(), NotifyError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_times_out_without_affecting_progress() {
        let engine = engine();
        let manager = ProgressManager::new(ProgressConfig::default(), engine.clone(), Arc::new(Hanging));
        let id = goal(&engine, "5", 2).await;

        let report = manager.update_quest_progress(id, 2, None).await.unwrap();
        assert!(report.completed_now);

        // Both notifications give up after the 10s budget
        manager.quiesce().await;
        assert_eq!(engine.get_quest(id).await.unwrap().status, QuestStatus::Completed);
    }

    #[tokio::test]
    async fn checkpoint_is_written_through_engine() {
        let engine = engine();
        let (manager, _rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "1", 100).await;

        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("last_trade".into(), serde_json::json!("t-42"));
        manager
            .update_quest_progress(id, 5, Some(checkpoint.clone()))
            .await
            .unwrap();
        assert_eq!(engine.get_quest(id).await.unwrap().checkpoint, checkpoint);
    }

    #[tokio::test]
    async fn forget_and_prune() {
        let engine = engine();
        let (manager, _rx) = manager_with_channel(engine.clone());
        let id = goal(&engine, "1", 100).await;
        manager.initialize_quest_progress(id, 100).await.unwrap();

        assert_eq!(manager.prune().await, 0);
        assert!(manager.forget(id).await);
        assert!(!manager.forget(id).await);

        manager.trackers.write().await.insert(Uuid::new_v4(), Tracker::default());
        assert_eq!(manager.prune().await, 1);
    }
}
