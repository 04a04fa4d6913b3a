use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use quest_engine::config::{EngineConfig, LockBackend, ProgressConfig, TriggerConfig};
use quest_engine::lock::{DistributedLock, NoopLock};
use quest_engine::notify::{NotificationSink, TracingSink, WebhookSink};
use quest_engine::progress::ProgressManager;
use quest_engine::quest::{ExecutionContext, Quest, QuestEngine, QuestHandler, QuestRegistry, QuestType};
use quest_engine::store::{LibSqlBackend, QuestStore};
use quest_engine::trigger::{QuestTrigger, TriggerSystem};

/// Stand-in handler until trading logic is plugged in: logs and succeeds.
struct LogOnlyHandler;

#[async_trait]
impl QuestHandler for LogOnlyHandler {
    async fn execute(&self, ctx: &ExecutionContext, quest: &mut Quest) -> anyhow::Result<()> {
        tracing::info!(
            quest_id = %ctx.quest_id,
            quest_type = %quest.quest_type,
            "Executing quest: {}",
            quest.name
        );
        Ok(())
    }
}

/// Store, lock and engine from the environment, with recovery applied.
async fn open_engine() -> Result<Arc<QuestEngine>, quest_engine::Error> {
    let engine_config = EngineConfig::from_env()?;
    let lock_backend: LockBackend = std::env::var("QUEST_LOCK_BACKEND")
        .unwrap_or_else(|_| "libsql".to_string())
        .parse()?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("QUEST_DB_PATH").unwrap_or_else(|_| "./data/quests.db".to_string());
    let db = Arc::new(LibSqlBackend::new_local(std::path::Path::new(&db_path)).await?);
    let store: Arc<dyn QuestStore> = db.clone();
    eprintln!("   Database: {}", db_path);

    let lock: Arc<dyn DistributedLock> = match lock_backend {
        LockBackend::None => Arc::new(NoopLock),
        LockBackend::LibSql => Arc::new(db.lock()),
    };
    eprintln!("   Lock backend: {:?}", lock_backend);

    // ── Engine ───────────────────────────────────────────────────────────
    let mut registry = QuestRegistry::with_builtin_definitions();
    for quest_type in [
        QuestType::Routine,
        QuestType::Triggered,
        QuestType::Goal,
        QuestType::Arbitrage,
    ] {
        registry.register_handler(quest_type, Arc::new(LogOnlyHandler));
    }

    let engine = Arc::new(QuestEngine::new(
        engine_config,
        registry,
        Some(store),
        lock,
    ));
    let report = engine.recover().await?;
    eprintln!(
        "   Recovered {} active quests ({} paused)",
        report.restored.len(),
        report.paused.len()
    );
    Ok(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File logging when QUEST_LOG_DIR is set; the guard flushes on exit
    let (file_layer, _log_guard) = match std::env::var("QUEST_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "questd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let trigger_config = TriggerConfig::from_env()?;
    let progress_config = ProgressConfig::from_env()?;

    eprintln!("questd v{}", env!("CARGO_PKG_VERSION"));

    let engine = open_engine().await?;

    // ── Progress notifications ──────────────────────────────────────────
    let sink: Arc<dyn NotificationSink> = match std::env::var("QUEST_WEBHOOK_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let token = std::env::var("QUEST_WEBHOOK_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(SecretString::from);
            let webhook = WebhookSink::new(url, token);
            eprintln!("   Notifications: webhook {}", webhook.url());
            Arc::new(webhook)
        }
        _ => Arc::new(TracingSink),
    };
    let progress = Arc::new(ProgressManager::new(progress_config, engine.clone(), sink));

    // ── Triggers ─────────────────────────────────────────────────────────
    let triggers = Arc::new(TriggerSystem::new(trigger_config, engine.clone()));
    for trigger in [
        QuestTrigger::price_movement("price_breakout", 5.0),
        QuestTrigger::arbitrage("arbitrage_capture", 0.5),
        QuestTrigger::trade_completed("trade_review"),
        QuestTrigger::risk_threshold("drawdown_guard", 10.0),
    ] {
        triggers.register_trigger(trigger).await?;
    }
    let consumer = triggers.start()?;

    // ── Scheduling ───────────────────────────────────────────────────────
    let ticker = engine.spawn_ticker();
    let prune_handle = {
        let progress = progress.clone();
        let every = engine.config().tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let pruned = progress.prune().await;
                if pruned > 0 {
                    tracing::debug!(pruned, "Dropped progress tracking for swept quests");
                }
            }
        })
    };

    eprintln!("   Running. Ctrl-C to stop.\n");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    triggers.stop();
    engine.stop();
    prune_handle.abort();
    for (name, handle) in [("trigger consumer", consumer), ("scheduler", ticker)] {
        if let Err(e) = handle.await {
            tracing::error!("{} task ended abnormally: {}", name, e);
        }
    }

    engine.quiesce().await;
    progress.quiesce().await;
    tracing::info!("questd stopped");
    Ok(())
}
