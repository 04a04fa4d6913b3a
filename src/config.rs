//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` that overlays `QUEST_*`
//! environment variables. Absent variables keep the default; unparsable
//! ones are errors.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Quest engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduling loop period.
    pub tick_interval: Duration,
    /// Per-execution deadline; also the distributed lock lease.
    pub execution_timeout: Duration,
    /// Global minimum spacing between two executions of one quest.
    pub min_spacing: Duration,
    /// Terminal quests are swept once untouched for this long.
    pub retention: Duration,
    /// Optional cap on concurrently running executions (None = unbounded).
    pub max_concurrent_executions: Option<usize>,
    /// Definitions started by autonomous mode. Also the set of
    /// execution-class quests kept active across restarts.
    pub autonomous_definitions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(300), // 5 minutes
            min_spacing: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            max_concurrent_executions: None,
            autonomous_definitions: vec!["scalp_execution".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retention = match env_parse::<u64>("QUEST_RETENTION_HOURS")? {
            Some(hours) => retention_from_hours(hours)?,
            None => defaults.retention,
        };
        let config = Self {
            tick_interval: env_secs("QUEST_TICK_SECS")?.unwrap_or(defaults.tick_interval),
            execution_timeout: env_secs("QUEST_EXECUTION_TIMEOUT_SECS")?
                .unwrap_or(defaults.execution_timeout),
            min_spacing: env_secs("QUEST_MIN_SPACING_SECS")?.unwrap_or(defaults.min_spacing),
            retention,
            max_concurrent_executions: env_parse("QUEST_MAX_CONCURRENT")?,
            autonomous_definitions: env_list("QUEST_AUTONOMOUS_DEFINITIONS")
                .unwrap_or(defaults.autonomous_definitions),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_TICK_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.execution_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_EXECUTION_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_concurrent_executions == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_MAX_CONCURRENT".to_string(),
                message: "must be at least 1 when set".to_string(),
            });
        }
        // chrono::Duration caps out well below Duration::MAX
        if chrono::Duration::from_std(self.retention).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_RETENTION_HOURS".to_string(),
                message: "retention is out of range".to_string(),
            });
        }
        Ok(())
    }
}

fn retention_from_hours(hours: u64) -> Result<Duration, ConfigError> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "QUEST_RETENTION_HOURS".to_string(),
            message: format!("{hours} hours is out of range"),
        })
}

/// Trigger system configuration.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Bounded event mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

impl TriggerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let capacity = env_parse::<usize>("QUEST_MAILBOX_CAPACITY")?
            .unwrap_or(Self::default().mailbox_capacity);
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEST_MAILBOX_CAPACITY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            mailbox_capacity: capacity,
        })
    }
}

/// Progress and milestone configuration.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub milestones_enabled: bool,
    /// Milestone thresholds in percent, in evaluation order.
    pub milestone_percents: Vec<u32>,
    pub notify_on_start: bool,
    pub notify_on_milestone: bool,
    pub notify_on_complete: bool,
    /// Minimum spacing of routine progress notifications; also the ETA cycle length.
    pub update_interval: Duration,
    /// Budget for one outbound notification.
    pub notify_timeout: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            milestones_enabled: true,
            milestone_percents: vec![25, 50, 75, 90, 100],
            notify_on_start: true,
            notify_on_milestone: true,
            notify_on_complete: true,
            update_interval: Duration::from_secs(300),
            notify_timeout: Duration::from_secs(10),
        }
    }
}

impl ProgressConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let milestone_percents = match env_list("QUEST_MILESTONES") {
            Some(items) => items
                .iter()
                .map(|s| {
                    s.parse::<u32>()
                        .ok()
                        .filter(|p| (1..=100).contains(p))
                        .ok_or_else(|| ConfigError::InvalidValue {
                            key: "QUEST_MILESTONES".to_string(),
                            message: format!("'{s}' is not a percent between 1 and 100"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.milestone_percents,
        };

        Ok(Self {
            milestones_enabled: env_parse("QUEST_MILESTONES_ENABLED")?
                .unwrap_or(defaults.milestones_enabled),
            milestone_percents,
            notify_on_start: env_parse("QUEST_NOTIFY_ON_START")?
                .unwrap_or(defaults.notify_on_start),
            notify_on_milestone: defaults.notify_on_milestone,
            notify_on_complete: defaults.notify_on_complete,
            update_interval: env_secs("QUEST_UPDATE_INTERVAL_SECS")?
                .unwrap_or(defaults.update_interval),
            notify_timeout: env_secs("QUEST_NOTIFY_TIMEOUT_SECS")?
                .unwrap_or(defaults.notify_timeout),
        })
    }
}

/// Which distributed lock backend the binary wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// Single-instance mode: acquisition always succeeds.
    None,
    /// Lease table in the quest database.
    LibSql,
}

impl FromStr for LockBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "noop" => Ok(Self::None),
            "libsql" => Ok(Self::LibSql),
            other => Err(ConfigError::InvalidValue {
                key: "QUEST_LOCK_BACKEND".to_string(),
                message: format!("unknown lock backend '{other}'"),
            }),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}
