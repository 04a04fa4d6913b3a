//! Quest status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestStatus {
    /// Created, not yet activated.
    Pending,
    /// Eligible for execution.
    Active,
    /// Finished successfully.
    Completed,
    /// Handler returned an error.
    Failed,
    /// Suspended until reactivated.
    Paused,
}

impl QuestStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: QuestStatus) -> bool {
        use QuestStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Active) | (Pending, Paused) |
            // From Active (routine success keeps it Active)
            (Active, Active) | (Active, Completed) | (Active, Failed) | (Active, Paused) |
            // From Paused
            (Paused, Active) |
            // Explicit reactivation; nothing retries automatically
            (Failed, Active)
        )
    }

    /// Terminal statuses are swept from memory after the retention window.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for QuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown quest status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_valid() {
        assert!(QuestStatus::Pending.can_transition_to(QuestStatus::Active));
        assert!(QuestStatus::Active.can_transition_to(QuestStatus::Active));
        assert!(QuestStatus::Active.can_transition_to(QuestStatus::Completed));
        assert!(QuestStatus::Active.can_transition_to(QuestStatus::Failed));
        assert!(QuestStatus::Active.can_transition_to(QuestStatus::Paused));
        assert!(QuestStatus::Paused.can_transition_to(QuestStatus::Active));
        assert!(QuestStatus::Failed.can_transition_to(QuestStatus::Active));
    }

    #[test]
    fn transitions_invalid() {
        assert!(!QuestStatus::Completed.can_transition_to(QuestStatus::Active));
        assert!(!QuestStatus::Completed.can_transition_to(QuestStatus::Paused));
        assert!(!QuestStatus::Failed.can_transition_to(QuestStatus::Completed));
        assert!(!QuestStatus::Paused.can_transition_to(QuestStatus::Completed));
        assert!(!QuestStatus::Pending.can_transition_to(QuestStatus::Failed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(QuestStatus::Completed.is_terminal());
        assert!(QuestStatus::Failed.is_terminal());
        assert!(!QuestStatus::Paused.is_terminal());
        assert!(!QuestStatus::Active.is_terminal());
    }

    #[test]
    fn display_parse() {
        for status in [
            QuestStatus::Pending,
            QuestStatus::Active,
            QuestStatus::Completed,
            QuestStatus::Failed,
            QuestStatus::Paused,
        ] {
            let parsed: QuestStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("running".parse::<QuestStatus>().is_err());
    }
}
