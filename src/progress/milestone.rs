//! Milestones: percent thresholds stamped once when first crossed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestMilestone {
    pub percent: u32,
    pub name: String,
    pub description: String,
    /// Set once, never re-armed.
    pub reached_at: Option<DateTime<Utc>>,
}

impl QuestMilestone {
    pub fn new(percent: u32) -> Self {
        let name = match percent {
            25 => "Quarter Way".to_string(),
            50 => "Halfway".to_string(),
            75 => "Three Quarters".to_string(),
            90 => "Almost There".to_string(),
            100 => "Complete".to_string(),
            p => format!("{p}% Complete"),
        };
        Self {
            percent,
            description: format!("Reached {percent}% of the target"),
            name,
            reached_at: None,
        }
    }

    pub fn is_reached(&self) -> bool {
        self.reached_at.is_some()
    }
}

/// One milestone per configured percent, in configuration order.
pub fn milestones_for(percents: &[u32]) -> Vec<QuestMilestone> {
    percents.iter().copied().map(QuestMilestone::new).collect()
}

/// Stamp the first unreached milestone with `previous < percent <= current`
/// and return a copy of it. At most one milestone per call.
pub fn reach_next(
    milestones: &mut [QuestMilestone],
    previous_pct: f64,
    current_pct: f64,
    now: DateTime<Utc>,
) -> Option<QuestMilestone> {
    let milestone = milestones.iter_mut().find(|m| {
        let threshold = f64::from(m.percent);
        !m.is_reached() && previous_pct < threshold && threshold <= current_pct
    })?;
    milestone.reached_at = Some(now);
    Some(milestone.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names() {
        let ms = milestones_for(&[25, 50, 75, 90, 100, 33]);
        let names: Vec<_> = ms.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "Quarter Way",
                "Halfway",
                "Three Quarters",
                "Almost There",
                "Complete",
                "33% Complete"
            ]
        );
        assert!(ms.iter().all(|m| !m.is_reached()));
    }

    #[test]
    fn crossing_stamps_once() {
        let mut ms = milestones_for(&[25, 50]);
        let now = Utc::now();

        let hit = reach_next(&mut ms, 20.0, 26.0, now).unwrap();
        assert_eq!(hit.percent, 25);
        assert_eq!(ms[0].reached_at, Some(now));

        assert!(reach_next(&mut ms, 20.0, 26.0, now).is_none());
    }

    #[test]
    fn one_per_call_in_order() {
        let mut ms = milestones_for(&[25, 50, 75]);
        let now = Utc::now();
        assert_eq!(reach_next(&mut ms, 0.0, 80.0, now).unwrap().percent, 25);
        assert_eq!(reach_next(&mut ms, 0.0, 80.0, now).unwrap().percent, 50);
    }

    #[test]
    fn exact_threshold_counts_but_start_does_not() {
        let mut ms = milestones_for(&[50]);
        let now = Utc::now();
        assert!(reach_next(&mut ms, 50.0, 60.0, now).is_none());
        assert!(reach_next(&mut ms, 40.0, 50.0, now).is_some());
    }
}
