//! Built-in quest definitions.

use super::model::{Cadence, QuestDefinition, QuestType};

fn def(
    id: &str,
    name: &str,
    description: &str,
    quest_type: QuestType,
    cadence: Cadence,
    prompt: &str,
    default_target: i64,
) -> QuestDefinition {
    QuestDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        quest_type,
        cadence,
        prompt: prompt.to_string(),
        default_target,
    }
}

/// Definitions shipped with the engine. `scalp_execution` is the default
/// autonomous-mode quest.
pub fn builtin_definitions() -> Vec<QuestDefinition> {
    vec![
        def(
            "scalp_execution",
            "Scalp Execution",
            "Recurring execution cycle for autonomous trading",
            QuestType::Routine,
            Cadence::Micro,
            "Evaluate open setups and execute qualifying entries and exits.",
            0,
        ),
        def(
            "market_scan",
            "Market Scan",
            "Hourly scan of watched markets",
            QuestType::Routine,
            Cadence::Hourly,
            "Scan watched symbols and record notable movers.",
            0,
        ),
        def(
            "daily_report",
            "Daily Report",
            "End-of-day portfolio summary",
            QuestType::Routine,
            Cadence::Daily,
            "Summarize today's trades, PnL and open risk.",
            0,
        ),
        def(
            "weekly_review",
            "Weekly Review",
            "Weekly strategy performance review",
            QuestType::Routine,
            Cadence::Weekly,
            "Review the week's strategy performance and propose adjustments.",
            0,
        ),
        def(
            "price_breakout",
            "Price Breakout",
            "React to a sharp price movement",
            QuestType::Triggered,
            Cadence::OneTime,
            "Assess the price move and decide whether to enter.",
            1,
        ),
        def(
            "arbitrage_capture",
            "Arbitrage Capture",
            "Capture a cross-venue spread",
            QuestType::Arbitrage,
            Cadence::OneTime,
            "Verify the spread is still open and execute both legs.",
            1,
        ),
        def(
            "trade_review",
            "Trade Review",
            "Post-trade review of a completed trade",
            QuestType::Triggered,
            Cadence::OneTime,
            "Review the completed trade and record lessons.",
            1,
        ),
        def(
            "drawdown_guard",
            "Drawdown Guard",
            "De-risk after a drawdown threshold is crossed",
            QuestType::Triggered,
            Cadence::OneTime,
            "Reduce exposure until drawdown is back within limits.",
            1,
        ),
        def(
            "profit_goal",
            "Profit Goal",
            "Reach a profit target in incremental steps",
            QuestType::Goal,
            Cadence::OneTime,
            "Work toward the profit target one step at a time.",
            100,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_unique() {
        let defs = builtin_definitions();
        let ids: HashSet<_> = defs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), defs.len());
    }

    #[test]
    fn only_routines_recur() {
        for d in builtin_definitions() {
            if d.quest_type == QuestType::Routine {
                assert_ne!(d.cadence, Cadence::OneTime, "{}", d.id);
            } else {
                assert_eq!(d.cadence, Cadence::OneTime, "{}", d.id);
            }
        }
    }
}
