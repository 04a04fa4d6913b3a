//! Trigger and event types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Open JSON payload carried by an event.
pub type Payload = serde_json::Map<String, Value>;

/// Kind of market/trading event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    PriceMovement,
    ArbitrageOpportunity,
    TradeCompleted,
    RiskThreshold,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PriceMovement => "price_movement",
            Self::ArbitrageOpportunity => "arbitrage_opportunity",
            Self::TradeCompleted => "trade_completed",
            Self::RiskThreshold => "risk_threshold",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "price_movement" => Self::PriceMovement,
            "arbitrage_opportunity" => Self::ArbitrageOpportunity,
            "trade_completed" => Self::TradeCompleted,
            "risk_threshold" => Self::RiskThreshold,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied to one payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    /// Field is present, whatever its value.
    Exists,
    /// String field matches the regular expression in `value`.
    Matches,
}

impl FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" | "==" => Ok(Self::Eq),
            "ne" | "!=" => Ok(Self::Ne),
            "gt" | ">" => Ok(Self::Gt),
            "gte" | ">=" => Ok(Self::Gte),
            "lt" | "<" => Ok(Self::Lt),
            "lte" | "<=" => Ok(Self::Lte),
            "exists" => Ok(Self::Exists),
            "matches" => Ok(Self::Matches),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

/// `payload[field] <operator> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl TriggerCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate against a payload. A missing field never matches, except
    /// for `exists` which only checks presence.
    pub fn evaluate(&self, payload: &Payload) -> bool {
        self.evaluate_with(payload, None)
    }

    /// Like [`evaluate`](Self::evaluate), reusing a precompiled pattern for
    /// `matches`.
    pub fn evaluate_with(&self, payload: &Payload, pattern: Option<&Regex>) -> bool {
        let Some(actual) = payload.get(&self.field) else {
            return false;
        };

        match self.operator {
            ConditionOperator::Exists => true,
            ConditionOperator::Eq => values_equal(actual, &self.value),
            ConditionOperator::Ne => !values_equal(actual, &self.value),
            ConditionOperator::Gt => as_number(actual) > as_number(&self.value),
            ConditionOperator::Gte => as_number(actual) >= as_number(&self.value),
            ConditionOperator::Lt => as_number(actual) < as_number(&self.value),
            ConditionOperator::Lte => as_number(actual) <= as_number(&self.value),
            ConditionOperator::Matches => {
                let Some(text) = actual.as_str() else {
                    return false;
                };
                match pattern {
                    Some(re) => re.is_match(text),
                    None => self.compile().is_some_and(|re| re.is_match(text)),
                }
            }
        }
    }

    /// Compile the pattern of a `matches` condition.
    pub fn compile(&self) -> Option<Regex> {
        self.value.as_str().and_then(|p| Regex::new(p).ok())
    }
}

/// Numbers compare by value (5 == 5.0); everything else structurally.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Numeric coercion: non-numbers (including numeric strings) become 0.
fn as_number(v: &Value) -> f64 {
    v.as_f64().unwrap_or(0.0)
}

/// Standing rule turning matching events into quests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestTrigger {
    pub id: Uuid,
    /// Definition instantiated on match.
    pub definition_id: String,
    /// Owner scope; `None` matches events from every owner.
    pub owner: Option<String>,
    pub event_type: EventType,
    pub condition: Option<TriggerCondition>,
    /// Zero disables the cooldown.
    pub cooldown: Duration,
    /// Zero means unlimited activations.
    pub max_triggers: u32,
    pub trigger_count: u32,
    pub last_trigger: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl QuestTrigger {
    pub fn new(definition_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            owner: None,
            event_type,
            condition: None,
            cooldown: Duration::ZERO,
            max_triggers: 0,
            trigger_count: 0,
            last_trigger: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_condition(mut self, condition: TriggerCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_triggers(mut self, max: u32) -> Self {
        self.max_triggers = max;
        self
    }

    /// Fires on `price_change_pct > threshold`, 5-minute cooldown.
    pub fn price_movement(definition_id: impl Into<String>, threshold_pct: f64) -> Self {
        Self::new(definition_id, EventType::PriceMovement)
            .with_condition(TriggerCondition::new(
                "price_change_pct",
                ConditionOperator::Gt,
                Value::from(threshold_pct),
            ))
            .with_cooldown(Duration::from_secs(5 * 60))
    }

    /// Fires on `profit_pct > min_profit_pct`, 1-minute cooldown.
    pub fn arbitrage(definition_id: impl Into<String>, min_profit_pct: f64) -> Self {
        Self::new(definition_id, EventType::ArbitrageOpportunity)
            .with_condition(TriggerCondition::new(
                "profit_pct",
                ConditionOperator::Gt,
                Value::from(min_profit_pct),
            ))
            .with_cooldown(Duration::from_secs(60))
    }

    /// Fires on every completed trade, 30-second cooldown.
    pub fn trade_completed(definition_id: impl Into<String>) -> Self {
        Self::new(definition_id, EventType::TradeCompleted).with_cooldown(Duration::from_secs(30))
    }

    /// Fires on `drawdown_pct > threshold`, 10-minute cooldown, at most 3 times.
    pub fn risk_threshold(definition_id: impl Into<String>, max_drawdown_pct: f64) -> Self {
        Self::new(definition_id, EventType::RiskThreshold)
            .with_condition(TriggerCondition::new(
                "drawdown_pct",
                ConditionOperator::Gt,
                Value::from(max_drawdown_pct),
            ))
            .with_cooldown(Duration::from_secs(10 * 60))
            .with_max_triggers(3)
    }

    /// Whether this trigger listens to the event's type and owner.
    pub fn listens_to(&self, event: &QuestEvent) -> bool {
        self.enabled
            && self.event_type == event.event_type
            && self.owner.as_deref().is_none_or(|o| o == event.chat_id)
    }

    /// Activation cap reached.
    pub fn is_exhausted(&self) -> bool {
        self.max_triggers > 0 && self.trigger_count >= self.max_triggers
    }

    /// Still inside the cooldown window at `now`.
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        if self.cooldown.is_zero() {
            return false;
        }
        let Some(last) = self.last_trigger else {
            return false;
        };
        match chrono::Duration::from_std(self.cooldown) {
            Ok(cooldown) => now - last < cooldown,
            Err(_) => true,
        }
    }

    /// Both guards pass.
    pub fn can_trigger(&self, now: DateTime<Utc>) -> bool {
        !self.is_exhausted() && !self.is_cooling_down(now)
    }
}

/// Something that happened in the market or the trading loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Owner the event belongs to; empty for global events.
    pub chat_id: String,
    #[serde(default)]
    pub payload: Payload,
}

impl QuestEvent {
    pub fn new(event_type: EventType, chat_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            chat_id: chat_id.into(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
