//! In-app message eligibility
//!
//! Decides which fetched in-app message definition, if any, should be shown
//! in response to a tracked event. The engine is a pure predicate over the
//! message definition, the per-message display state, the incoming event,
//! and the current session; it renders nothing and performs no I/O.
//! Presenters record displayed/interacted timestamps back through the
//! [`DisplayStateStore`].
//!
//! Definitions arrive as backend JSON. Unknown frequency or message-type
//! strings must never make a device drop the whole message list, so both
//! parse with a logged warning and a safe default.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

use crate::types::{PropertyMap, PropertyValue, TrackedEvent};

// ============================================
// Message definitions
// ============================================

/// How often one message may be shown to one customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAppMessageFrequency {
    /// No limit
    Always,
    /// At most once, ever
    OnlyOnce,
    /// At most once per session
    OncePerVisit,
    /// Until the customer interacts with it
    UntilVisitorInteracts,
}

impl InAppMessageFrequency {
    /// Parse the backend string; unknown values fail open to `Always`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "always" => InAppMessageFrequency::Always,
            "only_once" => InAppMessageFrequency::OnlyOnce,
            "once_per_visit" => InAppMessageFrequency::OncePerVisit,
            "until_visitor_interacts" => InAppMessageFrequency::UntilVisitorInteracts,
            other => {
                tracing::warn!(frequency = other, "Unknown message frequency, assuming always");
                InAppMessageFrequency::Always
            }
        }
    }
}

/// Display variant of a message. The payload knows how to render itself;
/// this only drives presenter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAppMessageType {
    Modal,
    Alert,
    Fullscreen,
    SlideIn,
    Freeform,
}

impl InAppMessageType {
    /// Parse the backend string; unknown values fail open to `Modal`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "modal" => InAppMessageType::Modal,
            "alert" => InAppMessageType::Alert,
            "fullscreen" => InAppMessageType::Fullscreen,
            "slide_in" => InAppMessageType::SlideIn,
            "freeform" => InAppMessageType::Freeform,
            other => {
                tracing::warn!(message_type = other, "Unknown message type, assuming modal");
                InAppMessageType::Modal
            }
        }
    }
}

/// A message definition as fetched from the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct InAppMessage {
    pub id: String,
    pub name: String,
    /// Raw display-variant string; see [`InAppMessage::message_type`]
    #[serde(rename = "message_type")]
    pub raw_message_type: String,
    /// Raw frequency string; see [`InAppMessage::frequency`]
    #[serde(rename = "frequency")]
    pub raw_frequency: String,
    /// Opaque rendering payload, passed through to the presenter
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub variant_id: i64,
    #[serde(default)]
    pub variant_name: String,
    /// Higher wins when several messages are eligible
    #[serde(default)]
    pub priority: Option<i64>,
    pub trigger: MessageTrigger,
    pub date_filter: DateFilter,
}

impl InAppMessage {
    pub fn frequency(&self) -> InAppMessageFrequency {
        InAppMessageFrequency::parse(&self.raw_frequency)
    }

    pub fn message_type(&self) -> InAppMessageType {
        InAppMessageType::parse(&self.raw_message_type)
    }
}

/// What kind of event a message reacts to.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageTrigger {
    /// Trigger kind; only "event" triggers are actionable
    #[serde(rename = "type", default = "default_trigger_type")]
    pub trigger_type: String,
    /// Event type label the trigger matches
    #[serde(default)]
    pub event_type: Option<String>,
    /// Additional property conditions, all of which must hold
    #[serde(default)]
    pub conditions: Vec<PropertyCondition>,
}

fn default_trigger_type() -> String {
    "event".to_string()
}

impl MessageTrigger {
    /// Whether the trigger fires for this event.
    pub fn matches(&self, event: &TrackedEvent) -> bool {
        if self.trigger_type != "event" {
            return false;
        }
        match &self.event_type {
            Some(event_type) if *event_type == event.event_type => self
                .conditions
                .iter()
                .all(|condition| condition.matches(&event.properties)),
            _ => false,
        }
    }
}

/// Scheduling window for a message.
#[derive(Debug, Clone, Deserialize)]
pub struct DateFilter {
    pub enabled: bool,
    /// Epoch seconds; absent means unbounded
    #[serde(default)]
    pub from_date: Option<f64>,
    #[serde(default)]
    pub to_date: Option<f64>,
}

impl DateFilter {
    pub fn allows(&self, now: f64) -> bool {
        if !self.enabled {
            return true;
        }
        if let Some(from) = self.from_date {
            if now < from {
                return false;
            }
        }
        if let Some(to) = self.to_date {
            if now > to {
                return false;
            }
        }
        true
    }
}

/// One property constraint inside a trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyCondition {
    pub property: String,
    pub operator: ConditionOperator,
    /// Comparison operand; `is_set` needs none
    #[serde(default)]
    pub operand: Option<PropertyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    IsSet,
    GreaterThan,
    LessThan,
}

impl PropertyCondition {
    pub fn matches(&self, properties: &PropertyMap) -> bool {
        let value = properties.get(&self.property);
        match self.operator {
            ConditionOperator::IsSet => value.is_some(),
            ConditionOperator::Equals => match (value, &self.operand) {
                (Some(value), Some(operand)) => property_eq(value, operand),
                _ => false,
            },
            ConditionOperator::NotEquals => match (value, &self.operand) {
                (Some(value), Some(operand)) => !property_eq(value, operand),
                _ => false,
            },
            ConditionOperator::Contains => match (value, &self.operand) {
                (Some(value), Some(operand)) => value
                    .as_str()
                    .zip(operand.as_str())
                    .map(|(v, o)| v.contains(o))
                    .unwrap_or(false),
                _ => false,
            },
            ConditionOperator::GreaterThan => numeric_cmp(value, &self.operand)
                .map(|(v, o)| v > o)
                .unwrap_or(false),
            ConditionOperator::LessThan => numeric_cmp(value, &self.operand)
                .map(|(v, o)| v < o)
                .unwrap_or(false),
        }
    }
}

/// Integers and floats compare numerically; everything else structurally.
fn property_eq(a: &PropertyValue, b: &PropertyValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_cmp(value: Option<&PropertyValue>, operand: &Option<PropertyValue>) -> Option<(f64, f64)> {
    Some((value?.as_f64()?, operand.as_ref()?.as_f64()?))
}

// ============================================
// Display state
// ============================================

/// Per-message display history for the current customer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DisplayState {
    /// When the message was last shown
    pub displayed_at: Option<f64>,
    /// When the customer last interacted with it
    pub interacted_at: Option<f64>,
}

/// In-memory display history, keyed by message id. Presenters write through
/// it; the eligibility engine only reads.
#[derive(Default)]
pub struct DisplayStateStore {
    states: Mutex<HashMap<String, DisplayState>>,
}

impl DisplayStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, message_id: &str) -> DisplayState {
        self.states
            .lock()
            .unwrap()
            .get(message_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn record_displayed(&self, message_id: &str, ts: f64) {
        self.states
            .lock()
            .unwrap()
            .entry(message_id.to_string())
            .or_default()
            .displayed_at = Some(ts);
    }

    pub fn record_interacted(&self, message_id: &str, ts: f64) {
        self.states
            .lock()
            .unwrap()
            .entry(message_id.to_string())
            .or_default()
            .interacted_at = Some(ts);
    }

    /// Forget all history. A fresh identity starts with a clean display
    /// slate, so hosts owning an engine call this when they anonymize the
    /// customer.
    pub fn clear(&self) {
        self.states.lock().unwrap().clear();
    }
}

// ============================================
// Eligibility engine
// ============================================

/// Decides which messages may be shown for an incoming event.
#[derive(Default)]
pub struct InAppMessageEligibilityEngine {
    display_state: DisplayStateStore,
}

impl InAppMessageEligibilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The display history presenters write through.
    pub fn display_state(&self) -> &DisplayStateStore {
        &self.display_state
    }

    /// Whether one message may be shown for this event right now.
    ///
    /// `session_start_ts` is the start of the active session, if any; it
    /// anchors the `OncePerVisit` rule.
    pub fn eligible(
        &self,
        message: &InAppMessage,
        event: &TrackedEvent,
        session_start_ts: Option<f64>,
        now: f64,
    ) -> bool {
        if !message.date_filter.allows(now) {
            return false;
        }
        if !message.trigger.matches(event) {
            return false;
        }
        let state = self.display_state.state(&message.id);
        match message.frequency() {
            InAppMessageFrequency::Always => true,
            InAppMessageFrequency::OnlyOnce => state.displayed_at.is_none(),
            InAppMessageFrequency::OncePerVisit => match (state.displayed_at, session_start_ts) {
                (None, _) => true,
                (Some(displayed_at), Some(session_start)) => displayed_at < session_start,
                (Some(_), None) => false,
            },
            InAppMessageFrequency::UntilVisitorInteracts => state.interacted_at.is_none(),
        }
    }

    /// The single message to show for this event: the highest-priority
    /// eligible one, ties broken by id so the choice is deterministic.
    pub fn pick<'a>(
        &self,
        messages: &'a [InAppMessage],
        event: &TrackedEvent,
        session_start_ts: Option<f64>,
        now: f64,
    ) -> Option<&'a InAppMessage> {
        let mut best: Option<&InAppMessage> = None;
        for message in messages {
            if !self.eligible(message, event, session_start_ts, now) {
                continue;
            }
            let priority = message.priority.unwrap_or(0);
            best = match best {
                None => Some(message),
                Some(current) => {
                    let current_priority = current.priority.unwrap_or(0);
                    if priority > current_priority
                        || (priority == current_priority && message.id < current.id)
                    {
                        Some(message)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }
}
