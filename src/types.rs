//! Core domain types for trackwire
//!
//! These types form the canonical data model shared by the track pipeline,
//! the durable event queue, and the flush coordinator.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Cookie** | The stable anonymous identifier assigned to a customer identity |
//! | **Project** | A backend tenant destination identified by base URL + token |
//! | **Event record** | One queued row per (logical event × destination project) |
//! | **Flush** | Delivering queued event records to the backend |
//! | **Anonymize** | Discarding the current identity and starting a fresh one |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as floating-point epoch seconds.
///
/// Event timestamps use this unit throughout the pipeline.
pub fn current_time_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================
// Property values
// ============================================

/// A scalar value inside an event property bag.
///
/// Property bags are heterogeneous; every value is one of these variants and
/// serializes to its plain JSON form at the transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Null,
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

/// Ordered, string-keyed property bag attached to every event.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

// ============================================
// Event categories
// ============================================

/// Category of a tracked event.
///
/// The category selects the destination project route and, for internally
/// produced events, the default event type label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Install,
    SessionStart,
    SessionEnd,
    PushToken,
    PushDelivered,
    PushOpened,
    Payment,
    TrackEvent,
    CampaignClick,
    TrackCustomer,
}

impl EventCategory {
    /// Identifier used in database storage and routing config
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Install => "install",
            EventCategory::SessionStart => "session_start",
            EventCategory::SessionEnd => "session_end",
            EventCategory::PushToken => "push_token",
            EventCategory::PushDelivered => "push_delivered",
            EventCategory::PushOpened => "push_opened",
            EventCategory::Payment => "payment",
            EventCategory::TrackEvent => "track_event",
            EventCategory::CampaignClick => "campaign_click",
            EventCategory::TrackCustomer => "track_customer",
        }
    }

    /// Default wire label for events of this category.
    ///
    /// `TrackEvent` carries a caller-supplied label instead; `TrackCustomer`
    /// is an identity update and has no label of its own.
    pub fn default_event_type(&self) -> Option<&'static str> {
        match self {
            EventCategory::Install => Some("installation"),
            EventCategory::SessionStart => Some("session_start"),
            EventCategory::SessionEnd => Some("session_end"),
            EventCategory::Payment => Some("payment"),
            EventCategory::PushToken
            | EventCategory::PushDelivered
            | EventCategory::PushOpened
            | EventCategory::CampaignClick => Some("campaign"),
            EventCategory::TrackEvent | EventCategory::TrackCustomer => None,
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(EventCategory::Install),
            "session_start" => Ok(EventCategory::SessionStart),
            "session_end" => Ok(EventCategory::SessionEnd),
            "push_token" => Ok(EventCategory::PushToken),
            "push_delivered" => Ok(EventCategory::PushDelivered),
            "push_opened" => Ok(EventCategory::PushOpened),
            "payment" => Ok(EventCategory::Payment),
            "track_event" => Ok(EventCategory::TrackEvent),
            "campaign_click" => Ok(EventCategory::CampaignClick),
            "track_customer" => Ok(EventCategory::TrackCustomer),
            _ => Err(format!("unknown event category: {}", s)),
        }
    }
}

// ============================================
// Projects
// ============================================

/// A backend tenant destination.
///
/// Events may route to one or more projects; each queued record carries the
/// full destination so a later project switch never redirects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Base URL of the ingestion API
    pub base_url: String,
    /// Project token identifying the tenant
    pub project_token: String,
    /// Authorization header value (`Token <key>`), if the project requires one
    #[serde(default)]
    pub authorization: Option<String>,
}

impl ProjectSettings {
    pub fn new(
        base_url: impl Into<String>,
        project_token: impl Into<String>,
        authorization: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            project_token: project_token.into(),
            authorization,
        }
    }
}

// ============================================
// Customer identity
// ============================================

/// A customer identity: a stable anonymous cookie plus registered ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerIdentity {
    /// Stable anonymous identifier, generated once per identity
    pub cookie: String,
    /// Registered external identifiers (e.g. login-based ids)
    pub registered: BTreeMap<String, String>,
}

impl CustomerIdentity {
    /// Snapshot of all identifiers as a flat map, as stamped onto records.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.registered.clone();
        map.insert("cookie".to_string(), self.cookie.clone());
        map
    }
}

// ============================================
// Event records
// ============================================

/// A durable event record, one per (logical event × destination project).
///
/// The identity snapshot is captured at enqueue time and never mutated
/// afterward, even if the active identity later changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Creation sequence number, also the record id.
    /// Unique and monotonically increasing across the queue.
    pub seq: i64,
    /// Category of the event
    pub category: EventCategory,
    /// Wire label of the event
    pub event_type: String,
    /// Event timestamp in epoch seconds
    pub timestamp: f64,
    /// Identity snapshot at enqueue time
    pub customer_ids: BTreeMap<String, String>,
    /// Property bag
    pub properties: PropertyMap,
    /// Destination project
    pub project: ProjectSettings,
    /// Delivery attempts made so far
    pub tries: i32,
    /// When the record was enqueued
    pub created_at: DateTime<Utc>,
}

/// A record about to be enqueued; the store assigns its sequence number.
#[derive(Debug, Clone)]
pub struct NewEventRecord {
    pub category: EventCategory,
    pub event_type: String,
    pub timestamp: f64,
    pub customer_ids: BTreeMap<String, String>,
    pub properties: PropertyMap,
    pub project: ProjectSettings,
}

/// Logical event as seen by read-only pipeline observers
/// (the in-app eligibility engine consumes these).
#[derive(Debug, Clone)]
pub struct TrackedEvent {
    pub event_type: String,
    pub properties: PropertyMap,
    pub timestamp: f64,
}

// ============================================
// Flush mode
// ============================================

/// When queued events are pushed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush only on explicit request
    Manual,
    /// Flush after every enqueue
    Immediate,
    /// Flush on a recurring timer (delegated to the platform scheduler)
    Period,
    /// Flush deferred until the app is backgrounded
    AppClose,
}

impl FlushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushMode::Manual => "manual",
            FlushMode::Immediate => "immediate",
            FlushMode::Period => "period",
            FlushMode::AppClose => "app_close",
        }
    }
}

impl std::fmt::Display for FlushMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FlushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(FlushMode::Manual),
            "immediate" => Ok(FlushMode::Immediate),
            "period" => Ok(FlushMode::Period),
            "app_close" => Ok(FlushMode::AppClose),
            _ => Err(format!("unknown flush mode: {}", s)),
        }
    }
}

// ============================================
// Campaign attribution
// ============================================

/// First-touch campaign click record.
///
/// Belongs to the identity that produced it; cleared on anonymize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignClick {
    /// Complete click-through URL
    pub url: String,
    /// When the click happened, epoch seconds
    pub created_at: f64,
}

impl CampaignClick {
    /// Whether the click is still within its time-to-live at `now`.
    pub fn is_fresh(&self, ttl_secs: f64, now: f64) -> bool {
        now - self.created_at <= ttl_secs
    }
}

// ============================================
// Payments
// ============================================

/// A completed in-app purchase, as reported by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasedItem {
    /// Gross price paid
    pub value: f64,
    /// ISO 4217 currency code
    pub currency: String,
    /// Store or processor the purchase went through
    pub payment_system: String,
    /// Product identifier in the store
    pub item_id: String,
    /// Human-readable product name
    pub product_title: String,
}

impl PurchasedItem {
    /// Flatten into the property bag of a payment event.
    pub fn to_properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("value".into(), PropertyValue::Number(self.value));
        props.insert("currency".into(), self.currency.as_str().into());
        props.insert("payment_system".into(), self.payment_system.as_str().into());
        props.insert("item_id".into(), self.item_id.as_str().into());
        props.insert("product_title".into(), self.product_title.as_str().into());
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value_json_forms() {
        let mut props = PropertyMap::new();
        props.insert("name".into(), "checkout".into());
        props.insert("total".into(), PropertyValue::Number(12.5));
        props.insert("count".into(), PropertyValue::Integer(3));
        props.insert("first".into(), PropertyValue::Boolean(true));
        props.insert("coupon".into(), PropertyValue::Null);

        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(
            json,
            r#"{"count":3,"coupon":null,"first":true,"name":"checkout","total":12.5}"#
        );
    }

    #[test]
    fn test_event_category_round_trip() {
        for category in [
            EventCategory::Install,
            EventCategory::SessionStart,
            EventCategory::SessionEnd,
            EventCategory::PushToken,
            EventCategory::PushDelivered,
            EventCategory::PushOpened,
            EventCategory::Payment,
            EventCategory::TrackEvent,
            EventCategory::CampaignClick,
            EventCategory::TrackCustomer,
        ] {
            assert_eq!(category.as_str().parse::<EventCategory>(), Ok(category));
        }
        assert!("banner".parse::<EventCategory>().is_err());
    }

    #[test]
    fn test_identity_snapshot_includes_cookie() {
        let mut registered = BTreeMap::new();
        registered.insert("email".to_string(), "a@example.com".to_string());
        let identity = CustomerIdentity {
            cookie: "c-1".to_string(),
            registered,
        };
        let map = identity.to_map();
        assert_eq!(map.get("cookie"), Some(&"c-1".to_string()));
        assert_eq!(map.get("email"), Some(&"a@example.com".to_string()));
    }

    #[test]
    fn test_campaign_click_freshness() {
        let click = CampaignClick {
            url: "https://example.com/?utm_campaign=x".to_string(),
            created_at: 100.0,
        };
        assert!(click.is_fresh(10.0, 105.0));
        assert!(!click.is_fresh(10.0, 111.0));
    }
}
