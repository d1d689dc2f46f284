//! Event delivery transport
//!
//! The flush coordinator hands batches of records to an [`EventTransport`]
//! and acts on the classified outcome; it owns no HTTP or JSON wire details
//! itself. [`HttpTransport`] is the production implementation against the
//! Trackwire ingestion API.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{EventRecord, ProjectSettings, PropertyMap};

/// Classified result of a delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Backend acknowledged the batch; records may be removed
    Delivered,
    /// Transient failure (network, timeout, 5xx); records stay queued
    Retryable(String),
    /// Semantic rejection (4xx); records must never be retried
    Rejected(String),
}

/// Capability that moves record batches over the wire.
pub trait EventTransport: Send + Sync + 'static {
    fn deliver(
        &self,
        project: &ProjectSettings,
        events: &[EventRecord],
    ) -> impl Future<Output = DeliveryOutcome> + Send;
}

/// Wire form of one event, as POSTed to the ingestion API
#[derive(Serialize)]
struct WireEvent<'a> {
    event_type: &'a str,
    timestamp: f64,
    customer_ids: &'a BTreeMap<String, String>,
    properties: &'a PropertyMap,
}

/// HTTP client for the Trackwire ingestion API
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the given request timeout
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    fn events_url(project: &ProjectSettings) -> String {
        format!(
            "{}/track/v2/projects/{}/customers/events",
            project.base_url.trim_end_matches('/'),
            project.project_token
        )
    }
}

impl EventTransport for HttpTransport {
    fn deliver(
        &self,
        project: &ProjectSettings,
        events: &[EventRecord],
    ) -> impl Future<Output = DeliveryOutcome> + Send {
        let url = Self::events_url(project);
        let body: Vec<WireEvent> = events
            .iter()
            .map(|e| WireEvent {
                event_type: &e.event_type,
                timestamp: e.timestamp,
                customer_ids: &e.customer_ids,
                properties: &e.properties,
            })
            .collect();

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(auth) = &project.authorization {
            request = request.header(AUTHORIZATION, auth);
        }

        async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return DeliveryOutcome::Retryable(format!("HTTP request failed: {}", e)),
            };

            let status = response.status();
            if status.is_success() {
                DeliveryOutcome::Delivered
            } else {
                let body = response.text().await.unwrap_or_else(|_| "unknown".to_string());
                let reason = format!("API error ({}): {}", status, body);
                if status.is_server_error() {
                    DeliveryOutcome::Retryable(reason)
                } else {
                    DeliveryOutcome::Rejected(reason)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventCategory;
    use chrono::Utc;

    #[test]
    fn test_events_url() {
        let project = ProjectSettings::new("https://api.example.com/", "token-1", None);
        assert_eq!(
            HttpTransport::events_url(&project),
            "https://api.example.com/track/v2/projects/token-1/customers/events"
        );
    }

    #[test]
    fn test_wire_event_shape() {
        let mut customer_ids = BTreeMap::new();
        customer_ids.insert("cookie".to_string(), "c-1".to_string());
        let record = EventRecord {
            seq: 1,
            category: EventCategory::TrackEvent,
            event_type: "checkout".to_string(),
            timestamp: 1000.5,
            customer_ids,
            properties: PropertyMap::new(),
            project: ProjectSettings::new("https://api.example.com", "token-1", None),
            tries: 0,
            created_at: Utc::now(),
        };

        let wire = WireEvent {
            event_type: &record.event_type,
            timestamp: record.timestamp,
            customer_ids: &record.customer_ids,
            properties: &record.properties,
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["event_type"], "checkout");
        assert_eq!(json["timestamp"], 1000.5);
        assert_eq!(json["customer_ids"]["cookie"], "c-1");
    }
}
