//! Fire-and-forget lifecycle event reporting.
//!
//! Analytics must never slow down or fail a sandbox operation: events are
//! posted from spawned tasks, failures are logged warnings, and an
//! unconfigured endpoint turns the client into a no-op.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Serialize;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A lifecycle event posted to the analytics collector.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// A sandbox VM was started and registered.
    InstanceStarted {
        /// The sandbox's id.
        sandbox_id: String,

        /// The template it restored from.
        template_id: String,

        /// The owning team, if any.
        team_id: Option<String>,

        /// The worker node's short id.
        client_id: String,

        /// When the event happened.
        timestamp: DateTime<Utc>,
    },

    /// The authoritative set of running instances after a sync.
    RunningInstances {
        /// The ids of all live sandboxes.
        sandbox_ids: Vec<String>,

        /// Convenience count of `sandbox_ids`.
        count: usize,

        /// When the event happened.
        timestamp: DateTime<Utc>,
    },
}

/// Client posting analytics events to a collector endpoint.
#[derive(Debug, Clone)]
pub struct AnalyticsClient {
    /// The collector endpoint; `None` disables all sends.
    endpoint: Option<String>,

    /// API key attached to every event.
    api_key: Option<String>,

    /// HTTP client with transient-failure retries.
    client: ClientWithMiddleware,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AnalyticsClient {
    /// Creates a client for `endpoint`. With `endpoint = None` every emit is
    /// a no-op.
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
            .build_with_max_retries(2);

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            endpoint,
            api_key,
            client,
        }
    }

    /// Creates a client that drops every event.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Posts `event` from a spawned task; never blocks the caller on I/O.
    pub fn emit(&self, event: AnalyticsEvent) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        let client = self.client.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let mut request = client.post(&endpoint).json(&event);
            if let Some(key) = &api_key {
                request = request.header("X-API-Key", key);
            }

            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        status = %response.status(),
                        "analytics collector rejected event"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to post analytics event");
                }
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AnalyticsEvent::InstanceStarted {
            sandbox_id: "sb-1".into(),
            template_id: "base".into(),
            team_id: None,
            client_id: "node-123".into(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "instance_started");
        assert_eq!(json["sandbox_id"], "sb-1");
    }

    #[tokio::test]
    async fn test_disabled_client_is_noop() {
        let client = AnalyticsClient::disabled();
        client.emit(AnalyticsEvent::RunningInstances {
            sandbox_ids: vec![],
            count: 0,
            timestamp: Utc::now(),
        });
    }
}
