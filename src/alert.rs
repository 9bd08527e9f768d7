//! Alert Channel
//!
//! Best-effort delivery of high-severity events and anchoring/verification
//! failures. Delivery errors are logged and never reach the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::audit::event::Severity;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, summary: impl Into<String>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: Alert);
}

/// Deliver an alert without holding up the caller
pub fn dispatch(sink: &Arc<dyn AlertSink>, alert: Alert) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        sink.send(alert).await;
    });
}

/// Writes alerts to the tracing log
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: Alert) {
        match alert.severity {
            Severity::Critical | Severity::High => {
                error!(severity = %alert.severity, "ALERT: {}", alert.summary)
            }
            Severity::Medium => warn!(severity = %alert.severity, "ALERT: {}", alert.summary),
            Severity::Low => info!(severity = %alert.severity, "ALERT: {}", alert.summary),
        }
    }
}

/// POSTs alerts as JSON to a webhook, falling back to the log on failure
pub struct WebhookAlertSink {
    url: String,
    min_severity: Severity,
    http_client: Client,
}

impl WebhookAlertSink {
    pub fn new(url: String, min_severity: Severity, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url,
            min_severity,
            http_client,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: Alert) {
        TracingAlertSink.send(alert.clone()).await;
        if alert.severity < self.min_severity {
            return;
        }

        match self.http_client.post(&self.url).json(&alert).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                "Alert webhook {} answered {}",
                self.url,
                response.status()
            ),
            Err(e) => warn!("Failed to deliver alert to {}: {}", self.url, e),
        }
    }
}

/// Keeps alerts in memory; useful for embedding and tests
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn send(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
