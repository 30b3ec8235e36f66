//! Delivery of the run report to the operator.
//!
//! The orchestrator calls [`Notifier::deliver`] exactly once per run and
//! never retries it. A channel that needs at-least-once delivery has to
//! provide it itself, keyed on the run id sent with every report.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::config::NotifierConfig;
use crate::domain::report::Report;
use crate::error::DeliveryError;

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel the finished report is handed to.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one report. Called once per run.
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError>;
}

/// Posts the report as JSON to a webhook (e.g. a mail-topic publisher).
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotifierConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    /// Subject line as the operator sees it.
    pub fn subject(&self, report: &Report) -> String {
        format!("{} - {}", self.config.subject_prefix, report.subject())
    }

    fn payload(&self, report: &Report) -> serde_json::Value {
        json!({
            "subject": self.subject(report),
            "message": report.render_text(),
            "recipient": self.config.notify_email,
            "report": report,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[tracing::instrument(skip(self, report), fields(run_id = %report.run_id))]
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError> {
        if self.config.webhook_url.is_empty() {
            return Err(DeliveryError::Rejected(
                "no webhook URL configured".to_string(),
            ));
        }

        let response = self
            .client
            .post(&self.config.webhook_url)
            .header("Idempotency-Key", report.run_id.to_string())
            .json(&self.payload(report))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %self.config.webhook_url, error = %e, "Report delivery failed");
                DeliveryError::from(e)
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            tracing::error!(url = %self.config.webhook_url, status, "Report delivery rejected");
            return Err(DeliveryError::HttpStatus(status));
        }

        tracing::info!(entries = report.entries.len(), "Report delivered");
        Ok(())
    }
}

/// Notifier double that records every report.
#[derive(Clone, Default)]
pub struct MockNotifier {
    delivered: Arc<Mutex<Vec<Report>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following delivery fail with `DeliveryError::Rejected(reason)`.
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    /// Reports handed to the notifier, including ones it failed to deliver.
    pub fn delivered(&self) -> Vec<Report> {
        self.delivered.lock().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError> {
        self.delivered.lock().push(report.clone());
        match self.failure.lock().clone() {
            Some(reason) => Err(DeliveryError::Rejected(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError> {
        (**self).deliver(report).await
    }
}
