//! Error types for the orchestration engine.
//!
//! Three layers of failure are kept apart:
//! - [`QueryError`] is what a single backend call can return. It is contained
//!   by the request tracker that issued the call.
//! - [`DeliveryError`] is what the notification channel can return.
//! - [`OrchestratorError`] is what ends a run without a delivered report.

use thiserror::Error;

use crate::domain::request::RequestId;

/// Result type alias using the orchestrator error type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Run-level error type.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Request is in an invalid state for the requested operation
    #[error("Invalid state: request {0} is in state '{1}', expected '{2}'")]
    InvalidState(RequestId, String, String),

    /// Configuration or input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A new account never produced an account id
    #[error("Account id unavailable: {0}")]
    AccountUnavailable(String),

    /// The report could not be handed to the notification channel
    #[error("Report delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// A backend call failed outside of a request tracker
    #[error("Query backend error: {0}")]
    Query(#[from] QueryError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of one call to the quota/query backend.
///
/// The client never retries; whoever owns the call decides what a transient
/// failure means for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Network failure, timeout or throttling. Worth trying again later.
    #[error("Transient query failure: {0}")]
    Transient(String),

    /// Malformed payload, denied authorization, missing resource. Retrying
    /// will not help.
    #[error("Permanent query failure: {0}")]
    Permanent(String),
}

impl QueryError {
    /// Returns true if waiting and trying again may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_))
    }

    /// Classify a backend status code.
    ///
    /// 408, 429 and 5xx are transient; every other non-success code is
    /// permanent.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status >= 500 || status == 429 || status == 408 {
            QueryError::Transient(format!("backend returned status {}: {}", status, body))
        } else {
            QueryError::Permanent(format!("backend returned status {}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return QueryError::from_status(status.as_u16(), e.to_string());
        }
        if e.is_timeout() || e.is_connect() || e.is_request() {
            QueryError::Transient(e.to_string())
        } else {
            // Builder and decode errors: the call itself is wrong
            QueryError::Permanent(e.to_string())
        }
    }
}

/// Failure to hand a report to the notification channel.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The channel answered with a non-2xx status code.
    #[error("Notification channel returned HTTP {0}")]
    HttpStatus(u16),

    /// The channel refused the report for another reason.
    #[error("Notification channel rejected the report: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(QueryError::from_status(500, "").is_transient());
        assert!(QueryError::from_status(503, "").is_transient());
        assert!(QueryError::from_status(429, "").is_transient());
        assert!(QueryError::from_status(408, "").is_transient());
        assert!(!QueryError::from_status(400, "").is_transient());
        assert!(!QueryError::from_status(403, "").is_transient());
        assert!(!QueryError::from_status(404, "").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = DeliveryError::HttpStatus(502);
        assert_eq!(err.to_string(), "Notification channel returned HTTP 502");

        let err = OrchestratorError::from(DeliveryError::Rejected("topic gone".to_string()));
        assert_eq!(
            err.to_string(),
            "Report delivery failed: Notification channel rejected the report: topic gone"
        );
    }
}
