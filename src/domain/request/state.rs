//! Quota request states using the typestate pattern.
//!
//! Each quota-increase request progresses through distinct states, enforced at
//! compile time. Only `Submitted` and `Pending` have transition methods, so a
//! request that reached a terminal state cannot be moved again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flat status of a request, used for reports, logs and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaRequestStatus {
    Submitted,
    Pending,
    Approved,
    Denied,
    TimedOut,
    Failed,
}

impl QuotaRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaRequestStatus::Submitted => "SUBMITTED",
            QuotaRequestStatus::Pending => "PENDING",
            QuotaRequestStatus::Approved => "APPROVED",
            QuotaRequestStatus::Denied => "DENIED",
            QuotaRequestStatus::TimedOut => "TIMED_OUT",
            QuotaRequestStatus::Failed => "FAILED",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            QuotaRequestStatus::Submitted | QuotaRequestStatus::Pending
        )
    }
}

impl std::fmt::Display for QuotaRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuotaRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(QuotaRequestStatus::Submitted),
            "PENDING" => Ok(QuotaRequestStatus::Pending),
            "APPROVED" => Ok(QuotaRequestStatus::Approved),
            "DENIED" => Ok(QuotaRequestStatus::Denied),
            "TIMED_OUT" => Ok(QuotaRequestStatus::TimedOut),
            "FAILED" => Ok(QuotaRequestStatus::Failed),
            _ => Err(format!("Invalid quota request status: {}", s)),
        }
    }
}

/// Marker trait for valid quota request states.
pub trait QuotaRequestState: Send + Sync {}

/// A quota-increase request tracked by the orchestrator.
///
/// The generic parameter `T` represents the current state of the request.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaRequest<T: QuotaRequestState> {
    /// The current state of the request.
    pub state: T,
    /// What is being requested, for whom.
    pub data: QuotaRequestData,
}

/// Immutable description of one quota-increase request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaRequestData {
    /// Unique within a run.
    pub id: RequestId,

    /// Service the quota belongs to (e.g. "ec2").
    pub service_identifier: String,

    /// The quota being raised (e.g. "L-1216C47A").
    pub quota_dimension: String,

    /// Member account the request is raised for.
    pub account_id: String,

    /// Value to request, passed through to the backend untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_value: Option<f64>,
}

/// Opaque handle the backend returns when it acknowledges a submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(pub String);

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestToken {
    fn from(s: &str) -> Self {
        RequestToken(s.to_string())
    }
}

// ============================================================================
// Request States
// ============================================================================

/// Request created; the submission call has not been acknowledged yet.
#[derive(Debug, Clone, Serialize)]
pub struct Submitted {
    pub created_at: DateTime<Utc>,
    /// Number of submission calls issued so far
    pub submit_attempts: u32,
}

impl QuotaRequestState for Submitted {}

/// Submission acknowledged; waiting for the backend's decision.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {
    pub token: RequestToken,
    pub submitted_at: DateTime<Utc>,
    /// Number of status checks issued so far
    pub attempts: u32,
    /// Time of the latest status check, or of the acknowledgement before the first one
    pub last_checked_at: DateTime<Utc>,
}

impl QuotaRequestState for Pending {}

/// Outcome recorded once, on the transition into a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaRequestResult {
    pub detail: String,
    pub finished_at: DateTime<Utc>,
}

/// The backend granted the increase.
#[derive(Debug, Clone, Serialize)]
pub struct Approved {
    pub token: RequestToken,
    pub attempts: u32,
    pub last_checked_at: DateTime<Utc>,
    pub result: QuotaRequestResult,
}

impl QuotaRequestState for Approved {}

/// The backend refused the increase.
#[derive(Debug, Clone, Serialize)]
pub struct Denied {
    pub token: RequestToken,
    pub attempts: u32,
    pub last_checked_at: DateTime<Utc>,
    pub result: QuotaRequestResult,
}

impl QuotaRequestState for Denied {}

/// The run deadline passed before the backend decided.
#[derive(Debug, Clone, Serialize)]
pub struct TimedOut {
    /// None if the request never got past submission
    pub token: Option<RequestToken>,
    pub attempts: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub result: QuotaRequestResult,
}

impl QuotaRequestState for TimedOut {}

/// Reason why a request failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// The backend refused the submission outright.
    SubmissionRejected { error: String },

    /// Every submission attempt ended in a transient error.
    SubmissionExhausted { attempts: u32, error: String },

    /// A status check returned a permanent error.
    StatusCheckRejected { error: String },

    /// The task tracking the request terminated unexpectedly (panic).
    TrackerTerminated,
}

impl FailureReason {
    /// Returns a human-readable error message for this failure reason.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::SubmissionRejected { error } => {
                format!("Submission rejected: {}", error)
            }
            FailureReason::SubmissionExhausted { attempts, error } => {
                format!(
                    "Submission failed after {} attempts: {}",
                    attempts, error
                )
            }
            FailureReason::StatusCheckRejected { error } => {
                format!("Status check rejected: {}", error)
            }
            FailureReason::TrackerTerminated => "Request tracker terminated unexpectedly".to_string(),
        }
    }
}

/// The request could not be carried to a decision.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub reason: FailureReason,
    /// None if the request never got past submission
    pub token: Option<RequestToken>,
    pub attempts: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub result: QuotaRequestResult,
}

impl QuotaRequestState for Failed {}

/// Unique identifier for a quota request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Transition Outcomes
// ============================================================================

/// Result of issuing the submission call.
#[derive(Debug)]
pub enum SubmissionResult {
    /// The backend acknowledged the request and returned a token.
    Acknowledged(QuotaRequest<Pending>),
    /// The backend refused it permanently.
    Rejected(QuotaRequest<Failed>),
    /// The call failed transiently; the request is unchanged apart from its attempt count.
    Retry(QuotaRequest<Submitted>, crate::error::QueryError),
}

/// Result of one status check.
#[derive(Debug)]
pub enum PollOutcome {
    /// Still waiting (in progress, or a transient failure was swallowed).
    InProgress(QuotaRequest<Pending>),
    Approved(QuotaRequest<Approved>),
    Denied(QuotaRequest<Denied>),
    Failed(QuotaRequest<Failed>),
}

impl From<PollOutcome> for AnyQuotaRequest {
    fn from(outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::InProgress(r) => r.into(),
            PollOutcome::Approved(r) => r.into(),
            PollOutcome::Denied(r) => r.into(),
            PollOutcome::Failed(r) => r.into(),
        }
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a quota request in any state.
///
/// Used wherever a batch is handled uniformly, e.g. by the poller and the
/// report aggregator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "request")]
pub enum AnyQuotaRequest {
    Submitted(QuotaRequest<Submitted>),
    Pending(QuotaRequest<Pending>),
    Approved(QuotaRequest<Approved>),
    Denied(QuotaRequest<Denied>),
    TimedOut(QuotaRequest<TimedOut>),
    Failed(QuotaRequest<Failed>),
}

impl AnyQuotaRequest {
    /// Get the request ID regardless of state.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Get the request data regardless of state.
    pub fn data(&self) -> &QuotaRequestData {
        match self {
            AnyQuotaRequest::Submitted(r) => &r.data,
            AnyQuotaRequest::Pending(r) => &r.data,
            AnyQuotaRequest::Approved(r) => &r.data,
            AnyQuotaRequest::Denied(r) => &r.data,
            AnyQuotaRequest::TimedOut(r) => &r.data,
            AnyQuotaRequest::Failed(r) => &r.data,
        }
    }

    pub fn status(&self) -> QuotaRequestStatus {
        match self {
            AnyQuotaRequest::Submitted(_) => QuotaRequestStatus::Submitted,
            AnyQuotaRequest::Pending(_) => QuotaRequestStatus::Pending,
            AnyQuotaRequest::Approved(_) => QuotaRequestStatus::Approved,
            AnyQuotaRequest::Denied(_) => QuotaRequestStatus::Denied,
            AnyQuotaRequest::TimedOut(_) => QuotaRequestStatus::TimedOut,
            AnyQuotaRequest::Failed(_) => QuotaRequestStatus::Failed,
        }
    }

    /// Check if this request is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Number of status checks issued for this request.
    pub fn attempts(&self) -> u32 {
        match self {
            AnyQuotaRequest::Submitted(_) => 0,
            AnyQuotaRequest::Pending(r) => r.state.attempts,
            AnyQuotaRequest::Approved(r) => r.state.attempts,
            AnyQuotaRequest::Denied(r) => r.state.attempts,
            AnyQuotaRequest::TimedOut(r) => r.state.attempts,
            AnyQuotaRequest::Failed(r) => r.state.attempts,
        }
    }

    /// The recorded outcome; `None` until the request is terminal.
    pub fn result(&self) -> Option<&QuotaRequestResult> {
        match self {
            AnyQuotaRequest::Submitted(_) | AnyQuotaRequest::Pending(_) => None,
            AnyQuotaRequest::Approved(r) => Some(&r.state.result),
            AnyQuotaRequest::Denied(r) => Some(&r.state.result),
            AnyQuotaRequest::TimedOut(r) => Some(&r.state.result),
            AnyQuotaRequest::Failed(r) => Some(&r.state.result),
        }
    }

    /// The backend token, once the submission was acknowledged.
    pub fn token(&self) -> Option<&RequestToken> {
        match self {
            AnyQuotaRequest::Submitted(_) => None,
            AnyQuotaRequest::Pending(r) => Some(&r.state.token),
            AnyQuotaRequest::Approved(r) => Some(&r.state.token),
            AnyQuotaRequest::Denied(r) => Some(&r.state.token),
            AnyQuotaRequest::TimedOut(r) => r.state.token.as_ref(),
            AnyQuotaRequest::Failed(r) => r.state.token.as_ref(),
        }
    }
}

// Conversion traits for going from typed QuotaRequest to AnyQuotaRequest

impl From<QuotaRequest<Submitted>> for AnyQuotaRequest {
    fn from(r: QuotaRequest<Submitted>) -> Self {
        AnyQuotaRequest::Submitted(r)
    }
}

impl From<QuotaRequest<Pending>> for AnyQuotaRequest {
    fn from(r: QuotaRequest<Pending>) -> Self {
        AnyQuotaRequest::Pending(r)
    }
}

impl From<QuotaRequest<Approved>> for AnyQuotaRequest {
    fn from(r: QuotaRequest<Approved>) -> Self {
        AnyQuotaRequest::Approved(r)
    }
}

impl From<QuotaRequest<Denied>> for AnyQuotaRequest {
    fn from(r: QuotaRequest<Denied>) -> Self {
        AnyQuotaRequest::Denied(r)
    }
}

impl From<QuotaRequest<TimedOut>> for AnyQuotaRequest {
    fn from(r: QuotaRequest<TimedOut>) -> Self {
        AnyQuotaRequest::TimedOut(r)
    }
}

impl From<QuotaRequest<Failed>> for AnyQuotaRequest {
    fn from(r: QuotaRequest<Failed>) -> Self {
        AnyQuotaRequest::Failed(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            QuotaRequestStatus::Submitted,
            QuotaRequestStatus::Pending,
            QuotaRequestStatus::Approved,
            QuotaRequestStatus::Denied,
            QuotaRequestStatus::TimedOut,
            QuotaRequestStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QuotaRequestStatus>(), Ok(status));
        }
        assert!("CANCELED".parse::<QuotaRequestStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!QuotaRequestStatus::Submitted.is_terminal());
        assert!(!QuotaRequestStatus::Pending.is_terminal());
        assert!(QuotaRequestStatus::Approved.is_terminal());
        assert!(QuotaRequestStatus::Denied.is_terminal());
        assert!(QuotaRequestStatus::TimedOut.is_terminal());
        assert!(QuotaRequestStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&QuotaRequestStatus::TimedOut).unwrap();
        assert_eq!(json, r#""TIMED_OUT""#);
    }
}
