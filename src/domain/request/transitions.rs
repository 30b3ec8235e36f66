//! State transitions for quota requests using the typestate pattern.
//!
//! ```text
//! QuotaRequest<Submitted> ──submit()──> Acknowledged(QuotaRequest<Pending>)
//!        │                         └──> Rejected(QuotaRequest<Failed>)       (permanent error)
//!        │                         └──> Retry(QuotaRequest<Submitted>)       (transient error)
//!        ├──give_up()──> QuotaRequest<Failed>
//!        └──time_out()─> QuotaRequest<TimedOut>
//!
//! QuotaRequest<Pending> ──poll()──> InProgress(QuotaRequest<Pending>)
//!        │                     └──> Approved / Denied
//!        │                     └──> Failed                               (permanent error)
//!        └──time_out()──> QuotaRequest<TimedOut>
//! ```
//!
//! Terminal states have no transition methods. Each transition into one
//! records the request's result exactly once.

use std::time::Duration;

use chrono::Utc;
use metrics::counter;

use super::state::{
    Approved, Denied, Failed, FailureReason, Pending, PollOutcome, QuotaRequest,
    QuotaRequestData, QuotaRequestResult, QuotaRequestStatus, RequestId, SubmissionResult,
    Submitted, TimedOut,
};
use crate::config::{OrchestratorConfig, QuotaTarget};
use crate::error::QueryError;
use crate::query::{self, Decision, QueryClient};

fn record_terminal(status: QuotaRequestStatus) {
    counter!("quota_requests_total", "status" => status.as_str()).increment(1);
}

impl QuotaRequest<Submitted> {
    /// Create a request for one quota target.
    pub fn new(target: &QuotaTarget, account_id: &str) -> Self {
        QuotaRequest {
            data: QuotaRequestData {
                id: RequestId::from(uuid::Uuid::new_v4()),
                service_identifier: target.service_identifier.clone(),
                quota_dimension: target.quota_dimension.clone(),
                account_id: account_id.to_string(),
                desired_value: target.desired_value,
            },
            state: Submitted {
                created_at: Utc::now(),
                submit_attempts: 0,
            },
        }
    }

    /// Issue the submission call.
    #[tracing::instrument(skip(self, client), fields(request_id = %self.data.id, quota = %self.data.quota_dimension))]
    pub async fn submit<Q: QueryClient>(mut self, client: &Q) -> SubmissionResult {
        self.state.submit_attempts += 1;

        match query::submit_request(client, &self.data).await {
            Ok(token) => {
                tracing::info!(token = %token, "Quota request acknowledged");
                let now = Utc::now();
                SubmissionResult::Acknowledged(QuotaRequest {
                    data: self.data,
                    state: Pending {
                        token,
                        submitted_at: now,
                        attempts: 0,
                        last_checked_at: now,
                    },
                })
            }
            Err(QueryError::Permanent(error)) => {
                tracing::warn!(error = %error, "Quota request submission rejected");
                SubmissionResult::Rejected(self.fail(FailureReason::SubmissionRejected { error }))
            }
            Err(e) => {
                tracing::warn!(
                    submit_attempts = self.state.submit_attempts,
                    error = %e,
                    "Quota request submission failed with transient error"
                );
                SubmissionResult::Retry(self, e)
            }
        }
    }

    /// Stop retrying a submission that only ever failed transiently.
    pub fn give_up(self, error: &QueryError) -> QuotaRequest<Failed> {
        let attempts = self.state.submit_attempts;
        self.fail(FailureReason::SubmissionExhausted {
            attempts,
            error: error.to_string(),
        })
    }

    /// The run deadline passed before the submission was acknowledged.
    pub fn time_out(self) -> QuotaRequest<TimedOut> {
        record_terminal(QuotaRequestStatus::TimedOut);
        QuotaRequest {
            data: self.data,
            state: TimedOut {
                token: None,
                attempts: 0,
                last_checked_at: None,
                result: QuotaRequestResult {
                    detail: "Run deadline passed before submission was acknowledged".to_string(),
                    finished_at: Utc::now(),
                },
            },
        }
    }

    fn fail(self, reason: FailureReason) -> QuotaRequest<Failed> {
        record_terminal(QuotaRequestStatus::Failed);
        QuotaRequest {
            data: self.data,
            state: Failed {
                result: QuotaRequestResult {
                    detail: reason.to_error_message(),
                    finished_at: Utc::now(),
                },
                reason,
                token: None,
                attempts: 0,
                last_checked_at: None,
            },
        }
    }
}

impl QuotaRequest<Pending> {
    /// Check the request's status once and apply the result.
    ///
    /// A transient failure leaves the request pending. A terminal decision
    /// wins over a transient-error flag carried by the same response.
    #[tracing::instrument(skip(self, client), fields(request_id = %self.data.id, token = %self.state.token, attempt = self.state.attempts + 1))]
    pub async fn poll<Q: QueryClient>(mut self, client: &Q) -> PollOutcome {
        self.state.attempts += 1;
        let response = query::check_status(client, &self.state.token).await;
        let now = Utc::now();
        self.state.last_checked_at = now;

        match response {
            Ok(status) if status.decision == Decision::Approved => {
                counter!("quota_status_checks_total", "outcome" => "approved").increment(1);
                record_terminal(QuotaRequestStatus::Approved);
                tracing::info!(detail = %status.detail, "Quota request approved");
                PollOutcome::Approved(QuotaRequest {
                    data: self.data,
                    state: Approved {
                        token: self.state.token,
                        attempts: self.state.attempts,
                        last_checked_at: now,
                        result: QuotaRequestResult {
                            detail: status.detail,
                            finished_at: now,
                        },
                    },
                })
            }
            Ok(status) if status.decision == Decision::Denied => {
                counter!("quota_status_checks_total", "outcome" => "denied").increment(1);
                record_terminal(QuotaRequestStatus::Denied);
                tracing::info!(detail = %status.detail, "Quota request denied");
                PollOutcome::Denied(QuotaRequest {
                    data: self.data,
                    state: Denied {
                        token: self.state.token,
                        attempts: self.state.attempts,
                        last_checked_at: now,
                        result: QuotaRequestResult {
                            detail: status.detail,
                            finished_at: now,
                        },
                    },
                })
            }
            Ok(status) => {
                if let Some(error) = status.transient_error {
                    counter!("quota_status_checks_total", "outcome" => "transient").increment(1);
                    tracing::warn!(error = %error, "Status check reported a transient error, will retry");
                } else {
                    counter!("quota_status_checks_total", "outcome" => "pending").increment(1);
                    tracing::debug!(detail = %status.detail, "Quota request still pending");
                }
                PollOutcome::InProgress(self)
            }
            Err(QueryError::Transient(error)) => {
                counter!("quota_status_checks_total", "outcome" => "transient").increment(1);
                tracing::warn!(error = %error, "Status check failed with transient error, will retry");
                PollOutcome::InProgress(self)
            }
            Err(QueryError::Permanent(error)) => {
                counter!("quota_status_checks_total", "outcome" => "rejected").increment(1);
                record_terminal(QuotaRequestStatus::Failed);
                tracing::warn!(error = %error, "Status check rejected");
                let reason = FailureReason::StatusCheckRejected { error };
                PollOutcome::Failed(QuotaRequest {
                    data: self.data,
                    state: Failed {
                        result: QuotaRequestResult {
                            detail: reason.to_error_message(),
                            finished_at: now,
                        },
                        reason,
                        token: Some(self.state.token),
                        attempts: self.state.attempts,
                        last_checked_at: Some(now),
                    },
                })
            }
        }
    }

    /// Force the request to TIMED_OUT because the run deadline passed.
    pub fn time_out(self) -> QuotaRequest<TimedOut> {
        record_terminal(QuotaRequestStatus::TimedOut);
        tracing::info!(
            request_id = %self.data.id,
            attempts = self.state.attempts,
            "Quota request timed out"
        );
        QuotaRequest {
            data: self.data,
            state: TimedOut {
                result: QuotaRequestResult {
                    detail: format!(
                        "No decision after {} status checks before the run deadline",
                        self.state.attempts
                    ),
                    finished_at: Utc::now(),
                },
                token: Some(self.state.token),
                attempts: self.state.attempts,
                last_checked_at: Some(self.state.last_checked_at),
            },
        }
    }

    /// The task tracking this request died; keep what is known about it.
    pub fn abandon(self) -> QuotaRequest<Failed> {
        record_terminal(QuotaRequestStatus::Failed);
        let reason = FailureReason::TrackerTerminated;
        QuotaRequest {
            data: self.data,
            state: Failed {
                result: QuotaRequestResult {
                    detail: reason.to_error_message(),
                    finished_at: Utc::now(),
                },
                reason,
                token: Some(self.state.token),
                attempts: self.state.attempts,
                last_checked_at: Some(self.state.last_checked_at),
            },
        }
    }
}

/// Configuration for submission retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl From<&OrchestratorConfig> for RetryConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        RetryConfig {
            max_attempts: config.submit_max_attempts,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt: `backoff_ms * (backoff_factor ^ attempt)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }
}
