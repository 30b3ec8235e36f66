//! One workflow run, from trigger event to delivered report.
//!
//! The orchestrator owns the run deadline. Everything it starts, from the
//! account lookup to the last status check, stops when the deadline passes.

use futures::future::join_all;
use metrics::counter;
use tokio::time::Instant;

use crate::config::OrchestratorConfig;
use crate::domain::account::{AccountEvent, Classification, RawEvent, classify};
use crate::domain::report::{Report, aggregate};
use crate::domain::request::{AnyQuotaRequest, QuotaRequest, RetryConfig, SubmissionResult, Submitted};
use crate::domain::run::WorkflowRun;
use crate::error::{OrchestratorError, Result};
use crate::notify::Notifier;
use crate::poller::FanOutPoller;
use crate::query::QueryClient;
use crate::resolver::AccountResolver;

/// Runs quota-increase workflows.
///
/// # Example
/// ```ignore
/// let orchestrator = Orchestrator::new(client, notifier, NoAccountResolver, config);
/// let report = orchestrator.run(&event).await?;
/// ```
pub struct Orchestrator<Q, N, R>
where
    Q: QueryClient + 'static,
    N: Notifier,
    R: AccountResolver,
{
    client: Q,
    notifier: N,
    resolver: R,
    config: OrchestratorConfig,
    poller: FanOutPoller<Q>,
}

impl<Q, N, R> Orchestrator<Q, N, R>
where
    Q: QueryClient + 'static,
    N: Notifier,
    R: AccountResolver,
{
    pub fn new(client: Q, notifier: N, resolver: R, config: OrchestratorConfig) -> Self {
        let poller = FanOutPoller::new(client.clone());
        Self {
            client,
            notifier,
            resolver,
            config,
            poller,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Number of request trackers currently running.
    pub fn active_trackers(&self) -> usize {
        self.poller.active_trackers()
    }

    /// Run the workflow for one trigger event.
    ///
    /// Returns the report once it was delivered. Fails when no account id
    /// can be obtained for a new account or when delivery fails; the
    /// notifier is never called more than once.
    #[tracing::instrument(skip(self, event), fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, event: &RawEvent) -> Result<Report> {
        let deadline = Instant::now() + self.config.max_total_wait();
        let mut run = WorkflowRun::new(classify(event), self.config.max_total_wait());
        tracing::Span::current().record("run_id", tracing::field::display(run.run_id));

        tracing::info!(
            classification = ?run.account_event.classification,
            account_id = ?run.account_event.account_id,
            deadline = %run.deadline,
            "Starting quota request run"
        );

        let result = self.execute(&mut run, deadline).await;
        match &result {
            Ok(report) => {
                counter!("quota_runs_total", "outcome" => "delivered").increment(1);
                tracing::info!(summary = %report.summary(), "Run finished");
            }
            Err(e) => {
                counter!("quota_runs_total", "outcome" => "failed").increment(1);
                tracing::error!(error = %e, "Run failed");
            }
        }
        result
    }

    async fn execute(&self, run: &mut WorkflowRun, deadline: Instant) -> Result<Report> {
        let account_id = self.resolve_account(&run.account_event, deadline).await?;

        let retry = RetryConfig::from(&self.config);
        let submissions = self
            .config
            .quotas
            .iter()
            .map(|target| QuotaRequest::new(target, &account_id))
            .map(|request| self.submit_with_retry(request, &retry, deadline));
        run.requests = join_all(submissions).await;

        tracing::info!(
            requests = run.requests.len(),
            acknowledged = run
                .requests
                .iter()
                .filter(|r| matches!(r, AnyQuotaRequest::Pending(_)))
                .count(),
            "Submitted quota requests"
        );

        let requests = std::mem::take(&mut run.requests);
        run.requests = self
            .poller
            .run(requests, self.config.poll_interval(), deadline)
            .await;

        let report = aggregate(run.run_id, &account_id, &run.requests)?;
        self.notifier.deliver(&report).await?;
        run.report = Some(report.clone());
        Ok(report)
    }

    /// Submit one request, retrying transient failures with backoff.
    ///
    /// Stops at the deadline, timing the request out, and gives up after
    /// `submit_max_attempts` calls.
    async fn submit_with_retry(
        &self,
        mut request: QuotaRequest<Submitted>,
        retry: &RetryConfig,
        deadline: Instant,
    ) -> AnyQuotaRequest {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => return request.time_out().into(),
                outcome = request.clone().submit(&self.client) => outcome,
            };

            let (next, error) = match outcome {
                SubmissionResult::Acknowledged(pending) => return pending.into(),
                SubmissionResult::Rejected(failed) => return failed.into(),
                SubmissionResult::Retry(next, error) => (next, error),
            };

            let attempts = next.state.submit_attempts;
            if attempts >= retry.max_attempts {
                tracing::warn!(
                    request_id = %next.data.id,
                    attempts,
                    "Submission retries exhausted"
                );
                return next.give_up(&error).into();
            }

            let wake_at = Instant::now() + retry.backoff(attempts - 1);
            if wake_at >= deadline {
                return next.time_out().into();
            }
            tokio::time::sleep_until(wake_at).await;
            request = next;
        }
    }

    /// Find the account the run is for.
    async fn resolve_account(&self, event: &AccountEvent, deadline: Instant) -> Result<String> {
        if event.classification == Classification::Existing {
            return event.account_id.clone().ok_or_else(|| {
                OrchestratorError::AccountUnavailable(
                    "existing-account event carries no account id".to_string(),
                )
            });
        }

        let attempts = self.config.account_lookup_attempts;
        let interval = self.config.account_lookup_interval();

        for attempt in 1..=attempts {
            match tokio::time::timeout_at(deadline, self.resolver.resolve(event)).await {
                Err(_elapsed) => break,
                Ok(Ok(Some(account_id))) => {
                    tracing::info!(account_id = %account_id, attempt, "Resolved new account id");
                    return Ok(account_id);
                }
                Ok(Ok(None)) => {
                    tracing::debug!(attempt, "New account id not available yet");
                }
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "Account lookup failed with transient error");
                }
                Ok(Err(e)) => {
                    return Err(OrchestratorError::AccountUnavailable(e.to_string()));
                }
            }

            if attempt == attempts {
                break;
            }
            let wake_at = Instant::now() + interval;
            if wake_at >= deadline {
                break;
            }
            tokio::time::sleep_until(wake_at).await;
        }

        Err(OrchestratorError::AccountUnavailable(format!(
            "no account id for the new account after {} lookups",
            attempts
        )))
    }
}
