//! Fan-out poller driving a batch of quota requests to a terminal state.
//!
//! Every pending request gets its own tracker task with its own timer, so a
//! slow backend call for one request never delays the others. The poller
//! itself only waits for trackers to finish and enforces the deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::gauge;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::request::{AnyQuotaRequest, Pending, PollOutcome, QuotaRequest};
use crate::query::QueryClient;

/// Runs one tracker task per pending request.
pub struct FanOutPoller<Q: QueryClient> {
    client: Q,
    active_trackers: Arc<AtomicUsize>,
}

impl<Q: QueryClient + 'static> FanOutPoller<Q> {
    pub fn new(client: Q) -> Self {
        Self {
            client,
            active_trackers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of tracker tasks currently running.
    pub fn active_trackers(&self) -> usize {
        self.active_trackers.load(Ordering::Relaxed)
    }

    /// Poll every pending request until it is terminal or `deadline` passes.
    ///
    /// Returns one request per input, in input order, all terminal. Requests
    /// that are already terminal are passed through. Requests still pending
    /// at the deadline, and requests that were never acknowledged, come back
    /// TIMED_OUT. A tracker that panics leaves its request FAILED.
    #[tracing::instrument(skip(self, requests), fields(batch_size = requests.len()))]
    pub async fn run(
        &self,
        requests: Vec<AnyQuotaRequest>,
        interval: Duration,
        deadline: Instant,
    ) -> Vec<AnyQuotaRequest> {
        let mut results: Vec<Option<AnyQuotaRequest>> = Vec::with_capacity(requests.len());
        // Last state handed to each tracker, kept to recover from a panic
        let mut spawned: Vec<(usize, QuotaRequest<Pending>)> = Vec::new();

        let cancel = CancellationToken::new();
        let mut join_set: JoinSet<(usize, AnyQuotaRequest)> = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            match request {
                AnyQuotaRequest::Pending(pending) => {
                    spawned.push((index, pending.clone()));
                    results.push(None);

                    let client = self.client.clone();
                    let cancel = cancel.clone();
                    let active_trackers = self.active_trackers.clone();
                    let active = active_trackers.fetch_add(1, Ordering::Relaxed) + 1;
                    gauge!("quota_active_trackers").set(active as f64);

                    join_set.spawn(async move {
                        // Ensure we decrement the counter when this task completes
                        let _guard = scopeguard::guard((), |_| {
                            let active = active_trackers.fetch_sub(1, Ordering::Relaxed) - 1;
                            gauge!("quota_active_trackers").set(active as f64);
                        });

                        let finished = track(pending, client, interval, deadline, cancel).await;
                        (index, finished)
                    });
                }
                AnyQuotaRequest::Submitted(submitted) => {
                    tracing::warn!(
                        request_id = %submitted.data.id,
                        "Request was never acknowledged, marking as timed out"
                    );
                    results.push(Some(submitted.time_out().into()));
                }
                terminal => results.push(Some(terminal)),
            }
        }

        tracing::info!(trackers = join_set.len(), "Started request trackers");

        let deadline_sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_sleep);

        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((index, request))) => {
                        tracing::debug!(
                            request_id = %request.id(),
                            status = %request.status(),
                            "Tracker finished"
                        );
                        results[index] = Some(request);
                    }
                    Some(Err(join_error)) => {
                        tracing::error!(error = %join_error, "Tracker task panicked");
                    }
                    None => break,
                },
                _ = &mut deadline_sleep, if !cancel.is_cancelled() => {
                    tracing::info!(
                        remaining = join_set.len(),
                        "Deadline reached, stopping remaining trackers"
                    );
                    cancel.cancel();
                }
            }
        }

        for (index, last_known) in spawned {
            if results[index].is_none() {
                results[index] = Some(last_known.abandon().into());
            }
        }

        results.into_iter().flatten().collect()
    }
}

/// Poll one request on its own interval until it is terminal.
///
/// The first check happens one interval after start. Ticks at or past the
/// deadline issue no call, and cancellation stops a call in flight; in both
/// cases the request times out with the checks that completed.
async fn track<Q: QueryClient>(
    mut request: QuotaRequest<Pending>,
    client: Q,
    interval: Duration,
    deadline: Instant,
    cancel: CancellationToken,
) -> AnyQuotaRequest {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return request.time_out().into(),
            _ = ticker.tick() => {}
        }
        if Instant::now() >= deadline {
            return request.time_out().into();
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return request.time_out().into(),
            outcome = request.clone().poll(&client) => outcome,
        };

        match outcome {
            PollOutcome::InProgress(next) => request = next,
            terminal => return terminal.into(),
        }
    }
}
