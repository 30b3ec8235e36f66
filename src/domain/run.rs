//! Per-run record owned by the orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::account::AccountEvent;
use super::report::Report;
use super::request::AnyQuotaRequest;

/// Unique identifier for one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        RunId(uuid)
    }
}

/// Everything one run knows. Dropped when the run ends.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub account_event: AccountEvent,
    pub requests: Vec<AnyQuotaRequest>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub report: Option<Report>,
}

impl WorkflowRun {
    pub fn new(account_event: AccountEvent, max_total_wait: std::time::Duration) -> Self {
        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(max_total_wait)
            .ok()
            .and_then(|wait| started_at.checked_add_signed(wait))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            run_id: RunId::new(),
            account_event,
            requests: Vec::new(),
            started_at,
            deadline,
            report: None,
        }
    }

    /// Number of requests that reached a terminal state.
    pub fn terminal_count(&self) -> usize {
        self.requests.iter().filter(|r| r.is_terminal()).count()
    }
}
