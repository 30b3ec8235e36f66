//! Aggregation of a finished batch into the operator report.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::request::{AnyQuotaRequest, QuotaRequestStatus, RequestId};
use super::run::RunId;
use crate::error::{OrchestratorError, Result};

/// Order in which statuses are summarized.
const SUMMARY_ORDER: [QuotaRequestStatus; 4] = [
    QuotaRequestStatus::Approved,
    QuotaRequestStatus::Denied,
    QuotaRequestStatus::TimedOut,
    QuotaRequestStatus::Failed,
];

/// Final outcome of one quota request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub request_id: RequestId,
    pub service_identifier: String,
    pub quota_dimension: String,
    pub final_state: QuotaRequestStatus,
    pub detail: String,
    pub attempts: u32,
}

/// Summary of one run, delivered to the operator once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub run_id: RunId,
    pub account_id: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ReportEntry>,
}

/// Build the report for a batch whose requests are all terminal.
///
/// Entries keep the order of `requests`. A request that is still in flight
/// is an `InvalidState` error.
pub fn aggregate(run_id: RunId, account_id: &str, requests: &[AnyQuotaRequest]) -> Result<Report> {
    let entries = requests
        .iter()
        .map(|request| -> Result<ReportEntry> {
            let result = request.result().ok_or_else(|| {
                OrchestratorError::InvalidState(
                    request.id(),
                    request.status().to_string(),
                    "terminal".to_string(),
                )
            })?;
            let data = request.data();
            Ok(ReportEntry {
                request_id: data.id,
                service_identifier: data.service_identifier.clone(),
                quota_dimension: data.quota_dimension.clone(),
                final_state: request.status(),
                detail: result.detail.clone(),
                attempts: request.attempts(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Report {
        run_id,
        account_id: account_id.to_string(),
        generated_at: Utc::now(),
        entries,
    })
}

impl Report {
    /// Number of entries that ended in `status`.
    pub fn count(&self, status: QuotaRequestStatus) -> usize {
        self.entries
            .iter()
            .filter(|e| e.final_state == status)
            .count()
    }

    /// One-line summary such as `2 APPROVED, 1 TIMED_OUT`.
    pub fn summary(&self) -> String {
        if self.entries.is_empty() {
            return "no requests".to_string();
        }
        SUMMARY_ORDER
            .iter()
            .filter_map(|status| match self.count(*status) {
                0 => None,
                n => Some(format!("{} {}", n, status)),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Mail subject for the report.
    pub fn subject(&self) -> String {
        format!("account {}: {}", self.account_id, self.summary())
    }

    /// Plain-text body for the report.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Quota increase requests for account {}", self.account_id);
        let _ = writeln!(out, "Run: {}", self.run_id);
        let _ = writeln!(out, "Generated: {}", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "Summary: {}", self.summary());
        let _ = writeln!(out);
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "- {}/{}: {} after {} status checks ({})",
                entry.service_identifier,
                entry.quota_dimension,
                entry.final_state,
                entry.attempts,
                entry.detail
            );
        }
        out
    }
}
