//! Core domain types for the quota orchestrator.
//!
//! This module contains pure domain types with no I/O of their own:
//! - Account events and their classification
//! - Quota request typestate machine
//! - Reports and the per-run record

pub mod account;
pub mod report;
pub mod request;
pub mod run;

// Note: We don't use glob re-exports here; `request` re-exports its own states
pub use account::{AccountEvent, Classification, RawEvent, classify};
pub use report::{Report, ReportEntry, aggregate};
pub use run::{RunId, WorkflowRun};
