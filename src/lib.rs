//! Orchestration of service-quota increase requests for organization member accounts.
//!
//! An account-lifecycle event triggers a run: the event is classified as a new
//! or an existing account, one quota-increase request is submitted per
//! configured quota, and every request is polled concurrently until the
//! backend decides it or the run deadline passes. The outcomes are collected
//! into a single report that is handed to a notification channel once.
//!
//! The backend and the notification channel are reached through the
//! [`QueryClient`] and [`Notifier`] traits, so a run can be exercised entirely
//! against [`MockQueryClient`] and [`MockNotifier`].

pub mod config;
pub mod domain;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod poller;
pub mod query;
pub mod resolver;

// Re-export commonly used types
pub use config::{BackendConfig, NotifierConfig, OrchestratorConfig, QuotaTarget};
pub use domain::account::{AccountEvent, Classification, RawEvent, classify};
pub use domain::report::{Report, ReportEntry, aggregate};
pub use domain::request::{AnyQuotaRequest, QuotaRequestStatus, RequestId, RetryConfig};
pub use domain::run::{RunId, WorkflowRun};
pub use error::{DeliveryError, OrchestratorError, QueryError, Result};
pub use notify::{MockNotifier, Notifier, WebhookNotifier};
pub use orchestrator::Orchestrator;
pub use poller::FanOutPoller;
pub use query::{MockQueryClient, QueryAction, QueryClient, QueryResponse, ReqwestQueryClient};
pub use resolver::{AccountResolver, CreateAccountStatusResolver, NoAccountResolver};
