//! Looking up the id of a freshly created account.
//!
//! A NEW-account event arrives before the account exists, so it carries no
//! account id. A resolver is asked repeatedly by the orchestrator until it
//! produces one; the orchestrator owns the retry schedule.

use async_trait::async_trait;
use serde_json::json;

use crate::domain::account::AccountEvent;
use crate::error::QueryError;
use crate::query::{QueryAction, QueryClient, lookup_str, response_fields};

/// Source of the account id for a NEW-account event.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// Ask once.
    ///
    /// `Ok(None)` means the account is not ready yet. A transient error is
    /// worth asking again; a permanent one ends the lookup.
    async fn resolve(&self, event: &AccountEvent) -> Result<Option<String>, QueryError>;
}

/// Reads the creation status of the account through the query backend.
#[derive(Clone)]
pub struct CreateAccountStatusResolver<Q: QueryClient> {
    client: Q,
}

impl<Q: QueryClient> CreateAccountStatusResolver<Q> {
    pub fn new(client: Q) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<Q: QueryClient + 'static> AccountResolver for CreateAccountStatusResolver<Q> {
    #[tracing::instrument(skip(self, event), fields(creation_request_id = ?event.creation_request_id))]
    async fn resolve(&self, event: &AccountEvent) -> Result<Option<String>, QueryError> {
        let creation_request_id = event.creation_request_id.as_deref().ok_or_else(|| {
            QueryError::Permanent("event carries no account creation request id".to_string())
        })?;

        let response = self
            .client
            .invoke(
                QueryAction::DescribeAccountCreation,
                json!({ "creationRequestId": creation_request_id }),
            )
            .await?;
        let fields = response_fields(&response.body);

        // No row yet means the creation has not been recorded
        let Some(state) = lookup_str(&fields, &["state", "State"]) else {
            tracing::debug!("Account creation not recorded yet");
            return Ok(None);
        };

        match state.as_str() {
            "SUCCEEDED" => {
                let account_id = lookup_str(&fields, &["accountId", "AccountId"])
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        QueryError::Permanent(
                            "account creation succeeded without an account id".to_string(),
                        )
                    })?;
                tracing::info!(account_id = %account_id, "Account creation succeeded");
                Ok(Some(account_id))
            }
            "IN_PROGRESS" => {
                tracing::debug!("Account creation still in progress");
                Ok(None)
            }
            "FAILED" => {
                let reason = lookup_str(&fields, &["failureReason", "FailureReason"])
                    .unwrap_or_else(|| "unknown reason".to_string());
                Err(QueryError::Permanent(format!(
                    "account creation failed: {}",
                    reason
                )))
            }
            other => Err(QueryError::Permanent(format!(
                "unrecognised account creation state '{}'",
                other
            ))),
        }
    }
}

/// Resolver for deployments that only handle existing accounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccountResolver;

#[async_trait]
impl AccountResolver for NoAccountResolver {
    async fn resolve(&self, _event: &AccountEvent) -> Result<Option<String>, QueryError> {
        Ok(None)
    }
}
