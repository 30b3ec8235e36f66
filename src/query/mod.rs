//! Client abstraction for the quota/query backend.
//!
//! This module defines the `QueryClient` trait to abstract backend calls,
//! enabling testability with mock implementations. The client is a thin
//! adapter: it performs no retries, and it reports every failure as either
//! [`QueryError::Transient`] or [`QueryError::Permanent`] so that the caller
//! owning the request can decide what to do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::domain::request::{QuotaRequestData, RequestToken};
use crate::error::QueryError;

pub mod backend;
pub mod mock;

pub use backend::ReqwestQueryClient;
pub use mock::{MockCall, MockQueryClient};

/// Logical action understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryAction {
    /// Raise a quota-increase request; answers with a request token.
    SubmitRequest,
    /// Look up the decision for a request token.
    CheckStatus,
    /// Look up the progress of an account-creation request.
    DescribeAccountCreation,
}

impl QueryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryAction::SubmitRequest => "SubmitRequest",
            QueryAction::CheckStatus => "CheckStatus",
            QueryAction::DescribeAccountCreation => "DescribeAccountCreation",
        }
    }
}

impl std::fmt::Display for QueryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured answer from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub body: Value,
}

/// Trait for invoking the quota/query backend.
///
/// # Example
/// ```ignore
/// let client = ReqwestQueryClient::new(config.backend.clone())?;
/// let response = client.invoke(QueryAction::CheckStatus, json!({"requestToken": "abc"})).await?;
/// ```
#[async_trait]
pub trait QueryClient: Send + Sync + Clone {
    /// Execute one backend call.
    ///
    /// # Errors
    /// Returns [`QueryError::Transient`] for network failures, timeouts and
    /// throttling, [`QueryError::Permanent`] for everything retrying cannot fix.
    async fn invoke(&self, action: QueryAction, payload: Value)
    -> Result<QueryResponse, QueryError>;
}

/// Decision reported by a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pending,
    Approved,
    Denied,
}

impl Decision {
    /// Map the backend's status vocabulary onto a decision.
    pub fn parse(status: &str) -> Option<Self> {
        match status.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "CASE_OPENED" | "IN_PROGRESS" => Some(Decision::Pending),
            "APPROVED" | "CASE_CLOSED" => Some(Decision::Approved),
            "DENIED" | "NOT_APPROVED" => Some(Decision::Denied),
            _ => None,
        }
    }
}

/// Parsed answer to a `CheckStatus` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub decision: Decision,
    pub detail: String,
    /// Set when the backend could not fully answer; only meaningful while PENDING
    pub transient_error: Option<String>,
}

impl StatusResponse {
    /// Parse a status body.
    ///
    /// Fields are read from the top-level object, falling back to the first
    /// result row for query-shaped answers.
    pub fn from_body(body: &Value) -> Result<Self, QueryError> {
        let fields = response_fields(body);

        let status = lookup_str(&fields, &["decision", "status", "Status"]).ok_or_else(|| {
            QueryError::Permanent(format!("status response carried no decision: {}", body))
        })?;
        let decision = Decision::parse(&status).ok_or_else(|| {
            QueryError::Permanent(format!("unrecognised request status '{}'", status))
        })?;
        let detail =
            lookup_str(&fields, &["detail", "Detail", "statusReason"]).unwrap_or(status);
        let transient_error = lookup_str(&fields, &["transientError", "TransientError"]);

        Ok(StatusResponse {
            decision,
            detail,
            transient_error,
        })
    }
}

/// Payload for a `SubmitRequest` call.
pub fn submit_payload(data: &QuotaRequestData) -> Value {
    let mut payload = json!({
        "requestId": data.id.0.to_string(),
        "serviceIdentifier": data.service_identifier,
        "quotaDimension": data.quota_dimension,
        "accountId": data.account_id,
    });
    if let Some(value) = data.desired_value {
        payload["desiredValue"] = json!(value);
    }
    payload
}

/// Payload for a `CheckStatus` call.
pub fn status_payload(token: &RequestToken) -> Value {
    json!({ "requestToken": token.0 })
}

/// Submit a quota-increase request, returning the backend's token.
#[tracing::instrument(skip(client, data), fields(request_id = %data.id, quota = %data.quota_dimension))]
pub async fn submit_request<Q: QueryClient>(
    client: &Q,
    data: &QuotaRequestData,
) -> Result<RequestToken, QueryError> {
    let response = client
        .invoke(QueryAction::SubmitRequest, submit_payload(data))
        .await?;
    let fields = response_fields(&response.body);
    lookup_str(&fields, &["requestToken", "RequestId", "Id"])
        .filter(|token| !token.is_empty())
        .map(RequestToken)
        .ok_or_else(|| {
            QueryError::Permanent(format!(
                "submission response carried no request token: {}",
                response.body
            ))
        })
}

/// Check the status of an acknowledged request.
#[tracing::instrument(skip(client), fields(token = %token))]
pub async fn check_status<Q: QueryClient>(
    client: &Q,
    token: &RequestToken,
) -> Result<StatusResponse, QueryError> {
    let response = client
        .invoke(QueryAction::CheckStatus, status_payload(token))
        .await?;
    StatusResponse::from_body(&response.body)
}

/// Render a statement template, replacing `{m[Name]}` placeholders with the
/// matching payload parameter.
///
/// Any other text, braces included, is copied through unchanged.
pub fn format_statement(template: &str, params: &Map<String, Value>) -> Result<String, QueryError> {
    const OPEN: &str = "{m[";
    const CLOSE: &str = "]}";

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            QueryError::Permanent(format!("unterminated placeholder in statement: {}", template))
        })?;
        let name = &after[..end];
        let value = match params.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => {
                return Err(QueryError::Permanent(format!(
                    "unknown query parameter '{}'",
                    name
                )));
            }
        };
        out.push_str(&value);
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Flatten a response body into one field map.
///
/// Takes the top-level object and fills in missing keys from the first
/// result row. Rows may be objects or lists of single-key objects.
pub(crate) fn response_fields(body: &Value) -> Map<String, Value> {
    let mut fields = body.as_object().cloned().unwrap_or_default();
    let first_row = body
        .get("QueryResultRows")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first());

    if let Some(row) = first_row {
        let cells: Vec<&Map<String, Value>> = match row {
            Value::Object(obj) => vec![obj],
            Value::Array(cells) => cells.iter().filter_map(Value::as_object).collect(),
            _ => Vec::new(),
        };
        for cell in cells {
            for (key, value) in cell {
                fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    fields
}

pub(crate) fn lookup_str(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_format_statement_substitutes_placeholders() {
        let statement = format_statement(
            "SELECT status FROM {m[EventDataStore]} WHERE quota = '{m[quotaDimension]}' LIMIT {m[limit]}",
            &params(json!({"EventDataStore": "eds-1", "quotaDimension": "L-1216C47A", "limit": 5})),
        )
        .unwrap();
        assert_eq!(
            statement,
            "SELECT status FROM eds-1 WHERE quota = 'L-1216C47A' LIMIT 5"
        );
    }

    #[test]
    fn test_format_statement_leaves_other_braces_alone() {
        let statement = format_statement("{\"literal\": {x}}", &Map::new()).unwrap();
        assert_eq!(statement, "{\"literal\": {x}}");
    }

    #[test]
    fn test_format_statement_rejects_unknown_parameter() {
        let err = format_statement("SELECT {m[missing]}", &Map::new()).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_format_statement_rejects_unterminated_placeholder() {
        let err = format_statement("SELECT {m[open", &Map::new()).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_decision_vocabulary() {
        assert_eq!(Decision::parse("CASE_OPENED"), Some(Decision::Pending));
        assert_eq!(Decision::parse("approved"), Some(Decision::Approved));
        assert_eq!(Decision::parse("CASE_CLOSED"), Some(Decision::Approved));
        assert_eq!(Decision::parse("NOT_APPROVED"), Some(Decision::Denied));
        assert_eq!(Decision::parse("INVALID_REQUEST"), None);
    }

    #[test]
    fn test_status_response_from_top_level_fields() {
        let status = StatusResponse::from_body(&json!({
            "decision": "DENIED",
            "detail": "limit exceeds account maximum",
        }))
        .unwrap();
        assert_eq!(status.decision, Decision::Denied);
        assert_eq!(status.detail, "limit exceeds account maximum");
        assert_eq!(status.transient_error, None);
    }

    #[test]
    fn test_status_response_from_result_rows() {
        let status = StatusResponse::from_body(&json!({
            "QueryResultRows": [[{"status": "CASE_OPENED"}, {"statusReason": "awaiting support"}]]
        }))
        .unwrap();
        assert_eq!(status.decision, Decision::Pending);
        assert_eq!(status.detail, "awaiting support");
    }

    #[test]
    fn test_status_response_without_decision_is_permanent() {
        let err = StatusResponse::from_body(&json!({"detail": "?"})).unwrap_err();
        assert!(!err.is_transient());

        let err = StatusResponse::from_body(&json!({"status": "INVALID_REQUEST"})).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_submit_payload_includes_desired_value_only_when_set() {
        let mut data = QuotaRequestData {
            id: crate::domain::request::RequestId(uuid::Uuid::new_v4()),
            service_identifier: "ec2".to_string(),
            quota_dimension: "L-1216C47A".to_string(),
            account_id: "111122223333".to_string(),
            desired_value: None,
        };
        assert!(submit_payload(&data).get("desiredValue").is_none());

        data.desired_value = Some(256.0);
        assert_eq!(submit_payload(&data)["desiredValue"], json!(256.0));
        assert_eq!(submit_payload(&data)["accountId"], json!("111122223333"));
    }
}
