//! Production query client using reqwest.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{QueryAction, QueryClient, QueryResponse, format_statement};
use crate::config::{BackendConfig, event_data_store_id};
use crate::error::QueryError;

/// Parameters every backend call must carry.
const REQUIRED_PARAMETERS: [&str; 2] = ["EventDataStore", "QueryStatement"];

/// Production query client.
///
/// Each call renders the action's statement template, posts it to the
/// configured endpoint and collects every result page.
#[derive(Clone)]
pub struct ReqwestQueryClient {
    client: reqwest::Client,
    config: BackendConfig,
    event_data_store: String,
}

impl ReqwestQueryClient {
    /// Create a client for the configured backend.
    ///
    /// Fails if the event data store ARN is malformed.
    pub fn new(config: BackendConfig) -> crate::Result<Self> {
        let event_data_store = event_data_store_id(&config.event_data_store_arn)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            config,
            event_data_store,
        })
    }

    /// Build the request body for one call.
    fn build_body(&self, action: QueryAction, payload: Value) -> Result<Value, QueryError> {
        let mut params: Map<String, Value> = match payload {
            Value::Object(params) => params,
            other => {
                return Err(QueryError::Permanent(format!(
                    "payload must be a JSON object, got {}",
                    other
                )));
            }
        };
        params.insert(
            "EventDataStore".to_string(),
            Value::String(self.event_data_store.clone()),
        );

        let statement = format_statement(self.config.statements.for_action(action), &params)?;

        let body = json!({
            "Action": action.as_str(),
            "EventDataStore": self.event_data_store,
            "QueryStatement": statement,
            "QueryFormatParams": Value::Object(params),
            "MaxQueryResults": self.config.max_query_results,
        });
        validate_required(&body)?;
        Ok(body)
    }

    /// Send one page request and unwrap the response envelope.
    async fn send_page(&self, body: &Value) -> Result<Value, QueryError> {
        let mut req = self
            .client
            .post(&self.config.endpoint)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(body);

        // Only add Authorization header if api_key is not empty
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(endpoint = %self.config.endpoint, error = %e, "Query backend call failed");
            QueryError::from(e)
        })?;

        let status = response.status().as_u16();
        let text = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(QueryError::from_status(status, text));
        }

        let envelope: Value = serde_json::from_str(&text)
            .map_err(|e| QueryError::Permanent(format!("invalid response body: {}", e)))?;
        unwrap_envelope(envelope)
    }
}

/// Reject a body that lacks a required parameter.
fn validate_required(body: &Value) -> Result<(), QueryError> {
    for param in REQUIRED_PARAMETERS {
        let present = body
            .get(param)
            .and_then(Value::as_str)
            .is_some_and(|v| !v.is_empty());
        if !present {
            return Err(QueryError::Permanent(format!("MissingParameter: {}", param)));
        }
    }
    Ok(())
}

/// Normalize a backend answer.
///
/// Function-style answers `{statusCode, body}` are unwrapped and their
/// status honoured; a string body is parsed as JSON; a bare list of rows
/// becomes `{"QueryResultRows": [...]}`.
fn unwrap_envelope(envelope: Value) -> Result<Value, QueryError> {
    let body = match envelope.get("statusCode").and_then(Value::as_u64) {
        Some(code) => {
            let body = envelope.get("body").cloned().unwrap_or(Value::Null);
            let status = u16::try_from(code).map_err(|_| {
                QueryError::Permanent(format!("invalid envelope statusCode {}: {}", code, body))
            })?;
            if !(200..300).contains(&status) {
                return Err(QueryError::from_status(status, body.to_string()));
            }
            body
        }
        None => envelope,
    };

    let body = match body {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    };

    Ok(match body {
        Value::Array(rows) => json!({ "QueryResultRows": rows }),
        other => other,
    })
}

#[async_trait]
impl QueryClient for ReqwestQueryClient {
    #[tracing::instrument(skip(self, payload), fields(action = %action))]
    async fn invoke(
        &self,
        action: QueryAction,
        payload: Value,
    ) -> Result<QueryResponse, QueryError> {
        let mut body = self.build_body(action, payload)?;

        tracing::debug!(
            endpoint = %self.config.endpoint,
            timeout_ms = self.config.timeout_ms,
            "Invoking query backend"
        );

        let mut first_page: Option<Value> = None;
        let mut rows: Vec<Value> = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = self.send_page(&body).await?;
            pages += 1;

            if let Some(page_rows) = page.get("QueryResultRows").and_then(Value::as_array) {
                rows.extend(page_rows.iter().cloned());
            }
            let next_token = page
                .get("NextToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if first_page.is_none() {
                first_page = Some(page);
            }

            match next_token {
                Some(token) => {
                    if body.get("NextToken").and_then(Value::as_str) == Some(token.as_str()) {
                        return Err(QueryError::Permanent(format!(
                            "backend repeated pagination token '{}'",
                            token
                        )));
                    }
                    body["NextToken"] = Value::String(token);
                }
                None => break,
            }
        }

        let mut merged = first_page.unwrap_or(Value::Null);
        if let Some(obj) = merged.as_object_mut() {
            obj.remove("NextToken");
            if !rows.is_empty() {
                obj.insert("QueryResultRows".to_string(), Value::Array(rows));
            }
        }

        tracing::info!(pages, "Query backend call completed");

        Ok(QueryResponse { body: merged })
    }
}
