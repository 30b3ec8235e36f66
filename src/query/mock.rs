//! Mock query client for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::{QueryAction, QueryClient, QueryResponse};
use crate::error::QueryError;

/// Mock query client for testing.
///
/// Responses are keyed by action and a per-action key taken from the
/// payload: the quota dimension for `SubmitRequest`, the request token for
/// `CheckStatus` and the creation request id for `DescribeAccountCreation`.
/// Queued responses are returned in FIFO order; once a queue is empty the
/// action's default response (if any) is repeated.
///
/// # Example
/// ```ignore
/// let mock = MockQueryClient::new();
/// mock.add_response(QueryAction::SubmitRequest, "L-1216C47A", Ok(token_body("tok-1")));
/// mock.add_response(QueryAction::CheckStatus, "tok-1", Ok(status_body("APPROVED", "granted")));
/// ```
#[derive(Clone)]
pub struct MockQueryClient {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    defaults: Arc<Mutex<HashMap<QueryAction, Result<Value, QueryError>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

/// A mock response that can optionally wait for a trigger before completing.
enum MockResponse {
    Immediate(Result<Value, QueryError>),
    Triggered {
        response: Result<Value, QueryError>,
        trigger: Option<oneshot::Receiver<()>>,
    },
}

/// Record of a call made to the mock client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub action: QueryAction,
    pub key: String,
    pub payload: Value,
}

/// Body of an acknowledged submission.
pub fn token_body(token: &str) -> Value {
    json!({ "requestToken": token })
}

/// Body of a status check answer.
pub fn status_body(decision: &str, detail: &str) -> Value {
    json!({ "decision": decision, "detail": detail })
}

fn response_key(action: QueryAction, key: &str) -> String {
    format!("{} {}", action, key)
}

fn payload_key(action: QueryAction, payload: &Value) -> String {
    let field = match action {
        QueryAction::SubmitRequest => "quotaDimension",
        QueryAction::CheckStatus => "requestToken",
        QueryAction::DescribeAccountCreation => "creationRequestId",
    };
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl MockQueryClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            defaults: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a response for `action` calls whose payload key equals `key`.
    pub fn add_response(&self, action: QueryAction, key: &str, response: Result<Value, QueryError>) {
        self.responses
            .lock()
            .entry(response_key(action, key))
            .or_default()
            .push_back(MockResponse::Immediate(response));
    }

    /// Queue a response that only completes once the returned sender fires
    /// (or is dropped).
    pub fn add_response_with_trigger(
        &self,
        action: QueryAction,
        key: &str,
        response: Result<Value, QueryError>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .entry(response_key(action, key))
            .or_default()
            .push_back(MockResponse::Triggered {
                response,
                trigger: Some(rx),
            });
        tx
    }

    /// Response repeated for `action` whenever no queued response matches.
    pub fn set_default_response(&self, action: QueryAction, response: Result<Value, QueryError>) {
        self.defaults.lock().insert(action, response);
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made for one action and key.
    pub fn calls_for(&self, action: QueryAction, key: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.action == action && call.key == key)
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls currently executing. Drops when a caller abandons a call.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockQueryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryClient for MockQueryClient {
    async fn invoke(
        &self,
        action: QueryAction,
        payload: Value,
    ) -> Result<QueryResponse, QueryError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let key = payload_key(action, &payload);
        self.calls.lock().push(MockCall {
            action,
            key: key.clone(),
            payload,
        });

        let queued = self
            .responses
            .lock()
            .get_mut(&response_key(action, &key))
            .and_then(VecDeque::pop_front);

        let response = match queued {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                if let Some(rx) = trigger {
                    // Proceed whether the trigger fired or was dropped
                    let _ = rx.await;
                }
                response
            }
            None => match self.defaults.lock().get(&action) {
                Some(response) => response.clone(),
                None => Err(QueryError::Permanent(format!(
                    "No mock response configured for {} {}",
                    action, key
                ))),
            },
        };

        response.map(|body| QueryResponse { body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_client_fifo_then_default() {
        let mock = MockQueryClient::new();
        mock.add_response(
            QueryAction::CheckStatus,
            "tok-1",
            Ok(status_body("PENDING", "first")),
        );
        mock.set_default_response(QueryAction::CheckStatus, Ok(status_body("PENDING", "again")));

        let payload = json!({"requestToken": "tok-1"});
        let first = mock
            .invoke(QueryAction::CheckStatus, payload.clone())
            .await
            .unwrap();
        assert_eq!(first.body["detail"], "first");

        for _ in 0..2 {
            let next = mock
                .invoke(QueryAction::CheckStatus, payload.clone())
                .await
                .unwrap();
            assert_eq!(next.body["detail"], "again");
        }

        assert_eq!(mock.calls_for(QueryAction::CheckStatus, "tok-1"), 3);
        assert_eq!(mock.calls_for(QueryAction::SubmitRequest, "tok-1"), 0);
    }

    #[tokio::test]
    async fn test_mock_client_no_response() {
        let mock = MockQueryClient::new();
        let result = mock
            .invoke(QueryAction::SubmitRequest, json!({"quotaDimension": "L-1"}))
            .await;
        assert!(matches!(result, Err(QueryError::Permanent(_))));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.get_calls()[0].key, "L-1");
    }

    #[tokio::test]
    async fn test_mock_client_with_trigger() {
        let mock = MockQueryClient::new();
        let trigger = mock.add_response_with_trigger(
            QueryAction::SubmitRequest,
            "L-1",
            Ok(token_body("tok-1")),
        );

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move {
            mock_clone
                .invoke(QueryAction::SubmitRequest, json!({"quotaDimension": "L-1"}))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.body["requestToken"], "tok-1");
        assert_eq!(mock.in_flight_count(), 0);
    }
}
