use std::time::Duration;

use quota_orchestrator::config::QuotaTarget;
use quota_orchestrator::query::mock::{status_body, token_body};
use quota_orchestrator::{
    Classification, MockNotifier, MockQueryClient, NoAccountResolver, Orchestrator,
    OrchestratorConfig, QueryAction, QueryError, QuotaRequestStatus, classify,
};
use serde_json::json;

const POLL_INTERVAL_MS: u64 = 60_000;

fn config(quotas: &[&str]) -> OrchestratorConfig {
    OrchestratorConfig {
        quotas: quotas
            .iter()
            .map(|quota| QuotaTarget {
                service_identifier: "ec2".to_string(),
                quota_dimension: quota.to_string(),
                desired_value: Some(100.0),
            })
            .collect(),
        poll_interval_ms: POLL_INTERVAL_MS,
        max_total_wait_ms: 100 * POLL_INTERVAL_MS,
        ..Default::default()
    }
}

fn existing_account_event() -> serde_json::Value {
    json!({
        "eventName": "MoveAccount",
        "requestParameters": {"target": {"id": "111122223333", "type": "ACCOUNT"}}
    })
}

#[test]
fn test_existing_account_is_classified_with_its_id() {
    let event = json!({"requestParameters": {"target": {"id": "111122223333", "type": "ACCOUNT"}}});
    let classified = classify(&event);
    assert_eq!(classified.classification, Classification::Existing);
    assert_eq!(classified.account_id.as_deref(), Some("111122223333"));
    assert_eq!(classify(&event), classified);
}

#[test]
fn test_empty_event_is_classified_as_new() {
    let classified = classify(&json!({}));
    assert_eq!(classified.classification, Classification::New);
    assert_eq!(classified.account_id, None);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_mixed_outcomes_are_reported_in_order() {
    let client = MockQueryClient::new();
    client.add_response(QueryAction::SubmitRequest, "L-A", Ok(token_body("tok-a")));
    client.add_response(QueryAction::SubmitRequest, "L-B", Ok(token_body("tok-b")));
    client.add_response(
        QueryAction::CheckStatus,
        "tok-a",
        Ok(status_body("APPROVED", "increase applied")),
    );
    for _ in 0..3 {
        client.add_response(
            QueryAction::CheckStatus,
            "tok-b",
            Err(QueryError::Transient("connection reset".to_string())),
        );
    }
    client.add_response(
        QueryAction::CheckStatus,
        "tok-b",
        Ok(status_body("DENIED", "exceeds account maximum")),
    );

    let notifier = MockNotifier::new();
    let orchestrator = Orchestrator::new(
        client.clone(),
        notifier.clone(),
        NoAccountResolver,
        config(&["L-A", "L-B"]),
    );
    let report = orchestrator.run(&existing_account_event()).await.unwrap();

    assert_eq!(report.account_id, "111122223333");
    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.entries[0].quota_dimension, "L-A");
    assert_eq!(report.entries[0].final_state, QuotaRequestStatus::Approved);
    assert_eq!(report.entries[0].detail, "increase applied");
    assert_eq!(report.entries[1].quota_dimension, "L-B");
    assert_eq!(report.entries[1].final_state, QuotaRequestStatus::Denied);
    assert!(report.entries[1].attempts >= 4);

    // Decided requests are never polled again
    assert_eq!(client.calls_for(QueryAction::CheckStatus, "tok-a"), 1);
    assert_eq!(client.calls_for(QueryAction::CheckStatus, "tok-b"), 4);

    assert_eq!(notifier.delivery_count(), 1);
    assert_eq!(notifier.delivered()[0], report);
    assert_eq!(orchestrator.active_trackers(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_request_that_never_decides_times_out() {
    let client = MockQueryClient::new();
    client.add_response(QueryAction::SubmitRequest, "L-A", Ok(token_body("tok-a")));
    client.set_default_response(QueryAction::CheckStatus, Ok(status_body("PENDING", "queued")));

    let mut config = config(&["L-A"]);
    config.max_total_wait_ms = 3 * POLL_INTERVAL_MS;

    let notifier = MockNotifier::new();
    let orchestrator = Orchestrator::new(client.clone(), notifier.clone(), NoAccountResolver, config);
    let report = orchestrator.run(&existing_account_event()).await.unwrap();

    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].final_state, QuotaRequestStatus::TimedOut);
    assert!(report.entries[0].attempts <= 3);
    assert_eq!(notifier.delivery_count(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_permanent_submission_error_fails_only_that_request() {
    let client = MockQueryClient::new();
    client.add_response(QueryAction::SubmitRequest, "L-A", Ok(token_body("tok-a")));
    client.add_response(
        QueryAction::SubmitRequest,
        "L-X",
        Err(QueryError::Permanent("ValidationException: unknown quota".to_string())),
    );
    client.add_response(QueryAction::SubmitRequest, "L-C", Ok(token_body("tok-c")));
    client.add_response(QueryAction::CheckStatus, "tok-a", Ok(status_body("APPROVED", "ok")));
    client.add_response(QueryAction::CheckStatus, "tok-c", Ok(status_body("PENDING", "")));
    client.add_response(QueryAction::CheckStatus, "tok-c", Ok(status_body("CASE_CLOSED", "ok")));

    let orchestrator = Orchestrator::new(
        client.clone(),
        MockNotifier::new(),
        NoAccountResolver,
        config(&["L-A", "L-X", "L-C"]),
    );
    let report = orchestrator.run(&existing_account_event()).await.unwrap();

    let states: Vec<_> = report.entries.iter().map(|e| e.final_state).collect();
    assert_eq!(
        states,
        [
            QuotaRequestStatus::Approved,
            QuotaRequestStatus::Failed,
            QuotaRequestStatus::Approved
        ]
    );
    assert_eq!(report.entries[1].attempts, 0);
    assert!(report.entries[1].detail.contains("unknown quota"));
    assert_eq!(client.calls_for(QueryAction::SubmitRequest, "L-X"), 1);
    assert_eq!(report.entries[2].attempts, 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_deadline_times_out_every_pending_request() {
    let quotas: Vec<String> = (0..8).map(|i| format!("L-{}", i)).collect();
    let quota_refs: Vec<&str> = quotas.iter().map(String::as_str).collect();

    let client = MockQueryClient::new();
    for quota in &quotas {
        client.add_response(
            QueryAction::SubmitRequest,
            quota,
            Ok(token_body(&format!("tok-{}", quota))),
        );
    }
    client.set_default_response(QueryAction::CheckStatus, Ok(status_body("CASE_OPENED", "")));

    let mut config = config(&quota_refs);
    config.max_total_wait_ms = 5 * POLL_INTERVAL_MS + POLL_INTERVAL_MS / 2;

    let started = tokio::time::Instant::now();
    let orchestrator = Orchestrator::new(client.clone(), MockNotifier::new(), NoAccountResolver, config);
    let report = orchestrator.run(&existing_account_event()).await.unwrap();

    assert!(started.elapsed() <= Duration::from_millis(6 * POLL_INTERVAL_MS));
    assert_eq!(report.entries.len(), 8);
    for entry in &report.entries {
        assert_eq!(entry.final_state, QuotaRequestStatus::TimedOut);
        assert_eq!(entry.attempts, 5);
    }
    assert_eq!(report.count(QuotaRequestStatus::Approved), 0);
    assert_eq!(report.count(QuotaRequestStatus::Denied), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_status_check_in_flight_at_deadline_is_cut_short() {
    let client = MockQueryClient::new();
    client.add_response(QueryAction::SubmitRequest, "L-A", Ok(token_body("tok-a")));
    client.add_response(QueryAction::CheckStatus, "tok-a", Ok(status_body("PENDING", "")));
    // Never released: the second check hangs until the deadline
    let _held = client.add_response_with_trigger(
        QueryAction::CheckStatus,
        "tok-a",
        Ok(status_body("APPROVED", "too late")),
    );

    let mut config = config(&["L-A"]);
    config.max_total_wait_ms = 10 * POLL_INTERVAL_MS;

    let orchestrator = Orchestrator::new(client.clone(), MockNotifier::new(), NoAccountResolver, config);
    let report = orchestrator.run(&existing_account_event()).await.unwrap();

    assert_eq!(report.entries[0].final_state, QuotaRequestStatus::TimedOut);
    assert_eq!(report.entries[0].attempts, 1);
    assert_eq!(client.in_flight_count(), 0);
}
