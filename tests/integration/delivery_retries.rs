//! Retry and backoff behavior of the ingest client against a mock endpoint

use std::time::Duration;

use assert_matches::assert_matches;
use montime_agent::delivery::{DeliveryError, IngestClient, TransientError};
use montime_agent::reporter::TickOutcome;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_succeeds_after_server_errors() {
    let mock_server = MockServer::start().await;

    // mounted first, so it answers until used up
    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(INGEST_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(60));
    let client = IngestClient::new(&config).unwrap();

    let delivery = client.deliver(&create_test_report()).await.unwrap();

    assert_eq!(delivery.attempt_count(), 3);
    assert_eq!(delivery.attempts[0].status, Some(500));
    assert_eq!(delivery.attempts[2].status, Some(200));

    let backoffs = delivery.backoffs();
    assert_eq!(backoffs.len(), 2);
    assert!(
        backoffs.windows(2).all(|pair| pair[0] <= pair[1]),
        "backoff delays should be non-decreasing: {backoffs:?}"
    );
    assert!(backoffs[0] >= config.retry.base_delay);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(60));
    let client = IngestClient::new(&config).unwrap();

    let result = client.deliver(&create_test_report()).await;

    assert_matches!(
        result,
        Err(DeliveryError::Exhausted {
            attempts: 3,
            last: TransientError::Server(502)
        })
    );
    assert_eq!(received_count(&mock_server).await, 3);
}

#[tokio::test]
async fn test_unauthorized_is_attempted_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(60));
    let client = IngestClient::new(&config).unwrap();

    let result = client.deliver(&create_test_report()).await;

    assert_matches!(result, Err(DeliveryError::Rejected { status: 401, .. }));
}

#[tokio::test]
async fn test_validation_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "error": "cpu must be a number"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(60));
    let client = IngestClient::new(&config).unwrap();

    let result = client.deliver(&create_test_report()).await;

    assert_matches!(
        result,
        Err(DeliveryError::Rejected { status: 422, ref body, attempts: 1 }) if body.contains("cpu must be a number")
    );
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&mock_server, Duration::from_secs(60));
    config.request_timeout = Duration::from_millis(200);
    config.retry.max_attempts = 2;
    let client = IngestClient::new(&config).unwrap();

    let result = client.deliver(&create_test_report()).await;

    assert_matches!(
        result,
        Err(DeliveryError::Exhausted {
            attempts: 2,
            last: TransientError::Timeout
        })
    );
}

#[tokio::test]
async fn test_tick_reports_retried_delivery() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(60));
    let mut reporter = create_test_reporter(&config, FixedSource);

    let outcome = reporter.tick().await;

    assert_eq!(outcome, TickOutcome::Delivered { attempts: 2 });
    assert_eq!(reporter.stats().attempts, 2);
}

#[tokio::test]
async fn test_rejection_after_retry_counts_every_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(60));
    let mut reporter = create_test_reporter(&config, FixedSource);

    let outcome = reporter.tick().await;

    assert_eq!(
        outcome,
        TickOutcome::Rejected {
            status: 401,
            attempts: 2
        }
    );
    let sent = received_count(&mock_server).await as u64;
    assert_eq!(sent, 2);
    assert_eq!(reporter.stats().attempts, sent);
    assert_eq!(reporter.stats().rejected, 1);
}
