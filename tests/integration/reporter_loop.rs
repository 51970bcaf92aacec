//! Scheduling, failure containment and shutdown of the running reporter

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use montime_agent::reporter::ReporterHandle;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_one_delivery_per_interval() {
    let mock_server = MockServer::start().await;

    let arrivals = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let arrivals_clone = arrivals.clone();

    Mock::given(method("POST"))
        .respond_with(move |_req: &wiremock::Request| {
            arrivals_clone.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(200)
        })
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_millis(200));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FixedSource));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    handle.shutdown().await.unwrap();
    let stats = task.await.unwrap();

    let arrivals = arrivals.lock().unwrap().clone();
    assert!(
        (4..=7).contains(&arrivals.len()),
        "expected about one report per interval, got {}",
        arrivals.len()
    );
    assert_eq!(stats.delivered as usize, arrivals.len());
    assert_eq!(stats.attempts, stats.delivered);

    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(120) && gap <= Duration::from_millis(400),
            "reports should be spaced by the interval, got {gap:?}"
        );
    }
}

#[tokio::test]
async fn test_rejected_ticks_do_not_stop_the_loop() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_millis(100));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FixedSource));

    let reached = wait_for_stats(&handle, 2000, |stats| stats.rejected >= 3).await;
    assert!(reached, "reporter should keep ticking after rejections");

    let stats = handle.stats().await.unwrap();
    // one attempt per rejected tick, never a retry
    assert_eq!(stats.attempts, stats.rejected);
    assert_eq!(stats.delivered, 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_collection_failures_skip_ticks() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_millis(50));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FailingSource));

    let reached = wait_for_stats(&handle, 2000, |stats| stats.collection_failures >= 3).await;
    assert!(reached, "reporter should survive failed collections");

    handle.shutdown().await.unwrap();
    let stats = task.await.unwrap();

    assert_eq!(stats.ticks, stats.collection_failures);
    assert_eq!(stats.attempts, 0);
}

#[tokio::test]
async fn test_exhausted_ticks_do_not_stop_the_loop() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_millis(100));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FixedSource));

    let reached = wait_for_stats(&handle, 3000, |stats| stats.exhausted >= 2).await;
    assert!(reached, "reporter should keep ticking after failed deliveries");

    handle.shutdown().await.unwrap();
    let stats = task.await.unwrap();

    assert_eq!(stats.attempts, stats.exhausted * 3);
}

#[tokio::test]
async fn test_shutdown_while_idle_is_prompt() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(3600));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FixedSource));

    // first tick runs at startup, then the reporter idles for an hour
    let reached = wait_for_stats(&handle, 2000, |stats| stats.ticks == 1).await;
    assert!(reached);

    let started = Instant::now();
    handle.shutdown().await.unwrap();
    let stats = tokio::time::timeout(Duration::from_millis(500), task)
        .await
        .expect("idle reporter should stop right away")
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(stats.delivered, 1);
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_delivery() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_secs(3600));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FixedSource));

    let in_flight = wait_for_requests(&mock_server, 1, 2000).await;
    assert!(in_flight);

    handle.shutdown().await.unwrap();
    let stats = task.await.unwrap();

    // the report was completed, not abandoned
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.ticks, 1);
}

#[tokio::test]
async fn test_overrunning_ticks_never_overlap() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(250)))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server, Duration::from_millis(50));
    let (handle, task) = ReporterHandle::spawn(create_test_reporter(&config, FixedSource));

    tokio::time::sleep(Duration::from_millis(1000)).await;
    handle.shutdown().await.unwrap();
    let stats = task.await.unwrap();

    // sequential 250ms deliveries fit at most five times into a second
    assert!(stats.delivered >= 2);
    assert!(stats.delivered <= 5, "ticks overlapped: {stats:?}");
}
