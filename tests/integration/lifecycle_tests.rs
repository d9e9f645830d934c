//! Service start/stop over real sockets

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use meterd::server::{HELLO_BODY, REQUEST_COUNTER, REQUEST_DURATION};
use meterd::{PipelineError, ServerError, Service};

use crate::common;

async fn wait_for_in_flight(service: &Service, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.in_flight() != expected {
        assert!(Instant::now() < deadline, "request never reached the handler");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_serve_three_requests_then_shutdown() {
    let (pipeline, exporter) = common::pipeline();
    let service = Service::start(Arc::new(common::test_config()), pipeline.clone())
        .await
        .unwrap();
    let addr = service.local_addr();

    for _ in 0..3 {
        let response = common::http_get(addr, "/").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, HELLO_BODY);
    }

    let report = service.shutdown().await;
    assert!(report.is_clean(), "{report:?}");

    // Listener no longer accepting
    assert!(TcpStream::connect(addr).await.is_err());
    // Final flush attempted and delivered, connection released
    assert!(pipeline.stats().exports_succeeded >= 1);
    assert_eq!(common::sum_u64(&exporter, REQUEST_COUNTER), 3);
    assert_eq!(common::histogram_count(&exporter, REQUEST_DURATION), 3);
    assert!(pipeline.stats().exporter_released);
}

#[tokio::test]
async fn test_drain_completes_in_flight_requests() {
    let mut config = common::test_config();
    config.server.response_delay_ms = 300;
    config.server.drain_timeout_secs = 5;

    let (pipeline, exporter) = common::pipeline();
    let service = Service::start(Arc::new(config), pipeline).await.unwrap();
    let addr = service.local_addr();

    let request = tokio::spawn(async move { common::http_get(addr, "/").await });
    wait_for_in_flight(&service, 1).await;

    let report = service.shutdown().await;
    assert!(report.is_clean(), "{report:?}");

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, HELLO_BODY);
    assert_eq!(
        common::request_points(&exporter),
        vec![("/".to_string(), "GET".to_string(), 200, 1)]
    );
}

#[tokio::test]
async fn test_drain_timeout_abandons_slow_request() {
    let mut config = common::test_config();
    config.server.response_delay_ms = 10_000;
    config.server.drain_timeout_secs = 1;

    let (pipeline, _exporter) = common::pipeline();
    let service = Service::start(Arc::new(config), pipeline.clone()).await.unwrap();
    let addr = service.local_addr();

    let request = tokio::spawn(async move { common::http_get(addr, "/").await });
    wait_for_in_flight(&service, 1).await;

    let started = Instant::now();
    let report = service.shutdown().await;
    let elapsed = started.elapsed();

    assert!(
        matches!(report.listener, Some(ServerError::DrainTimeout { abandoned: 1, .. })),
        "{report:?}"
    );
    // Drain bound plus the final flush, never the full handler delay
    assert!(elapsed < Duration::from_secs(3), "shutdown took {elapsed:?}");
    assert!(pipeline.stats().exporter_released);

    // The client is released instead of waiting out the handler
    let outcome = tokio::time::timeout(Duration::from_secs(2), request).await;
    assert!(outcome.is_ok(), "client still blocked after drain timeout");
}

#[tokio::test]
async fn test_unreachable_collector_fails_before_listening() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut config = common::test_config();
    config.server.bind_addr = format!("127.0.0.1:{port}").parse().unwrap();
    config.telemetry.endpoint = "127.0.0.1:1".to_string();
    config.telemetry.dial_timeout_secs = 2;

    let started = Instant::now();
    let err = meterd::service::run(config, std::future::pending())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(err.chain().any(|e| e.downcast_ref::<PipelineError>().is_some()), "{err:#}");
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_releases_pipeline() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = common::test_config();
    config.server.bind_addr = taken.local_addr().unwrap();

    let (pipeline, _exporter) = common::pipeline();
    let result = Service::start(Arc::new(config), pipeline.clone()).await;

    let err = result.err().unwrap();
    assert!(err.chain().any(|e| e.downcast_ref::<ServerError>().is_some()), "{err:#}");
    assert!(pipeline.is_closed());
    assert!(pipeline.stats().exporter_released);
}

#[tokio::test]
async fn test_reporter_failure_stops_listener_and_releases_pipeline() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut config = common::test_config();
    config.server.bind_addr = format!("127.0.0.1:{port}").parse().unwrap();
    config.runtime.enabled = true;

    // A counter under a reporter gauge's name makes the reporter fail after bind
    let (pipeline, _exporter) = common::pipeline();
    pipeline.counter("process.memory.usage").unwrap();

    let err = Service::start(Arc::new(config), pipeline.clone())
        .await
        .err()
        .unwrap();
    assert!(
        err.chain().any(|e| matches!(
            e.downcast_ref::<PipelineError>(),
            Some(PipelineError::InstrumentConflict { .. })
        )),
        "{err:#}"
    );
    assert!(pipeline.is_closed());
    assert!(pipeline.stats().exporter_released);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_runtime_reporter_started_with_service() {
    let mut config = common::test_config();
    config.runtime.enabled = true;

    let (pipeline, exporter) = common::pipeline();
    let service = Service::start(Arc::new(config), pipeline).await.unwrap();
    service.pipeline().force_flush().await.unwrap();

    assert!(common::last_gauge(&exporter, "process.uptime").is_some());

    assert!(service.shutdown().await.is_clean());
}
