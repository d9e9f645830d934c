//! Router and request instrumentation tests

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::middleware;
use axum::routing::get;
use axum::Router;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;

use meterd::server::{
    build_router, track_requests, HttpMetrics, HELLO_BODY, REQUEST_COUNTER, REQUEST_DURATION,
    UNMATCHED_ROUTE,
};

use crate::common;

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_hello_response() {
    let (pipeline, _) = common::pipeline();
    let app = build_router(HttpMetrics::new(&pipeline).unwrap(), Duration::ZERO);

    let response = app.oneshot(get_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], HELLO_BODY.as_bytes());
}

#[tokio::test]
async fn test_any_method_is_served_and_tagged() {
    let (pipeline, exporter) = common::pipeline();
    let app = build_router(HttpMetrics::new(&pipeline).unwrap(), Duration::ZERO);

    for method in [Method::POST, Method::from_bytes(b"PURGE").unwrap()] {
        let request = Request::builder().method(method).uri("/").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    pipeline.force_flush().await.unwrap();
    let mut methods: Vec<_> = common::request_points(&exporter)
        .into_iter()
        .map(|(_, method, _, _)| method)
        .collect();
    methods.sort();
    assert_eq!(methods, vec!["POST".to_string(), "_OTHER".to_string()]);
}

#[tokio::test]
async fn test_unknown_path_is_404_and_unmatched() {
    let (pipeline, exporter) = common::pipeline();
    let app = build_router(HttpMetrics::new(&pipeline).unwrap(), Duration::ZERO);

    let response = app.oneshot(get_request("/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    pipeline.force_flush().await.unwrap();
    assert_eq!(
        common::request_points(&exporter),
        vec![(UNMATCHED_ROUTE.to_string(), "GET".to_string(), 404, 1)]
    );
}

#[tokio::test]
async fn test_concurrent_requests_counted_exactly() {
    const N: usize = 200;
    let (pipeline, exporter) = common::pipeline();
    let app = build_router(HttpMetrics::new(&pipeline).unwrap(), Duration::ZERO);

    let tasks: Vec<_> = (0..N)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(get_request("/")).await.unwrap().status() })
        })
        .collect();
    for status in futures::future::join_all(tasks).await {
        assert_eq!(status.unwrap(), StatusCode::OK);
    }

    pipeline.force_flush().await.unwrap();
    assert_eq!(common::sum_u64(&exporter, REQUEST_COUNTER), N as u64);
    assert_eq!(common::histogram_count(&exporter, REQUEST_DURATION), N as u64);
    assert_eq!(
        common::request_points(&exporter),
        vec![("/".to_string(), "GET".to_string(), 200, N as u64)]
    );

    // Nothing new since the last flush
    app.oneshot(get_request("/")).await.unwrap();
    exporter.reset();
    pipeline.force_flush().await.unwrap();
    assert_eq!(common::histogram_count(&exporter, REQUEST_DURATION), 1);
}

async fn boom() -> &'static str {
    panic!("handler failure");
}

#[tokio::test]
async fn test_panicking_handler_recorded_as_500() {
    let (pipeline, exporter) = common::pipeline();
    let app = Router::new()
        .route("/boom", get(boom))
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn_with_state(
            HttpMetrics::new(&pipeline).unwrap(),
            track_requests,
        ));

    let response = app.oneshot(get_request("/boom")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    pipeline.force_flush().await.unwrap();
    assert_eq!(
        common::request_points(&exporter),
        vec![("/boom".to_string(), "GET".to_string(), 500, 1)]
    );
}

#[tokio::test]
async fn test_abandoned_request_recorded_once_as_499() {
    let (pipeline, exporter) = common::pipeline();
    let app = build_router(HttpMetrics::new(&pipeline).unwrap(), Duration::from_secs(5));

    let result = tokio::time::timeout(Duration::from_millis(100), app.oneshot(get_request("/"))).await;
    assert!(result.is_err());

    pipeline.force_flush().await.unwrap();
    assert_eq!(
        common::request_points(&exporter),
        vec![("/".to_string(), "GET".to_string(), 499, 1)]
    );
    assert_eq!(common::histogram_count(&exporter, REQUEST_DURATION), 1);
}

#[tokio::test]
async fn test_recording_after_pipeline_shutdown_does_not_affect_response() {
    let (pipeline, _) = common::pipeline();
    let app = build_router(HttpMetrics::new(&pipeline).unwrap(), Duration::ZERO);
    pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

    let response = app.oneshot(get_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // One counter sample and one histogram sample dropped
    assert_eq!(pipeline.stats().dropped_samples, 2);
}
