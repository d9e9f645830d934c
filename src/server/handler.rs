//! Request handlers and router assembly

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::any;
use axum::Router;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use super::instrument::{track_requests, HttpMetrics};
use crate::config::MAX_RESPONSE_DELAY_MS;

pub const HELLO_BODY: &str = "hello ... 👋👋👋\n";

#[derive(Clone)]
struct HandlerState {
    response_delay: Duration,
}

async fn hello(State(state): State<HandlerState>) -> &'static str {
    if !state.response_delay.is_zero() {
        tokio::time::sleep(state.response_delay).await;
    }
    HELLO_BODY
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Build the service router
///
/// Panics inside a handler become `500` responses before they reach the
/// metrics layer, so they are recorded like any other status.
pub fn build_router(metrics: HttpMetrics, response_delay: Duration) -> Router {
    let response_delay = response_delay.min(Duration::from_millis(MAX_RESPONSE_DELAY_MS));

    Router::new()
        .route("/", any(hello))
        .fallback(not_found)
        .with_state(HandlerState { response_delay })
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn_with_state(metrics, track_requests))
        .layer(TraceLayer::new_for_http())
}
