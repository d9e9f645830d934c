//! Per-request metric recording
//!
//! Every request that enters the middleware is recorded exactly once: on
//! completion with its response status, or with 499 if the request future
//! is dropped first.

use axum::extract::{MatchedPath, Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Instant;

use crate::error::PipelineError;
use crate::metrics::{
    Counter, Histogram, InstrumentDescriptor, KeyValue, MetricsPipeline, DEFAULT_LATENCY_BOUNDS,
};

pub const REQUEST_COUNTER: &str = "http_requests_total";
pub const REQUEST_DURATION: &str = "request_duration_seconds";

/// Route tag for requests that matched no route
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Status recorded when the client disconnects before the response
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Request instruments shared by all handlers
#[derive(Clone)]
pub struct HttpMetrics {
    requests: Counter,
    duration: Histogram,
}

impl HttpMetrics {
    pub fn new(pipeline: &MetricsPipeline) -> Result<Self, PipelineError> {
        Ok(Self {
            requests: pipeline.counter_with(
                InstrumentDescriptor::new(REQUEST_COUNTER)
                    .with_unit("{request}")
                    .with_description("Total HTTP requests handled"),
            )?,
            duration: pipeline.histogram_with(
                InstrumentDescriptor::new(REQUEST_DURATION)
                    .with_unit("s")
                    .with_description("HTTP request latency")
                    .with_boundaries(DEFAULT_LATENCY_BOUNDS.to_vec()),
            )?,
        })
    }
}

/// Middleware recording one counter increment and one latency sample
pub async fn track_requests(
    State(metrics): State<HttpMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_owned());

    let record = RequestRecord {
        metrics,
        method: method_tag(request.method()),
        route,
        started: Instant::now(),
        done: false,
    };

    let response = next.run(request).await;
    record.finish(response.status().as_u16());
    response
}

/// Standard methods keep their name; anything else collapses to `_OTHER`
fn method_tag(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::CONNECT => "CONNECT",
        Method::OPTIONS => "OPTIONS",
        Method::TRACE => "TRACE",
        Method::PATCH => "PATCH",
        _ => "_OTHER",
    }
}

struct RequestRecord {
    metrics: HttpMetrics,
    method: &'static str,
    route: String,
    started: Instant,
    done: bool,
}

impl RequestRecord {
    fn finish(mut self, status: u16) {
        self.record(status);
    }

    fn record(&mut self, status: u16) {
        if self.done {
            return;
        }
        self.done = true;

        let attrs = [
            KeyValue::new("http.request.method", self.method),
            KeyValue::new("http.route", std::mem::take(&mut self.route)),
            KeyValue::new("http.response.status_code", i64::from(status)),
        ];
        let elapsed = self.started.elapsed().as_secs_f64();

        // Failures are already counted as dropped samples by the pipeline
        let _ = self.metrics.requests.add(1, &attrs);
        let _ = self.metrics.duration.record(elapsed, &attrs);
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        self.record(CLIENT_CLOSED_REQUEST);
    }
}
