//! OTLP export against a local gRPC collector

use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::metrics::v1::{metric, number_data_point, AggregationTemporality};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

use meterd::config::TelemetryConfig;
use meterd::metrics::{KeyValue, MetricsPipeline};

#[derive(Clone, Default)]
struct FakeCollector {
    requests: Arc<Mutex<Vec<ExportMetricsServiceRequest>>>,
}

#[tonic::async_trait]
impl MetricsService for FakeCollector {
    async fn export(
        &self,
        request: tonic::Request<ExportMetricsServiceRequest>,
    ) -> Result<tonic::Response<ExportMetricsServiceResponse>, tonic::Status> {
        self.requests.lock().push(request.into_inner());
        Ok(tonic::Response::new(ExportMetricsServiceResponse {
            partial_success: None,
        }))
    }
}

async fn spawn_collector() -> (SocketAddr, FakeCollector) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let collector = FakeCollector::default();

    let service = MetricsServiceServer::new(collector.clone());
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
    });
    (addr, collector)
}

fn telemetry_config(addr: SocketAddr) -> TelemetryConfig {
    TelemetryConfig {
        endpoint: addr.to_string(),
        service_name: "meterd-test".to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_export_reaches_collector() {
    let (addr, collector) = spawn_collector().await;
    let pipeline = MetricsPipeline::connect(&telemetry_config(addr)).await.unwrap();

    let attrs = [KeyValue::new("http.route", "/")];
    pipeline.counter("http_requests_total").unwrap().add(5, &attrs).unwrap();
    pipeline.force_flush().await.unwrap();

    let requests = collector.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    let resource_metrics = &requests[0].resource_metrics[0];

    let service_name = resource_metrics
        .resource
        .as_ref()
        .unwrap()
        .attributes
        .iter()
        .find(|kv| kv.key == "service.name")
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| v.value.clone());
    assert_eq!(
        service_name,
        Some(any_value::Value::StringValue("meterd-test".to_string()))
    );

    let metric = &resource_metrics.scope_metrics[0].metrics[0];
    assert_eq!(metric.name, "http_requests_total");
    let Some(metric::Data::Sum(sum)) = &metric.data else {
        panic!("expected sum, got {:?}", metric.data);
    };
    assert!(sum.is_monotonic);
    assert_eq!(sum.aggregation_temporality, AggregationTemporality::Delta as i32);
    assert_eq!(
        sum.data_points[0].value,
        Some(number_data_point::Value::AsInt(5))
    );

    pipeline.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_delivers_final_batch() {
    let (addr, collector) = spawn_collector().await;
    let pipeline = MetricsPipeline::connect(&telemetry_config(addr)).await.unwrap();

    let histogram = pipeline.histogram("request_duration_seconds").unwrap();
    histogram.record(0.02, &[]).unwrap();
    histogram.record(0.4, &[]).unwrap();

    pipeline.shutdown(Duration::from_secs(2)).await.unwrap();

    let requests = collector.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    let metric = &requests[0].resource_metrics[0].scope_metrics[0].metrics[0];
    let Some(metric::Data::Histogram(hist)) = &metric.data else {
        panic!("expected histogram, got {:?}", metric.data);
    };
    assert_eq!(hist.data_points[0].count, 2);
}
