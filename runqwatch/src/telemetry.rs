//! OpenTelemetry metrics export
//!
//! Ships metric points to an OpenTelemetry Collector over OTLP/gRPC.
//! Export is disabled (and the log sink used instead) when no endpoint is
//! configured.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::time::Duration;

use crate::publish::{MetricPoint, MetricSink, MetricValue, ResourceContext};

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

const SERVICE_NAME: &str = "runqwatch";

/// Normalize a configured OTLP endpoint.
///
/// Returns None when unset or empty (export disabled); adds `http://` when
/// no scheme is given.
pub fn otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = configured?.trim();
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Instruments fed by [`MetricPoint`]s.
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
struct RunqMetrics {
    runq_latency_ms: Histogram<f64>,
    sched_switch_out: Counter<u64>,
}

impl RunqMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            runq_latency_ms: meter
                .f64_histogram("runq_latency_ms")
                .with_description("Time a task spent runnable before it got a CPU")
                .with_unit("ms")
                .build(),
            sched_switch_out: meter
                .u64_counter("sched_switch_out")
                .with_description("Context switches by preemption category")
                .with_unit("events")
                .build(),
        }
    }
}

/// [`MetricSink`] backed by an OpenTelemetry meter provider.
pub struct OtelSink {
    provider: SdkMeterProvider,
    metrics: RunqMetrics,
}

impl OtelSink {
    /// Configure an OTLP/gRPC exporter for `endpoint` and register the
    /// provider globally.
    pub fn init(endpoint: &str, resource: &ResourceContext) -> Result<Self> {
        info!("Initializing OpenTelemetry metrics exporter");
        info!("OTLP endpoint: {}", endpoint);

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create OTLP metric exporter")?;

        let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
            .build();

        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(otel_resource(resource))
            .build();

        global::set_meter_provider(provider.clone());

        info!("OpenTelemetry metrics initialized successfully");
        Ok(Self::with_provider(provider))
    }

    pub fn with_provider(provider: SdkMeterProvider) -> Self {
        let meter = provider.meter(SERVICE_NAME);
        let metrics = RunqMetrics::new(&meter);
        Self { provider, metrics }
    }

    /// Flushes pending metrics and shuts down the provider.
    pub fn shutdown(&self) {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = self.provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

fn otel_resource(context: &ResourceContext) -> Resource {
    let mut attributes = vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("telemetry.sdk.language", "rust"),
        KeyValue::new("k8s.cluster.name", context.cluster_name.clone()),
        KeyValue::new("k8s.node.name", context.node_name.clone()),
        KeyValue::new("cloud.region", context.location.clone()),
    ];
    if let Some(project_id) = &context.project_id {
        attributes.push(KeyValue::new("cloud.account.id", project_id.clone()));
    }
    Resource::default().merge(&Resource::new(attributes))
}

fn attributes(point: &MetricPoint) -> Vec<KeyValue> {
    point
        .labels
        .iter()
        .chain(point.resource_labels.iter())
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl MetricSink for OtelSink {
    async fn publish(&self, point: MetricPoint) -> Result<()> {
        let attrs = attributes(&point);
        match point.value {
            MetricValue::Double(latency_ms) => {
                self.metrics.runq_latency_ms.record(latency_ms, &attrs);
            }
            MetricValue::Int(count) => {
                let count = u64::try_from(count)
                    .map_err(|_| anyhow!("negative count {} for {}", count, point.metric_type))?;
                self.metrics.sched_switch_out.add(count, &attrs);
            }
        }
        Ok(())
    }
}
