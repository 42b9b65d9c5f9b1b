//! Conversion of attributed events into metric points.
//!
//! Every event becomes two independent points: the run queue latency in
//! milliseconds and a preemption count of one tagged with its category.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::info;
use serde::Serialize;

use crate::{
    classify::PreemptionCategory,
    error::PublishError,
    event::RunQueueEvent,
    identity::ContainerIdentity,
};

pub const DEFAULT_METRIC_PREFIX: &str = "runqwatch";
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

const LATENCY_SUFFIX: &str = "runq/latency";
const PREEMPTION_SUFFIX: &str = "sched/switch/out";
const NS_PER_MS: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Double(f64),
    Int(i64),
}

/// One sample handed to a [`MetricSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub metric_type: String,
    pub labels: BTreeMap<String, String>,
    pub resource_labels: BTreeMap<String, String>,
    pub value: MetricValue,
    pub timestamp: SystemTime,
}

impl MetricPoint {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn resource_label(&self, key: &str) -> Option<&str> {
        self.resource_labels.get(key).map(String::as_str)
    }
}

/// Backend that accepts metric points.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn publish(&self, point: MetricPoint) -> Result<()>;
}

/// Where this agent runs. Captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceContext {
    pub project_id: Option<String>,
    pub cluster_name: String,
    pub location: String,
    pub node_name: String,
}

impl ResourceContext {
    /// Build the context, filling a missing node name from `NODE_NAME` and
    /// then the host name.
    pub fn detect(
        cluster_name: String,
        location: String,
        node_name: Option<String>,
        project_id: Option<String>,
    ) -> Self {
        let node_name = node_name
            .filter(|name| !name.is_empty())
            .or_else(|| std::env::var("NODE_NAME").ok().filter(|name| !name.is_empty()))
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|name| name.into_string().ok())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            project_id,
            cluster_name,
            location,
            node_name,
        }
    }
}

/// Result of publishing one event. Both points are always attempted.
#[derive(Debug)]
pub struct PublishOutcome {
    pub latency: Result<(), PublishError>,
    pub preemption: Result<(), PublishError>,
}

impl PublishOutcome {
    pub fn published(&self) -> usize {
        usize::from(self.latency.is_ok()) + usize::from(self.preemption.is_ok())
    }

    pub fn into_errors(self) -> impl Iterator<Item = PublishError> {
        [self.latency.err(), self.preemption.err()]
            .into_iter()
            .flatten()
    }
}

pub struct MetricPublisher {
    sink: Arc<dyn MetricSink>,
    resource: Arc<ResourceContext>,
    latency_metric: String,
    preemption_metric: String,
    timeout: Duration,
}

impl MetricPublisher {
    pub fn new(sink: Arc<dyn MetricSink>, resource: Arc<ResourceContext>) -> Self {
        Self {
            sink,
            resource,
            latency_metric: format!("{}/{}", DEFAULT_METRIC_PREFIX, LATENCY_SUFFIX),
            preemption_metric: format!("{}/{}", DEFAULT_METRIC_PREFIX, PREEMPTION_SUFFIX),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        self.latency_metric = format!("{}/{}", prefix, LATENCY_SUFFIX);
        self.preemption_metric = format!("{}/{}", prefix, PREEMPTION_SUFFIX);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn latency_metric(&self) -> &str {
        &self.latency_metric
    }

    pub fn preemption_metric(&self) -> &str {
        &self.preemption_metric
    }

    /// Publish the latency point, then the preemption point. A failure of
    /// the first does not skip the second.
    pub async fn publish_event(
        &self,
        event: &RunQueueEvent,
        identity: &ContainerIdentity,
        category: PreemptionCategory,
    ) -> PublishOutcome {
        let now = SystemTime::now();
        let latency = self.send(self.latency_point(event, identity, now)).await;
        let preemption = self
            .send(self.preemption_point(identity, category, now))
            .await;
        PublishOutcome {
            latency,
            preemption,
        }
    }

    pub fn latency_point(
        &self,
        event: &RunQueueEvent,
        identity: &ContainerIdentity,
        timestamp: SystemTime,
    ) -> MetricPoint {
        MetricPoint {
            metric_type: self.latency_metric.clone(),
            labels: identity_labels(identity),
            resource_labels: self.resource_labels(identity),
            value: MetricValue::Double(event.runq_latency_ns as f64 / NS_PER_MS),
            timestamp,
        }
    }

    pub fn preemption_point(
        &self,
        identity: &ContainerIdentity,
        category: PreemptionCategory,
        timestamp: SystemTime,
    ) -> MetricPoint {
        let mut labels = identity_labels(identity);
        labels.insert("preemption_type".into(), category.as_str().into());
        MetricPoint {
            metric_type: self.preemption_metric.clone(),
            labels,
            resource_labels: self.resource_labels(identity),
            value: MetricValue::Int(1),
            timestamp,
        }
    }

    fn resource_labels(&self, identity: &ContainerIdentity) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            ("container_name".to_string(), identity.container_name.clone()),
            ("pod_name".to_string(), identity.pod_name.clone()),
            ("namespace_name".to_string(), identity.namespace.clone()),
            ("cluster_name".to_string(), self.resource.cluster_name.clone()),
            ("location".to_string(), self.resource.location.clone()),
            ("node_name".to_string(), self.resource.node_name.clone()),
        ]);
        if let Some(project_id) = &self.resource.project_id {
            labels.insert("project_id".to_string(), project_id.clone());
        }
        labels
    }

    async fn send(&self, point: MetricPoint) -> Result<(), PublishError> {
        let metric_type = point.metric_type.clone();
        let cause = match tokio::time::timeout(self.timeout, self.sink.publish(point)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => anyhow!("metric sink timed out after {:?}", self.timeout),
        };
        Err(PublishError { metric_type, cause })
    }
}

fn identity_labels(identity: &ContainerIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("container".to_string(), identity.container_name.clone()),
        ("pod".to_string(), identity.pod_name.clone()),
        ("namespace".to_string(), identity.namespace.clone()),
    ])
}

/// Writes each point as one JSON log line.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl MetricSink for LogSink {
    async fn publish(&self, point: MetricPoint) -> Result<()> {
        let line = serde_json::to_string(&point)?;
        info!("METRIC {}", line);
        Ok(())
    }
}
