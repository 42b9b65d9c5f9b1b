//! Fakes shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::{
    event::{self, RunQueueEvent},
    identity::{ContainerIdentity, IdentityLookup},
    publish::{MetricPoint, MetricSink, MetricValue},
};

pub fn identity(cgroup_id: u64, container: &str, pod: &str, namespace: &str) -> ContainerIdentity {
    ContainerIdentity {
        cgroup_id,
        container_name: container.to_string(),
        pod_name: pod.to_string(),
        namespace: namespace.to_string(),
    }
}

pub fn record(prev_cgroup_id: u64, cgroup_id: u64, runq_latency_ns: u64) -> Vec<u8> {
    event::encode(&RunQueueEvent {
        prev_cgroup_id,
        cgroup_id,
        runq_latency_ns,
        timestamp_ns: 1,
    })
    .to_vec()
}

/// In-memory lookup that counts calls.
#[derive(Default)]
pub struct FakeLookup {
    known: Mutex<HashMap<u64, ContainerIdentity>>,
    delay: Option<Duration>,
    pub failing: AtomicBool,
    pub lookups: AtomicUsize,
    pub snapshots: AtomicUsize,
}

impl FakeLookup {
    pub fn with(identities: impl IntoIterator<Item = ContainerIdentity>) -> Self {
        let lookup = Self::default();
        for identity in identities {
            lookup.insert_as(identity.cgroup_id, identity);
        }
        lookup
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert_as(&self, cgroup_id: u64, identity: ContainerIdentity) {
        self.known.lock().unwrap().insert(cgroup_id, identity);
    }

    async fn pause(&self) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityLookup for FakeLookup {
    async fn lookup(&self, cgroup_id: u64) -> Result<Option<ContainerIdentity>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        Ok(self.known.lock().unwrap().get(&cgroup_id).cloned())
    }

    async fn snapshot(&self) -> Result<Vec<ContainerIdentity>> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        Ok(self.known.lock().unwrap().values().cloned().collect())
    }
}

/// Sink that keeps every point, optionally rejecting latency points.
#[derive(Default)]
pub struct RecordingSink {
    pub points: Mutex<Vec<MetricPoint>>,
    pub reject_latency: AtomicBool,
}

impl RecordingSink {
    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricSink for RecordingSink {
    async fn publish(&self, point: MetricPoint) -> Result<()> {
        if self.reject_latency.load(Ordering::SeqCst)
            && matches!(point.value, MetricValue::Double(_))
        {
            return Err(anyhow!("quota exceeded"));
        }
        self.points.lock().unwrap().push(point);
        Ok(())
    }
}

pub fn recording_sink() -> Arc<RecordingSink> {
    Arc::new(RecordingSink::default())
}
