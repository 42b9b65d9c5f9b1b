use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use log::debug;
use runqwatch_common::EVENTS_MAP;
use serde::Deserialize;

use crate::{
    collector::{CollectorConfig, DEFAULT_COLLECTION_INTERVAL, DEFAULT_MAX_EVENTS_PER_DRAIN},
    identity::{DEFAULT_LOOKUP_TIMEOUT, IdentityBackend, LookupStrategy},
    publish::{DEFAULT_METRIC_PREFIX, DEFAULT_PUBLISH_TIMEOUT, ResourceContext},
};

const DEFAULT_PROBE_OBJECT: &str = "/usr/lib/runqwatch/runqwatch.bpf.o";
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Collection cadence
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorSettings {
    pub interval_secs: Option<u64>,
    pub max_events_per_drain: Option<usize>,
    pub publish_timeout_ms: Option<u64>,
}

/// Identity resolution
#[derive(Debug, Deserialize, Clone, Default)]
pub struct IdentitySettings {
    pub backend: Option<IdentityBackend>,
    pub strategy: Option<LookupStrategy>,
    pub cgroup_root: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub lookup_timeout_ms: Option<u64>,
    pub warm_on_start: Option<bool>,
}

/// Where this node sits
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResourceSettings {
    pub cluster_name: Option<String>,
    pub location: Option<String>,
    pub node_name: Option<String>,
    pub project_id: Option<String>,
}

/// Prebuilt BPF object to load
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProbeSettings {
    pub object_path: Option<String>,
    pub events_map: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub metric_prefix: Option<String>,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub identity: IdentitySettings,
    #[serde(default)]
    pub resource: ResourceSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(Environment::default().separator("__").try_parsing(true))
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn metric_prefix(&self) -> &str {
        self.metric_prefix
            .as_deref()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or(DEFAULT_METRIC_PREFIX)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            interval: self
                .collector
                .interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COLLECTION_INTERVAL),
            max_events_per_drain: self
                .collector
                .max_events_per_drain
                .filter(|max| *max > 0)
                .unwrap_or(DEFAULT_MAX_EVENTS_PER_DRAIN),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        self.collector
            .publish_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PUBLISH_TIMEOUT)
    }

    pub fn identity_backend(&self) -> IdentityBackend {
        self.identity.backend.unwrap_or_default()
    }

    pub fn lookup_strategy(&self) -> LookupStrategy {
        self.identity.strategy.unwrap_or_default()
    }

    pub fn cgroup_root(&self) -> PathBuf {
        PathBuf::from(
            self.identity
                .cgroup_root
                .as_deref()
                .unwrap_or(DEFAULT_CGROUP_ROOT),
        )
    }

    /// None keeps identities until they are invalidated.
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.identity
            .cache_ttl_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.identity
            .lookup_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOOKUP_TIMEOUT)
    }

    /// Prefill the identity cache at startup. On by default for the
    /// snapshot strategy.
    pub fn warm_on_start(&self) -> bool {
        self.identity
            .warm_on_start
            .unwrap_or(self.lookup_strategy() == LookupStrategy::Snapshot)
    }

    pub fn resource_context(&self) -> ResourceContext {
        ResourceContext::detect(
            self.resource.cluster_name.clone().unwrap_or_default(),
            self.resource.location.clone().unwrap_or_default(),
            self.resource.node_name.clone(),
            self.resource.project_id.clone(),
        )
    }

    pub fn probe_object_path(&self) -> PathBuf {
        PathBuf::from(
            self.probe
                .object_path
                .as_deref()
                .unwrap_or(DEFAULT_PROBE_OBJECT),
        )
    }

    pub fn events_map(&self) -> &str {
        self.probe.events_map.as_deref().unwrap_or(EVENTS_MAP)
    }
}
