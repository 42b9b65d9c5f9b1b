//! Container identity resolution keyed by cgroup id.
//!
//! [`IdentityResolver`] answers from an [`IdentityCache`] and falls back to a
//! slower [`IdentityLookup`] backend on a miss:
//! 1. Cache hit: return without I/O
//! 2. Miss: one lookup per cgroup id in flight, bounded by a timeout
//! 3. Success: insert (last writer wins) and return
//! 4. Failure: return the error, cache nothing

pub mod cgroupfs;
#[cfg(feature = "k8s")]
pub mod k8s;

use std::{
    collections::HashMap,
    future::Future,
    path::Path,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ResolveError;

/// Default bound on a single backend call.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long startup waits for the pod watcher's initial listing.
#[cfg(feature = "k8s")]
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Who owns a cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub cgroup_id: u64,
    pub container_name: String,
    pub pod_name: String,
    pub namespace: String,
}

/// Backend that discovers identities. May be slow and may fail.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Resolve one cgroup id. `Ok(None)` means the backend knows of no such
    /// container.
    async fn lookup(&self, cgroup_id: u64) -> Result<Option<ContainerIdentity>>;

    /// Every container the backend currently knows about.
    async fn snapshot(&self) -> Result<Vec<ContainerIdentity>> {
        Err(anyhow!("identity backend does not support snapshots"))
    }
}

/// How a cache miss is served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStrategy {
    /// Ask the backend for the missing id only.
    #[default]
    PerId,
    /// Refresh the whole snapshot, then re-check the cache.
    Snapshot,
}

/// Identity backends shipped with the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum IdentityBackend {
    /// Annotation files under the kubepods cgroup hierarchy.
    #[default]
    #[serde(rename = "cgroupfs")]
    CgroupFs,
    /// Pod watcher on the Kubernetes API joined with cgroup scope names.
    #[serde(rename = "kubernetes")]
    Kubernetes,
}

/// Build the configured backend.
///
/// The Kubernetes backend starts its pod watcher here; it runs until `cancel`
/// fires.
pub async fn connect(
    backend: IdentityBackend,
    cgroup_root: &Path,
    node_name: &str,
    cache: &Arc<IdentityCache>,
    cancel: CancellationToken,
) -> Result<Arc<dyn IdentityLookup>> {
    match backend {
        IdentityBackend::CgroupFs => {
            info!(
                "Using cgroupfs identity backend at {}",
                cgroup_root.display()
            );
            Ok(Arc::new(cgroupfs::CgroupFsLookup::with_root(
                cgroup_root.to_path_buf(),
            )))
        }
        #[cfg(feature = "k8s")]
        IdentityBackend::Kubernetes => {
            info!("Using Kubernetes identity backend for node {}", node_name);
            let lookup = Arc::new(
                k8s::KubeLookup::new(cgroupfs::CgroupScanner::with_root(
                    cgroup_root.to_path_buf(),
                ))
                .with_cache(Arc::clone(cache)),
            );
            let watcher = lookup.start_watcher(node_name.to_string(), cancel).await?;
            k8s::KubeLookup::supervise(watcher);
            if !lookup.wait_synced(INITIAL_SYNC_TIMEOUT).await {
                log::warn!(
                    "K8s pod watcher not synced after {:?}, starting with a partial pod view",
                    INITIAL_SYNC_TIMEOUT
                );
            }
            Ok(lookup)
        }
        #[cfg(not(feature = "k8s"))]
        IdentityBackend::Kubernetes => {
            let _ = (node_name, cache, cancel);
            Err(anyhow!(
                "kubernetes identity backend requires the `k8s` feature"
            ))
        }
    }
}

struct CacheEntry {
    identity: Arc<ContainerIdentity>,
    inserted_at: Instant,
}

/// Thread-safe cgroup id → identity map, optionally with a TTL.
///
/// Without a TTL entries live until replaced or removed.
pub struct IdentityCache {
    entries: RwLock<HashMap<u64, CacheEntry>>,
    ttl: Option<Duration>,
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::with_ttl(None)
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a live entry. Expired entries read as absent.
    pub fn get(&self, cgroup_id: u64) -> Option<Arc<ContainerIdentity>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&cgroup_id)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| Arc::clone(&entry.identity))
    }

    /// Insert or replace the entry keyed by `identity.cgroup_id`.
    pub fn insert(&self, identity: ContainerIdentity) -> Arc<ContainerIdentity> {
        let identity = Arc::new(identity);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            identity.cgroup_id,
            CacheEntry {
                identity: Arc::clone(&identity),
                inserted_at: Instant::now(),
            },
        );
        identity
    }

    pub fn remove(&self, cgroup_id: u64) -> Option<Arc<ContainerIdentity>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&cgroup_id).map(|entry| entry.identity)
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&ContainerIdentity) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| keep(&entry.identity));
    }

    /// Drop expired entries, returning how many went away.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Cache-fronted identity resolution.
pub struct IdentityResolver {
    cache: Arc<IdentityCache>,
    lookup: Arc<dyn IdentityLookup>,
    strategy: LookupStrategy,
    timeout: Duration,
    in_flight: Mutex<HashMap<u64, Gate>>,
}

impl IdentityResolver {
    pub fn new(lookup: Arc<dyn IdentityLookup>, cache: Arc<IdentityCache>) -> Self {
        Self {
            cache,
            lookup,
            strategy: LookupStrategy::default(),
            timeout: DEFAULT_LOOKUP_TIMEOUT,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_strategy(mut self, strategy: LookupStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Resolve a cgroup id to its container identity.
    ///
    /// Concurrent misses for the same id share one backend call; the others
    /// wait and then read the cache. Failures are never cached, so the next
    /// call for the id goes to the backend again.
    pub async fn resolve(&self, cgroup_id: u64) -> Result<Arc<ContainerIdentity>, ResolveError> {
        if let Some(hit) = self.cache.get(cgroup_id) {
            return Ok(hit);
        }

        let gate = self.gate_for(cgroup_id);
        let result = {
            let _leader = gate.lock().await;
            match self.cache.get(cgroup_id) {
                Some(hit) => Ok(hit),
                None => self.lookup_uncached(cgroup_id).await,
            }
        };
        self.release_gate(cgroup_id, &gate);
        result
    }

    /// Fill the cache from one backend snapshot.
    pub async fn warm(&self) -> Result<usize> {
        let identities = self.bounded(self.lookup.snapshot()).await?;
        Ok(self.fill(identities))
    }

    /// Forget a cgroup id, e.g. after its container went away.
    pub fn invalidate(&self, cgroup_id: u64) -> Option<Arc<ContainerIdentity>> {
        self.cache.remove(cgroup_id)
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    async fn lookup_uncached(
        &self,
        cgroup_id: u64,
    ) -> Result<Arc<ContainerIdentity>, ResolveError> {
        match self.strategy {
            LookupStrategy::PerId => {
                let found = self
                    .bounded(self.lookup.lookup(cgroup_id))
                    .await
                    .map_err(|cause| ResolveError::Lookup { cgroup_id, cause })?;
                match found {
                    Some(identity) => Ok(self.cache.insert(ContainerIdentity {
                        cgroup_id,
                        ..identity
                    })),
                    None => Err(ResolveError::NotFound { cgroup_id }),
                }
            }
            LookupStrategy::Snapshot => {
                let identities = self
                    .bounded(self.lookup.snapshot())
                    .await
                    .map_err(|cause| ResolveError::Lookup { cgroup_id, cause })?;
                let refreshed = self.fill(identities);
                debug!(
                    "Identity snapshot refreshed {} entries (miss on cgroup {})",
                    refreshed, cgroup_id
                );
                self.cache
                    .get(cgroup_id)
                    .ok_or(ResolveError::NotFound { cgroup_id })
            }
        }
    }

    fn fill(&self, identities: Vec<ContainerIdentity>) -> usize {
        let count = identities.len();
        for identity in identities {
            self.cache.insert(identity);
        }
        count
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| anyhow!("identity backend timed out after {:?}", self.timeout))?
    }

    fn gate_for(&self, cgroup_id: u64) -> Gate {
        let mut gates = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(cgroup_id).or_default())
    }

    fn release_gate(&self, cgroup_id: u64, gate: &Gate) {
        let mut gates = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and this caller hold the last two references
        if gates
            .get(&cgroup_id)
            .is_some_and(|current| Arc::ptr_eq(current, gate) && Arc::strong_count(gate) <= 2)
        {
            gates.remove(&cgroup_id);
        }
    }
}
