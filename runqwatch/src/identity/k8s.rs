//! Kubernetes identity backend.
//!
//! Joins two views:
//! 1. The cgroup tree: cgroup id → scope directory → container id
//! 2. A pod watcher restricted to this node: container id → pod metadata
//!
//! Pod deletions evict the matching identities from the resolver cache.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, runtime::watcher};
use log::{debug, error, info, warn};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{ContainerIdentity, IdentityCache, IdentityLookup, cgroupfs::CgroupScanner};

/// Pod metadata for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMeta {
    pub container_name: String,
    pub pod_name: String,
    pub namespace: String,
}

/// Identity lookup fed by the Kubernetes API.
pub struct KubeLookup {
    scanner: CgroupScanner,
    /// container_id (short 12-char prefix) → metadata.
    /// Populated and updated by the watcher task.
    pod_store: RwLock<HashMap<String, Arc<ContainerMeta>>>,
    cache: Option<Arc<IdentityCache>>,
    /// Flips to true once the watcher has listed every pod on the node.
    synced: watch::Sender<bool>,
}

impl KubeLookup {
    pub fn new(scanner: CgroupScanner) -> Self {
        Self {
            scanner,
            pod_store: RwLock::new(HashMap::new()),
            cache: None,
            synced: watch::Sender::new(false),
        }
    }

    /// Evict entries from `cache` when their pod is deleted.
    pub fn with_cache(mut self, cache: Arc<IdentityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn known_containers(&self) -> usize {
        self.pod_store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Wait until the initial pod listing is in the store. Returns false if
    /// `timeout` elapses first.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        )
    }

    /// Start the pod watcher background task.
    ///
    /// Watches pods on `node_name` and keeps the pod store updated until
    /// `cancel` fires.
    pub async fn start_watcher(
        self: &Arc<Self>,
        node_name: String,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let client = Client::try_default()
            .await
            .context("Failed to create K8s client (not running in cluster?)")?;

        // Pods are namespaced; Api::all() gives visibility across namespaces
        let api: Api<Pod> = Api::all(client);
        let watcher_config = watcher::Config {
            field_selector: Some(format!("spec.nodeName={}", node_name)),
            ..Default::default()
        };

        let lookup = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let stream = watcher(api, watcher_config);
            tokio::pin!(stream);

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("K8s pod watcher stopped");
                        return;
                    }
                    event = stream.next() => event,
                };

                match event {
                    Some(Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                        lookup.apply_pod_event(&pod, false);
                    }
                    Some(Ok(watcher::Event::Delete(pod))) => {
                        lookup.apply_pod_event(&pod, true);
                    }
                    Some(Ok(watcher::Event::Init)) => {}
                    Some(Ok(watcher::Event::InitDone)) => {
                        lookup.mark_synced();
                        info!(
                            "K8s pod watcher synced, {} containers known",
                            lookup.known_containers()
                        );
                    }
                    Some(Err(e)) => {
                        // kube's watcher retries with backoff
                        warn!("K8s pod watcher error: {}. Will retry.", e);
                    }
                    None => break,
                }
            }

            warn!("K8s pod watcher stream ended");
        });

        Ok(handle)
    }

    /// Log the watcher task's exit. A panic there would otherwise leave the
    /// pod store frozen without a trace.
    pub fn supervise(handle: JoinHandle<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                error!("K8s pod watcher panicked, pod metadata is no longer updated: {}", e);
            }
        })
    }

    /// Process a pod event from the watcher.
    fn apply_pod_event(&self, pod: &Pod, is_delete: bool) {
        let metadata = &pod.metadata;
        let Some(pod_name) = metadata.name.clone() else {
            return;
        };
        let namespace = metadata.namespace.clone().unwrap_or_default();
        let mut store = self.pod_store.write().unwrap_or_else(PoisonError::into_inner);
        // Restarted containers get new ids; drop whatever the pod had before.
        store.retain(|_, meta| meta.pod_name != pod_name || meta.namespace != namespace);

        if is_delete {
            drop(store);
            if let Some(cache) = &self.cache {
                cache.retain(|identity| {
                    identity.pod_name != pod_name || identity.namespace != namespace
                });
            }
            debug!("Pod {}/{} deleted", namespace, pod_name);
        } else {
            for (cid, container_name) in extract_containers_from_pod(pod) {
                store.insert(
                    cid,
                    Arc::new(ContainerMeta {
                        container_name,
                        pod_name: pod_name.clone(),
                        namespace: namespace.clone(),
                    }),
                );
            }
        }
    }

    fn identity_for(&self, cgroup_id: u64, cgroup_dir: &Path) -> Option<ContainerIdentity> {
        let container_id = container_id_from_path(cgroup_dir)?;
        let store = self.pod_store.read().unwrap_or_else(PoisonError::into_inner);
        store.get(&container_id).map(|meta| ContainerIdentity {
            cgroup_id,
            container_name: meta.container_name.clone(),
            pod_name: meta.pod_name.clone(),
            namespace: meta.namespace.clone(),
        })
    }
}

#[async_trait]
impl IdentityLookup for KubeLookup {
    async fn lookup(&self, cgroup_id: u64) -> Result<Option<ContainerIdentity>> {
        let scanner = self.scanner.clone();
        let path = tokio::task::spawn_blocking(move || scanner.find(cgroup_id))
            .await
            .context("cgroup scan task failed")??;

        Ok(path.and_then(|path| self.identity_for(cgroup_id, &path)))
    }

    async fn snapshot(&self) -> Result<Vec<ContainerIdentity>> {
        let scanner = self.scanner.clone();
        let cgroups = tokio::task::spawn_blocking(move || scanner.scan_all())
            .await
            .context("cgroup scan task failed")??;

        Ok(cgroups
            .into_iter()
            .filter_map(|(cgroup_id, path)| self.identity_for(cgroup_id, &path))
            .collect())
    }
}

/// (short container id, container name) pairs from a pod's status.
fn extract_containers_from_pod(pod: &Pod) -> Vec<(String, String)> {
    let mut containers = Vec::new();

    if let Some(status) = &pod.status {
        for statuses in [&status.container_statuses, &status.init_container_statuses]
            .into_iter()
            .flatten()
        {
            for cs in statuses {
                if let Some(cid) = &cs.container_id {
                    // Format: "containerd://<64hex>" or "docker://<64hex>"
                    if let Some(hex_id) = cid.rsplit("://").next()
                        && let Some(short) = hex_id.get(..12)
                        && short.chars().all(|c| c.is_ascii_hexdigit())
                    {
                        containers.push((short.to_string(), cs.name.clone()));
                    }
                }
            }
        }
    }

    containers
}

/// Extract a container id from a cgroup directory name.
///
/// Handles `cri-containerd-<id>.scope`, `docker-<id>.scope`,
/// `crio-<id>.scope` and a bare 64-hex segment. Returns the first 12
/// characters.
fn container_id_from_path(path: &Path) -> Option<String> {
    let segment = path.file_name()?.to_str()?;

    if let Some(inner) = segment.strip_suffix(".scope")
        && let Some(hex_id) = inner.rsplit('-').next()
        && is_container_id(hex_id)
    {
        return Some(hex_id[..12].to_string());
    }

    if is_container_id(segment) {
        return Some(segment[..12].to_string());
    }

    None
}

/// Check if a string looks like a 64-char hex container ID.
fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const HEX_ID: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2";
    const HEX_ID_OTHER: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn pod(name: &str, namespace: &str, containers: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|(container, id)| ContainerStatus {
                            name: container.to_string(),
                            container_id: Some(format!("containerd://{}", id)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn scope_fixture(cgroup_id: u64) -> TempDir {
        let tmp = TempDir::new().unwrap();
        let scope = tmp.path().join(format!(
            "kubepods.slice/kubepods-pod1.slice/cri-containerd-{}.scope",
            HEX_ID
        ));
        fs::create_dir_all(&scope).unwrap();
        fs::write(scope.join("cgroup.id"), cgroup_id.to_string()).unwrap();
        tmp
    }

    #[test]
    fn test_container_id_containerd_scope() {
        let path = PathBuf::from(format!("/x/cri-containerd-{}.scope", HEX_ID));
        assert_eq!(container_id_from_path(&path), Some("a1b2c3d4e5f6".to_string()));
    }

    #[test]
    fn test_container_id_docker_and_crio_scope() {
        for prefix in ["docker", "crio"] {
            let path = PathBuf::from(format!("/x/{}-{}.scope", prefix, HEX_ID));
            assert_eq!(container_id_from_path(&path), Some("a1b2c3d4e5f6".to_string()));
        }
    }

    #[test]
    fn test_container_id_plain_segment() {
        let path = PathBuf::from(format!("/kubepods/besteffort/podabc/{}", HEX_ID));
        assert_eq!(container_id_from_path(&path), Some("a1b2c3d4e5f6".to_string()));
    }

    #[test]
    fn test_container_id_non_container() {
        assert_eq!(container_id_from_path(Path::new("/user.slice/session-1.scope")), None);
        assert_eq!(container_id_from_path(Path::new("/")), None);
    }

    #[test]
    fn test_extract_containers_from_pod() {
        let pod = pod("web-0", "shop", &[("nginx", HEX_ID), ("short", "abc")]);
        assert_eq!(
            extract_containers_from_pod(&pod),
            vec![("a1b2c3d4e5f6".to_string(), "nginx".to_string())]
        );
    }

    #[test]
    fn test_extract_containers_skips_malformed_ids() {
        let pod = pod(
            "web-0",
            "shop",
            &[("accented", "abcdefghijkéxyz"), ("mixed", "a1b2c3d4e5féa1b2")],
        );
        assert!(extract_containers_from_pod(&pod).is_empty());
    }

    #[test]
    fn test_pod_update_replaces_restarted_containers() {
        const NEW_ID: &str = "ffffeeeeddddccccbbbbaaaa99998888777766665555444433332222111100ff";
        let lookup = KubeLookup::new(CgroupScanner::with_root(PathBuf::from("/nonexistent")));

        lookup.apply_pod_event(&pod("web-0", "shop", &[("nginx", HEX_ID)]), false);
        lookup.apply_pod_event(&pod("api-0", "shop", &[("api", HEX_ID_OTHER)]), false);
        lookup.apply_pod_event(&pod("web-0", "shop", &[("nginx", NEW_ID)]), false);

        let store = lookup.pod_store.read().unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.contains_key("a1b2c3d4e5f6"));
        assert_eq!(store["ffffeeeedddd"].pod_name, "web-0");
        assert_eq!(store["0123456789ab"].pod_name, "api-0");
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let lookup = KubeLookup::new(CgroupScanner::with_root(PathBuf::from("/nonexistent")));
        assert!(!lookup.wait_synced(Duration::from_millis(10)).await);

        lookup.mark_synced();
        assert!(lookup.wait_synced(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_supervise_survives_watcher_panic() {
        let watcher = tokio::spawn(async { panic!("watcher blew up") });
        KubeLookup::supervise(watcher).await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_joins_scope_and_pod() {
        let tmp = scope_fixture(3003);
        let lookup = KubeLookup::new(CgroupScanner::with_root(tmp.path().to_path_buf()));

        assert!(lookup.lookup(3003).await.unwrap().is_none());

        lookup.apply_pod_event(&pod("web-0", "shop", &[("nginx", HEX_ID)]), false);
        let identity = lookup.lookup(3003).await.unwrap().unwrap();
        assert_eq!(identity.container_name, "nginx");
        assert_eq!(identity.pod_name, "web-0");
        assert_eq!(identity.namespace, "shop");

        let snapshot = lookup.snapshot().await.unwrap();
        assert_eq!(snapshot, vec![identity]);
    }

    #[test]
    fn test_pod_delete_evicts_cache() {
        let tmp = scope_fixture(3003);
        let cache = Arc::new(IdentityCache::new());
        let lookup = KubeLookup::new(CgroupScanner::with_root(tmp.path().to_path_buf()))
            .with_cache(Arc::clone(&cache));
        let web = pod("web-0", "shop", &[("nginx", HEX_ID)]);

        lookup.apply_pod_event(&web, false);
        cache.insert(ContainerIdentity {
            cgroup_id: 3003,
            container_name: "nginx".into(),
            pod_name: "web-0".into(),
            namespace: "shop".into(),
        });
        assert_eq!(lookup.known_containers(), 1);

        lookup.apply_pod_event(&web, true);
        assert_eq!(lookup.known_containers(), 0);
        assert!(cache.is_empty());
    }
}
