//! cgroupfs identity backend.
//!
//! Container runtimes create one cgroup directory per container under the
//! kubepods hierarchy and (with the NRI annotation plugin) mirror the pod's
//! CRI annotations into an `annotations/` directory next to it:
//!
//! ```text
//! /sys/fs/cgroup/kubepods.slice/kubepods-burstable.slice/
//!     kubepods-burstable-pod<uid>.slice/cri-containerd-<id>.scope/
//!         cgroup.id
//!         annotations/io.kubernetes.container.name
//!         annotations/io.kubernetes.pod.name
//!         annotations/io.kubernetes.pod.namespace
//! ```

use std::{
    fs,
    io::{self, ErrorKind},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, warn};

use super::{ContainerIdentity, IdentityLookup};

/// Cgroup v2 root path
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// cgroupfs and systemd driver layouts.
const KUBEPODS_DIRS: [&str; 2] = ["kubepods", "kubepods.slice"];

const CGROUP_ID_FILE: &str = "cgroup.id";
const ANNOTATIONS_DIR: &str = "annotations";
const CONTAINER_NAME_ANNOTATION: &str = "io.kubernetes.container.name";
const POD_NAME_ANNOTATION: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_ANNOTATION: &str = "io.kubernetes.pod.namespace";

/// Walks the kubepods hierarchy and maps cgroup ids to directories.
#[derive(Debug, Clone)]
pub struct CgroupScanner {
    cgroup_root: PathBuf,
}

impl Default for CgroupScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupScanner {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from(CGROUP_ROOT))
    }

    pub fn with_root(cgroup_root: PathBuf) -> Self {
        Self { cgroup_root }
    }

    pub fn root(&self) -> &Path {
        &self.cgroup_root
    }

    /// Find the directory whose cgroup id equals `cgroup_id`.
    pub fn find(&self, cgroup_id: u64) -> Result<Option<PathBuf>> {
        for top in self.kubepods_roots()? {
            for child in root_children(&top)? {
                if let Some(found) = find_in(child, cgroup_id)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    /// Every cgroup directory below the kubepods roots with its id.
    pub fn scan_all(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut results = Vec::new();
        for top in self.kubepods_roots()? {
            for child in root_children(&top)? {
                scan_directory(child, &mut results)?;
            }
        }
        Ok(results)
    }

    fn kubepods_roots(&self) -> Result<Vec<PathBuf>> {
        let roots: Vec<PathBuf> = KUBEPODS_DIRS
            .iter()
            .map(|dir| self.cgroup_root.join(dir))
            .filter(|path| path.is_dir())
            .collect();

        if roots.is_empty() {
            return Err(anyhow!(
                "no kubepods hierarchy under {}",
                self.cgroup_root.display()
            ));
        }
        Ok(roots)
    }
}

/// cgroup id of a directory: `cgroup.id` when the file exists, otherwise the
/// kernfs inode number, which is what `bpf_get_current_cgroup_id` reports on
/// cgroup v2.
pub fn cgroup_id_of(path: &Path) -> Option<u64> {
    if let Ok(content) = fs::read_to_string(path.join(CGROUP_ID_FILE)) {
        return content.trim().parse().ok();
    }
    fs::metadata(path).ok().map(|metadata| metadata.ino())
}

/// Subdirectories of `dir`, skipping annotation directories.
fn child_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if file_type.is_dir() && entry.file_name() != ANNOTATIONS_DIR {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn root_children(root: &Path) -> Result<Vec<PathBuf>> {
    child_dirs(root).with_context(|| format!("Failed to read directory: {:?}", root))
}

/// Children of a cgroup below the kubepods roots. Pods come and go during a
/// walk, so a directory that vanished reads as empty.
fn nested_children(dir: &Path) -> Result<Vec<PathBuf>> {
    match child_dirs(dir) {
        Ok(dirs) => Ok(dirs),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} vanished during scan", dir.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read directory: {:?}", dir)),
    }
}

/// Depth-first search starting at (and including) `dir`.
fn find_in(dir: PathBuf, cgroup_id: u64) -> Result<Option<PathBuf>> {
    if cgroup_id_of(&dir) == Some(cgroup_id) {
        return Ok(Some(dir));
    }
    for child in nested_children(&dir)? {
        if let Some(found) = find_in(child, cgroup_id)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Record `dir` and everything below it.
fn scan_directory(dir: PathBuf, results: &mut Vec<(u64, PathBuf)>) -> Result<()> {
    let children = nested_children(&dir)?;
    match cgroup_id_of(&dir) {
        Some(id) => results.push((id, dir)),
        None => debug!("No cgroup id for {}", dir.display()),
    }
    for child in children {
        scan_directory(child, results)?;
    }
    Ok(())
}

/// Identity lookup backed by annotation files in the cgroup tree.
#[derive(Debug, Clone, Default)]
pub struct CgroupFsLookup {
    scanner: CgroupScanner,
}

impl CgroupFsLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(cgroup_root: PathBuf) -> Self {
        Self {
            scanner: CgroupScanner::with_root(cgroup_root),
        }
    }

    fn lookup_blocking(&self, cgroup_id: u64) -> Result<Option<ContainerIdentity>> {
        match self.scanner.find(cgroup_id)? {
            Some(path) => read_identity(cgroup_id, &path).map(Some),
            None => Ok(None),
        }
    }

    fn snapshot_blocking(&self) -> Result<Vec<ContainerIdentity>> {
        let mut identities = Vec::new();
        for (cgroup_id, path) in self.scanner.scan_all()? {
            // pod and QoS slices have no annotations
            if !path.join(ANNOTATIONS_DIR).is_dir() {
                continue;
            }
            match read_identity(cgroup_id, &path) {
                Ok(identity) => identities.push(identity),
                Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
            }
        }
        Ok(identities)
    }
}

/// Build an identity from the `annotations/` directory of a container cgroup.
pub fn read_identity(cgroup_id: u64, cgroup_dir: &Path) -> Result<ContainerIdentity> {
    let annotations = cgroup_dir.join(ANNOTATIONS_DIR);
    if !annotations.is_dir() {
        return Err(anyhow!(
            "cgroup {} at {} has no annotations",
            cgroup_id,
            cgroup_dir.display()
        ));
    }

    Ok(ContainerIdentity {
        cgroup_id,
        container_name: read_annotation(&annotations, CONTAINER_NAME_ANNOTATION)?,
        pod_name: read_annotation(&annotations, POD_NAME_ANNOTATION)?,
        namespace: read_annotation(&annotations, POD_NAMESPACE_ANNOTATION)?,
    })
}

fn read_annotation(annotations: &Path, key: &str) -> Result<String> {
    let path = annotations.join(key);
    let value = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read annotation {}", path.display()))?;
    Ok(value.trim().to_string())
}

#[async_trait]
impl IdentityLookup for CgroupFsLookup {
    async fn lookup(&self, cgroup_id: u64) -> Result<Option<ContainerIdentity>> {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.lookup_blocking(cgroup_id))
            .await
            .context("cgroupfs lookup task failed")?
    }

    async fn snapshot(&self) -> Result<Vec<ContainerIdentity>> {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.snapshot_blocking())
            .await
            .context("cgroupfs snapshot task failed")?
    }
}
