//! Resources: named, per-node artefacts (files or serialisable objects) that
//! jobs produce and consume, and the manager that tracks their freshness.

use crate::error::EngineResult;
use crate::node::Node;
use crate::shelf::{Shelf, Shelves, SledShelf};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies a resource instance: a name scoped to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub name: String,
    pub node: Node,
}

impl ResourceKey {
    pub fn object(name: impl Into<String>, node: Node) -> Self {
        Self {
            name: name.into(),
            node,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.node.displayname())
    }
}

/// The two resource kinds the engine tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A path on disk. `user_facing` paths are absolute external filenames;
    /// non-user-facing paths are derived under the pipeline temp directory.
    File { path: PathBuf, user_facing: bool },
    /// A serialisable value persisted in the object shelf.
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn file(key: ResourceKey, path: PathBuf, user_facing: bool) -> Self {
        Self {
            key,
            kind: ResourceKind::File { path, user_facing },
        }
    }

    pub fn object(key: ResourceKey) -> Self {
        Self {
            key,
            kind: ResourceKind::Object,
        }
    }
}

/// Persisted mtime/checksum record for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ResourceRecord {
    /// Nanoseconds since `UNIX_EPOCH`, or `None` if the resource has never
    /// been written (forces out-of-date on any consumer).
    mtime_nanos: Option<i128>,
    checksum: Option<String>,
}

/// Tracks mtime/existence of every resource; invalidates a process-wide stat
/// cache and performs content-addressed renames for file resources.
pub struct ResourceManager {
    records: SledShelf<ResourceKey, ResourceRecord>,
    objects: SledShelf<ResourceKey, Vec<u8>>,
    /// Process-wide stat cache, keyed by resolved path. Invalidated at the
    /// start of every run and for every path a job touches on finalisation.
    stat_cache: DashMap<PathBuf, Option<SystemTime>>,
    temp_dir: PathBuf,
}

impl ResourceManager {
    pub fn new(shelves: &Shelves, temp_dir: PathBuf) -> EngineResult<Self> {
        Ok(Self {
            records: shelves.tree("resources")?,
            objects: shelves.tree("objects")?,
            stat_cache: DashMap::new(),
            temp_dir,
        })
    }

    /// Invalidate the whole stat cache; called at the start of every run.
    pub fn invalidate_all(&self) {
        self.stat_cache.clear();
    }

    /// Invalidate the cached stat for one path; called after a job writes it.
    pub fn invalidate(&self, path: &Path) {
        self.stat_cache.remove(path);
    }

    /// Path under the pipeline temp directory for a non-user-facing file
    /// resource, laid out as `tmp/<node-subdir>/<resource-name>`.
    pub fn temp_path(&self, key: &ResourceKey) -> PathBuf {
        self.temp_dir.join(key.node.subdir()).join(&key.name)
    }

    /// Ensures the resource has a persistent record (a no-op if one exists).
    pub fn register(&self, key: &ResourceKey) -> EngineResult<()> {
        if self.records.get(key)?.is_none() {
            self.records.put(
                key,
                &ResourceRecord {
                    mtime_nanos: None,
                    checksum: None,
                },
            )?;
        }
        Ok(())
    }

    fn stat(&self, path: &Path) -> Option<SystemTime> {
        if let Some(cached) = self.stat_cache.get(path) {
            return *cached;
        }
        let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        self.stat_cache.insert(path.to_path_buf(), mtime);
        mtime
    }

    pub fn exists(&self, resource: &Resource) -> EngineResult<bool> {
        match &resource.kind {
            ResourceKind::File { path, .. } => Ok(self.stat(path).is_some()),
            ResourceKind::Object => Ok(self.records.get(&resource.key)?.is_some()),
        }
    }

    /// mtime of the resource as nanoseconds since the epoch, or `None` if the
    /// resource has never been recorded / the file is missing.
    pub fn mtime(&self, resource: &Resource) -> EngineResult<Option<i128>> {
        match &resource.kind {
            ResourceKind::File { path, .. } => {
                if let Some(t) = self.stat(path) {
                    Ok(Some(
                        t.duration_since(UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_nanos() as i128,
                    ))
                } else {
                    Ok(None)
                }
            }
            ResourceKind::Object => Ok(self
                .records
                .get(&resource.key)?
                .and_then(|r| r.mtime_nanos)),
        }
    }

    /// Content-addressed finalisation of a file write: a job writes its
    /// output to `tmp_path` and calls this to publish it at the resource's
    /// real path. If the existing file (if any) has identical content, the
    /// rename is skipped and the original mtime is preserved.
    pub fn finalize_file_write(&self, resource: &Resource, tmp_path: &Path) -> EngineResult<()> {
        let ResourceKind::File { path, .. } = &resource.kind else {
            panic!("finalize_file_write called on a non-file resource");
        };
        let new_checksum = checksum_file(tmp_path)?;
        let existing_checksum = self
            .records
            .get(&resource.key)?
            .and_then(|r| r.checksum.clone());
        let identical = path.exists() && existing_checksum.as_deref() == Some(new_checksum.as_str());
        if identical {
            std::fs::remove_file(tmp_path)?;
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(tmp_path, path)?;
            self.invalidate(path);
        }
        let mtime_nanos = self
            .stat(path)
            .map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i128);
        self.records.put(
            &resource.key,
            &ResourceRecord {
                mtime_nanos,
                checksum: Some(new_checksum),
            },
        )?;
        Ok(())
    }

    /// Stores a value for an object resource, refreshing its logical mtime.
    pub fn write_object(&self, resource: &Resource, value: &[u8]) -> EngineResult<()> {
        self.objects.put(&resource.key, &value.to_vec())?;
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i128;
        self.records.put(
            &resource.key,
            &ResourceRecord {
                mtime_nanos: Some(now_nanos),
                checksum: None,
            },
        )?;
        Ok(())
    }

    pub fn read_object(&self, resource: &Resource) -> EngineResult<Option<Vec<u8>>> {
        self.objects.get(&resource.key)
    }

    /// Removes a temporary resource once it is no longer required downstream.
    pub fn cleanup(&self, resource: &Resource) -> EngineResult<()> {
        match &resource.kind {
            ResourceKind::File { path, user_facing } => {
                if !*user_facing && path.exists() {
                    std::fs::remove_file(path)?;
                    self.invalidate(path);
                }
            }
            ResourceKind::Object => {
                self.objects.remove(&resource.key)?;
            }
        }
        self.records.remove(&resource.key)?;
        Ok(())
    }
}

fn checksum_file(path: &Path) -> EngineResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
