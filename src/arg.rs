//! Managed argument placeholders and their bound, per-node argument objects.
//!
//! A [`ManagedPlaceholder`] lives on a [`crate::job::JobDefinition`] and is
//! axis-relative; binding it to a concrete [`Node`] (at job-instance
//! construction time) produces a boxed [`ManagedArg`] trait object that knows
//! its own inputs/outputs and how to resolve a value for the user function.

use crate::axis::{Axis, Chunk, ChunkSet};
use crate::error::{EngineError, EngineResult};
use crate::job::JobEnv;
use crate::node::{Node, NodeManager};
use crate::resource::{Resource, ResourceKey, ResourceManager};
use std::path::PathBuf;

/// Direction a managed file/object argument flows: consumed or produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Definition-time, axis-relative managed placeholder. `axes` (where present)
/// names axes *beyond* the job's own axes that this argument ranges over —
/// empty for a plain same-node resource, non-empty for a merge argument that
/// gathers one resource per chunk of those axes rooted at the job's node.
#[derive(Debug, Clone)]
pub enum ManagedPlaceholder {
    /// A user-facing file at an absolute (possibly `{axis}`-templated) path,
    /// rooted at the workflow's root node.
    File {
        path: String,
        direction: Direction,
    },
    /// A temporary file keyed by `(name, node)`, optionally merged over `axes`.
    TempFile {
        name: String,
        axes: Vec<Axis>,
        direction: Direction,
    },
    /// An object resource keyed by `(name, node)`, optionally merged over `axes`.
    Obj {
        name: String,
        axes: Vec<Axis>,
        direction: Direction,
    },
    /// An untracked scratch file under the pipeline temp directory.
    TmpFile { name: String },
    /// The literal chunk value bound to `axis` at this node.
    Inst { axis: Axis },
    /// The chunk list for `axis` rooted at this node: input (read) or output
    /// (written, driving a split / node-manager update) direction.
    Chunks { axis: Axis, direction: Direction },
    /// A path template with `{axis}` substitutions from the current node.
    Template { path: String },
}

impl ManagedPlaceholder {
    fn extra_axes(&self) -> &[Axis] {
        match self {
            ManagedPlaceholder::TempFile { axes, .. } | ManagedPlaceholder::Obj { axes, .. } => axes,
            _ => &[],
        }
    }

    fn direction(&self) -> Option<Direction> {
        match self {
            ManagedPlaceholder::File { direction, .. }
            | ManagedPlaceholder::TempFile { direction, .. }
            | ManagedPlaceholder::Obj { direction, .. }
            | ManagedPlaceholder::Chunks { direction, .. } => Some(*direction),
            _ => None,
        }
    }

    /// Validates this placeholder against the job's own axes and binds it to
    /// `node`, producing the concrete argument object used at execution time.
    pub fn bind(
        &self,
        job_name: &str,
        job_axes: &[Axis],
        node: &Node,
        node_mgr: &NodeManager,
        res_mgr: &ResourceManager,
    ) -> EngineResult<Box<dyn ManagedArg>> {
        let extra = self.extra_axes();
        if !extra.is_empty() {
            let colliding: Vec<Axis> = extra.iter().filter(|a| job_axes.contains(a)).cloned().collect();
            if !colliding.is_empty() {
                return Err(EngineError::JobArgMismatch {
                    job: job_name.to_string(),
                    arg_axes: extra.iter().map(|a| a.to_string()).collect(),
                    job_axes: job_axes.iter().map(|a| a.to_string()).collect(),
                });
            }
            if self.direction() == Some(Direction::Out) {
                return Err(EngineError::JobArgMismatch {
                    job: job_name.to_string(),
                    arg_axes: extra.iter().map(|a| a.to_string()).collect(),
                    job_axes: job_axes.iter().map(|a| a.to_string()).collect(),
                });
            }
        }

        match self {
            ManagedPlaceholder::File { path, direction } => {
                let resolved = substitute(path, node);
                let key = ResourceKey::object(resolved.clone(), Node::root());
                Ok(Box::new(FileArg {
                    key,
                    real_path: PathBuf::from(resolved),
                    user_facing: true,
                    direction: *direction,
                }))
            }
            ManagedPlaceholder::TempFile { name, axes, direction } => {
                if axes.is_empty() {
                    let key = ResourceKey::object(name.clone(), node.clone());
                    let real_path = res_mgr.temp_path(&key);
                    Ok(Box::new(FileArg {
                        key,
                        real_path,
                        user_facing: false,
                        direction: *direction,
                    }))
                } else {
                    let nodes = node_mgr.retrieve_nodes(node, axes)?;
                    let entries = nodes
                        .into_iter()
                        .map(|n| {
                            let key = ResourceKey::object(name.clone(), n.clone());
                            let path = res_mgr.temp_path(&key);
                            (key, n, path)
                        })
                        .collect();
                    Ok(Box::new(MergeFileArg { entries }))
                }
            }
            ManagedPlaceholder::Obj { name, axes, direction } => {
                if axes.is_empty() {
                    let key = ResourceKey::object(name.clone(), node.clone());
                    Ok(Box::new(ObjArg {
                        key,
                        direction: *direction,
                    }))
                } else {
                    let nodes = node_mgr.retrieve_nodes(node, axes)?;
                    let entries = nodes
                        .into_iter()
                        .map(|n| (ResourceKey::object(name.clone(), n.clone()), n))
                        .collect();
                    Ok(Box::new(MergeObjArg { entries }))
                }
            }
            ManagedPlaceholder::TmpFile { name } => {
                let path = node
                    .subdir()
                    .is_empty()
                    .then(|| PathBuf::from(format!("scratch-{name}")))
                    .unwrap_or_else(|| PathBuf::from(node.subdir()).join(format!("scratch-{name}")));
                Ok(Box::new(ScratchFileArg {
                    rel_path: path,
                }))
            }
            ManagedPlaceholder::Inst { axis } => {
                let chunk = node.chunk_for(axis).cloned().ok_or_else(|| {
                    EngineError::JobArgMismatch {
                        job: job_name.to_string(),
                        arg_axes: vec![axis.to_string()],
                        job_axes: job_axes.iter().map(|a| a.to_string()).collect(),
                    }
                })?;
                Ok(Box::new(InstArg { chunk }))
            }
            ManagedPlaceholder::Chunks { axis, direction } => {
                let key = ResourceKey::object(format!("__chunks__:{}", axis.as_str()), node.clone());
                Ok(Box::new(ChunksArg {
                    axis: axis.clone(),
                    parent: node.clone(),
                    key,
                    direction: *direction,
                }))
            }
            ManagedPlaceholder::Template { path } => {
                let resolved = substitute(path, node);
                Ok(Box::new(InstArg {
                    chunk: Chunk::Str(resolved),
                }))
            }
        }
    }
}

fn substitute(template: &str, node: &Node) -> String {
    let mut out = template.to_string();
    for (axis, chunk) in &node.0 {
        out = out.replace(&format!("{{{}}}", axis.as_str()), &chunk.to_string());
    }
    out
}

/// A value resolved from a managed argument, passed to the user function.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Path(PathBuf),
    PathMap(Vec<(Node, PathBuf)>),
    Object(serde_json::Value),
    ObjectMap(Vec<(Node, serde_json::Value)>),
    Chunk(Chunk),
    Chunks(ChunkSet),
}

/// A managed argument bound to a concrete node: the capability set each of
/// the placeholder variants implements (§4.6).
pub trait ManagedArg: Send + Sync {
    fn get_inputs(&self) -> Vec<Resource>;
    fn get_outputs(&self) -> Vec<Resource>;
    fn prepare(&self, _env: &JobEnv) -> EngineResult<()> {
        Ok(())
    }
    fn pull(&self, _env: &JobEnv) -> EngineResult<()> {
        Ok(())
    }
    fn resolve(&self, env: &JobEnv) -> EngineResult<ArgValue>;
    fn push(&self, _env: &JobEnv) -> EngineResult<()> {
        Ok(())
    }
    fn updatedb(&self, _env: &JobEnv, _downstream_committed: bool) -> EngineResult<()> {
        Ok(())
    }
    /// True if this argument's completion should trigger a graph regeneration
    /// (only `Chunks { direction: Out }` does).
    fn triggers_regenerate(&self) -> bool {
        false
    }
    /// Stages a job function's return value against this argument, if it is
    /// the job's declared `ret`. A no-op for argument kinds that can't be a
    /// `ret` (inputs, literals, files).
    fn accept_return(&self, _env: &JobEnv, _value: serde_json::Value) {}
}

struct FileArg {
    key: ResourceKey,
    real_path: PathBuf,
    user_facing: bool,
    direction: Direction,
}

impl FileArg {
    fn resource(&self) -> Resource {
        Resource::file(self.key.clone(), self.real_path.clone(), self.user_facing)
    }

    fn scratch_path(&self) -> PathBuf {
        let file_name = self
            .real_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "out".to_string());
        self.real_path
            .with_file_name(format!(".{file_name}.part"))
    }
}

impl ManagedArg for FileArg {
    fn get_inputs(&self) -> Vec<Resource> {
        match self.direction {
            Direction::In => vec![self.resource()],
            Direction::Out => vec![],
        }
    }

    fn get_outputs(&self) -> Vec<Resource> {
        match self.direction {
            Direction::Out => vec![self.resource()],
            Direction::In => vec![],
        }
    }

    fn prepare(&self, _env: &JobEnv) -> EngineResult<()> {
        if self.direction == Direction::Out {
            if let Some(parent) = self.scratch_path().parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn resolve(&self, _env: &JobEnv) -> EngineResult<ArgValue> {
        match self.direction {
            Direction::In => Ok(ArgValue::Path(self.real_path.clone())),
            Direction::Out => Ok(ArgValue::Path(self.scratch_path())),
        }
    }

    fn push(&self, env: &JobEnv) -> EngineResult<()> {
        if self.direction == Direction::Out {
            env.resources
                .finalize_file_write(&self.resource(), &self.scratch_path())?;
        }
        Ok(())
    }
}

struct MergeFileArg {
    entries: Vec<(ResourceKey, Node, PathBuf)>,
}

impl ManagedArg for MergeFileArg {
    fn get_inputs(&self) -> Vec<Resource> {
        self.entries
            .iter()
            .map(|(k, _, p)| Resource::file(k.clone(), p.clone(), false))
            .collect()
    }

    fn get_outputs(&self) -> Vec<Resource> {
        vec![]
    }

    fn resolve(&self, _env: &JobEnv) -> EngineResult<ArgValue> {
        Ok(ArgValue::PathMap(
            self.entries.iter().map(|(_, n, p)| (n.clone(), p.clone())).collect(),
        ))
    }
}

struct ObjArg {
    key: ResourceKey,
    direction: Direction,
}

impl ObjArg {
    fn resource(&self) -> Resource {
        Resource::object(self.key.clone())
    }
}

impl ManagedArg for ObjArg {
    fn get_inputs(&self) -> Vec<Resource> {
        match self.direction {
            Direction::In => vec![self.resource()],
            Direction::Out => vec![],
        }
    }

    fn get_outputs(&self) -> Vec<Resource> {
        match self.direction {
            Direction::Out => vec![self.resource()],
            Direction::In => vec![],
        }
    }

    fn resolve(&self, env: &JobEnv) -> EngineResult<ArgValue> {
        match self.direction {
            Direction::In => {
                let bytes = env
                    .resources
                    .read_object(&self.resource())?
                    .ok_or_else(|| EngineError::UnknownResource(self.key.to_string()))?;
                Ok(ArgValue::Object(serde_json::from_slice(&bytes)?))
            }
            Direction::Out => Ok(ArgValue::Object(serde_json::Value::Null)),
        }
    }

    fn push(&self, env: &JobEnv) -> EngineResult<()> {
        if self.direction == Direction::Out {
            if let Some(value) = env.take_object(&self.key) {
                let bytes = serde_json::to_vec(&value)?;
                env.resources.write_object(&self.resource(), &bytes)?;
            }
        }
        Ok(())
    }

    fn accept_return(&self, env: &JobEnv, value: serde_json::Value) {
        if self.direction == Direction::Out {
            env.set_object(self.key.clone(), value);
        }
    }
}

struct MergeObjArg {
    entries: Vec<(ResourceKey, Node)>,
}

impl ManagedArg for MergeObjArg {
    fn get_inputs(&self) -> Vec<Resource> {
        self.entries.iter().map(|(k, _)| Resource::object(k.clone())).collect()
    }

    fn get_outputs(&self) -> Vec<Resource> {
        vec![]
    }

    fn resolve(&self, env: &JobEnv) -> EngineResult<ArgValue> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (key, node) in &self.entries {
            let bytes = env
                .resources
                .read_object(&Resource::object(key.clone()))?
                .ok_or_else(|| EngineError::UnknownResource(key.to_string()))?;
            out.push((node.clone(), serde_json::from_slice(&bytes)?));
        }
        Ok(ArgValue::ObjectMap(out))
    }
}

struct ScratchFileArg {
    rel_path: PathBuf,
}

impl ManagedArg for ScratchFileArg {
    fn get_inputs(&self) -> Vec<Resource> {
        vec![]
    }

    fn get_outputs(&self) -> Vec<Resource> {
        vec![]
    }

    fn prepare(&self, env: &JobEnv) -> EngineResult<()> {
        let path = env.resources.temp_path(&ResourceKey::object(
            self.rel_path.to_string_lossy().to_string(),
            Node::root(),
        ));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn resolve(&self, env: &JobEnv) -> EngineResult<ArgValue> {
        Ok(ArgValue::Path(env.resources.temp_path(&ResourceKey::object(
            self.rel_path.to_string_lossy().to_string(),
            Node::root(),
        ))))
    }
}

struct InstArg {
    chunk: Chunk,
}

impl ManagedArg for InstArg {
    fn get_inputs(&self) -> Vec<Resource> {
        vec![]
    }

    fn get_outputs(&self) -> Vec<Resource> {
        vec![]
    }

    fn resolve(&self, _env: &JobEnv) -> EngineResult<ArgValue> {
        Ok(ArgValue::Chunk(self.chunk.clone()))
    }
}

struct ChunksArg {
    axis: Axis,
    parent: Node,
    key: ResourceKey,
    direction: Direction,
}

impl ManagedArg for ChunksArg {
    fn get_inputs(&self) -> Vec<Resource> {
        match self.direction {
            Direction::In => vec![Resource::object(self.key.clone())],
            Direction::Out => vec![],
        }
    }

    fn get_outputs(&self) -> Vec<Resource> {
        match self.direction {
            Direction::Out => vec![Resource::object(self.key.clone())],
            Direction::In => vec![],
        }
    }

    fn resolve(&self, env: &JobEnv) -> EngineResult<ArgValue> {
        match self.direction {
            Direction::In => {
                let chunks = env.node_manager.retrieve_chunks(&self.axis, &self.parent)?;
                Ok(ArgValue::Chunks(chunks))
            }
            Direction::Out => Ok(ArgValue::Chunks(vec![])),
        }
    }

    fn updatedb(&self, env: &JobEnv, downstream_committed: bool) -> EngineResult<()> {
        if self.direction == Direction::Out {
            if let Some(chunks) = env.take_chunks(&self.key) {
                env.node_manager.store_chunks(
                    &self.axis,
                    &self.parent,
                    chunks.clone(),
                    self.key.clone(),
                    downstream_committed,
                )?;
                let bytes = serde_json::to_vec(&chunks)?;
                env.resources.write_object(&Resource::object(self.key.clone()), &bytes)?;
            }
        }
        Ok(())
    }

    fn triggers_regenerate(&self) -> bool {
        self.direction == Direction::Out
    }

    fn accept_return(&self, env: &JobEnv, value: serde_json::Value) {
        if self.direction == Direction::Out {
            let chunks: ChunkSet = serde_json::from_value(value).unwrap_or_default();
            env.set_chunks(self.key.clone(), chunks);
        }
    }
}
