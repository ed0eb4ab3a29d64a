//! Top-level workflow wiring: a set of job definitions plus the pipeline
//! directory layout (§6) they run against.

use crate::error::EngineResult;
use crate::graph::WorkflowGraph;
use crate::job::JobDefinition;
use crate::node::NodeManager;
use crate::resource::ResourceManager;
use crate::shelf::Shelves;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A named collection of job definitions, independent of any particular
/// pipeline directory.
#[derive(Clone, Default)]
pub struct WorkflowDefinition {
    pub name: String,
    pub jobs: Vec<JobDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
        }
    }

    pub fn add(&mut self, job: JobDefinition) -> &mut Self {
        self.jobs.push(job);
        self
    }
}

/// Standard pipeline directory layout (§6): `db/` for shelves and the lock,
/// `tmp/` for non-user-facing file resources, `log/` for per-job logs.
pub struct PipelineLayout {
    pub root: PathBuf,
}

impl PipelineLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.db_dir().join("lock")
    }
}

/// An instantiated workflow bound to a concrete pipeline directory: the
/// shelves, managers and graph needed to run it.
pub struct WorkflowInstance {
    pub layout: PipelineLayout,
    pub shelves: Arc<Shelves>,
    pub node_manager: Arc<NodeManager>,
    pub resource_manager: Arc<ResourceManager>,
    pub graph: WorkflowGraph,
}

impl WorkflowInstance {
    pub fn open(def: WorkflowDefinition, pipeline_dir: &Path) -> EngineResult<Self> {
        let layout = PipelineLayout::new(pipeline_dir);
        std::fs::create_dir_all(layout.tmp_dir())?;
        std::fs::create_dir_all(layout.log_dir())?;
        let shelves = Shelves::open(&layout.db_dir())?;
        let node_manager = Arc::new(NodeManager::new(&shelves)?);
        let resource_manager = Arc::new(ResourceManager::new(&shelves, layout.tmp_dir())?);
        resource_manager.invalidate_all();
        let graph = WorkflowGraph::new(def.jobs, node_manager.clone(), resource_manager.clone(), &shelves)?;
        Ok(Self {
            layout,
            shelves,
            node_manager,
            resource_manager,
            graph,
        })
    }

    pub fn close(&self) -> EngineResult<()> {
        self.shelves.close()
    }
}
