//! Shared fixtures for the integration suite: a tempdir-backed pipeline
//! directory plus small helpers for driving a `Scheduler` to completion.

use latticeflow::{Scheduler, SchedulerOptions, WorkflowDefinition, WorkflowInstance};
use std::path::{Path, PathBuf};

/// A fresh pipeline directory under a tempdir, torn down on drop.
pub struct PipelineFixture {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

impl PipelineFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("pipeline");
        Self { _dir: dir, root }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self._dir.path().join(name)
    }
}

/// Opens `def` against `dir` and drives it to completion with `options`.
pub async fn run(def: WorkflowDefinition, dir: &Path, options: SchedulerOptions) -> latticeflow::EngineResult<()> {
    let mut instance = WorkflowInstance::open(def.clone(), dir)?;
    let mut scheduler = Scheduler::new(&def.jobs, latticeflow::LocalThreadQueue::new(), options);
    let result = scheduler.run(&mut instance).await;
    instance.close()?;
    result
}

pub fn default_options() -> SchedulerOptions {
    SchedulerOptions::default()
}
