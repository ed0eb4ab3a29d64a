//! Job definitions and their per-node instances: the unit of work the
//! scheduler submits to the execution queue.

use crate::arg::{ArgValue, ManagedArg, ManagedPlaceholder};
use crate::axis::{Axis, ChunkSet};
use crate::error::EngineResult;
use crate::node::{Node, NodeManager};
use crate::resource::{Resource, ResourceKey, ResourceManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Retry-scaled context values, mirroring the original `_retry_factor` /
/// `_retry_increment` key-suffix convention: a numeric context entry `mem`
/// paired with `mem_retry_factor` and/or `mem_retry_increment` is scaled by
/// the current retry index before each resubmission.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub num_retry: u32,
    pub extra: HashMap<String, serde_json::Value>,
}

impl JobContext {
    pub fn scaled(&self, retry_idx: u32) -> HashMap<String, serde_json::Value> {
        let mut out = self.extra.clone();
        if retry_idx == 0 {
            return out;
        }
        let base_keys: Vec<String> = self
            .extra
            .keys()
            .filter(|k| !k.ends_with("_retry_factor") && !k.ends_with("_retry_increment"))
            .cloned()
            .collect();
        for key in base_keys {
            let base = match self.extra.get(&key).and_then(|v| v.as_f64()) {
                Some(v) => v,
                None => continue,
            };
            let factor = self
                .extra
                .get(&format!("{key}_retry_factor"))
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            let increment = self
                .extra
                .get(&format!("{key}_retry_increment"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            // The original mutates the context value in place on each retry
            // (`value = value * factor + increment`), so when a metric
            // carries both suffixes the increment itself compounds through
            // the factor on every subsequent retry rather than being added
            // once at the end. Apply that recurrence `retry_idx` times
            // rather than a closed-form `base * factor^n + increment * n`.
            let mut scaled = base;
            for _ in 0..retry_idx {
                scaled = scaled * factor + increment;
            }
            out.insert(key, serde_json::json!(scaled));
        }
        out
    }
}

/// An argument slot: either a literal value baked in at definition time, or a
/// managed placeholder bound to the job's node at instantiation time.
#[derive(Clone)]
pub enum ArgSpec {
    Literal(serde_json::Value),
    Managed(ManagedPlaceholder),
}

/// What kind of node-local effect running this job has, beyond its own
/// declared inputs/outputs.
#[derive(Clone)]
pub enum JobKind {
    /// A plain per-node transform.
    Transform,
    /// Emits a new axis's chunk set (bound via an `OChunks`-kind `ret`).
    Split { new_axis: Axis },
    /// Reinterprets one axis as another without changing the chunk count.
    /// `resource_name` is the single named resource aliased from the old
    /// node key to the new one; the engine runs this synchronously, never
    /// through the execution queue (§4.5).
    ChangeAxis {
        from_axis: Axis,
        to_axis: Axis,
        resource_name: String,
    },
    /// Expands into a nested workflow at this node; handled specially by the
    /// graph/scheduler rather than run through the execution queue.
    SubWorkflow,
    /// Assigns a literal value to an object resource with no user function.
    SetObj { value: serde_json::Value },
}

pub type JobFunc =
    Arc<dyn Fn(&JobEnv, &[ArgValue]) -> EngineResult<Option<serde_json::Value>> + Send + Sync>;

/// A job definition's function returns a nested workflow instead of pushing
/// outputs directly (§4.5). Kept as a distinct callable type from [`JobFunc`]
/// since its return type differs and it never touches managed arguments.
pub type SubWorkflowFunc =
    Arc<dyn Fn(&Node) -> EngineResult<crate::workflow::WorkflowDefinition> + Send + Sync>;

/// Axis-relative job definition, analogous to a `transform`/`split`/
/// `changeaxis`/`subworkflow` registration in the original scheduler.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub axes: Vec<Axis>,
    pub context: JobContext,
    pub args: Vec<ArgSpec>,
    pub ret: Option<ManagedPlaceholder>,
    pub kind: JobKind,
    pub func: Option<JobFunc>,
    pub subworkflow: Option<SubWorkflowFunc>,
}

impl JobDefinition {
    pub fn transform(name: impl Into<String>, axes: Vec<Axis>, func: JobFunc) -> Self {
        Self {
            name: name.into(),
            axes,
            context: JobContext::default(),
            args: Vec::new(),
            ret: None,
            kind: JobKind::Transform,
            func: Some(func),
            subworkflow: None,
        }
    }

    /// A job with no user function that assigns a literal value to an object
    /// resource — used to seed non-file workflow inputs (`ichunks` sources,
    /// constant parameters).
    pub fn set_obj(name: impl Into<String>, value: serde_json::Value, ret: ManagedPlaceholder) -> Self {
        let stored = value.clone();
        Self {
            name: name.into(),
            axes: Vec::new(),
            context: JobContext::default(),
            args: Vec::new(),
            ret: Some(ret),
            kind: JobKind::SetObj { value },
            func: Some(Arc::new(move |_env, _args| Ok(Some(stored.clone())))),
            subworkflow: None,
        }
    }

    /// A job fanned out over `from_axis` that re-exposes one named resource
    /// under `to_axis`'s key space without rerunning its producer (§4.5).
    pub fn change_axis(
        name: impl Into<String>,
        from_axis: Axis,
        to_axis: Axis,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            axes: vec![from_axis.clone()],
            context: JobContext::default(),
            args: Vec::new(),
            ret: None,
            kind: JobKind::ChangeAxis {
                from_axis,
                to_axis,
                resource_name: resource_name.into(),
            },
            func: None,
            subworkflow: None,
        }
    }

    /// A job whose function returns a nested [`crate::workflow::WorkflowDefinition`]
    /// to run at this node instead of producing outputs directly (§4.5).
    pub fn subworkflow(name: impl Into<String>, axes: Vec<Axis>, build: SubWorkflowFunc) -> Self {
        Self {
            name: name.into(),
            axes,
            context: JobContext::default(),
            args: Vec::new(),
            ret: None,
            kind: JobKind::SubWorkflow,
            func: None,
            subworkflow: Some(build),
        }
    }
}

/// Per-execution scratch state shared by a job instance's bound arguments:
/// the resource/node managers and the staging area for object/chunk outputs
/// a job function produces by value rather than by writing a file directly.
pub struct JobEnv {
    pub resources: Arc<ResourceManager>,
    pub node_manager: Arc<NodeManager>,
    /// Retry-scaled context values for the current attempt (§4.7), visible to
    /// the user function as read-only hints (e.g. a scaled memory request).
    pub context: HashMap<String, serde_json::Value>,
    /// Where this attempt's captured stdout/stderr should be written, if the
    /// scheduler allocated per-job logs for this submission.
    pub log_paths: Option<(std::path::PathBuf, std::path::PathBuf)>,
    pending_objects: Mutex<HashMap<ResourceKey, serde_json::Value>>,
    pending_chunks: Mutex<HashMap<ResourceKey, ChunkSet>>,
}

impl JobEnv {
    pub fn new(resources: Arc<ResourceManager>, node_manager: Arc<NodeManager>) -> Self {
        Self {
            resources,
            node_manager,
            context: HashMap::new(),
            log_paths: None,
            pending_objects: Mutex::new(HashMap::new()),
            pending_chunks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_log_paths(mut self, out: std::path::PathBuf, err: std::path::PathBuf) -> Self {
        self.log_paths = Some((out, err));
        self
    }

    pub fn set_object(&self, key: ResourceKey, value: serde_json::Value) {
        self.pending_objects.lock().insert(key, value);
    }

    pub fn take_object(&self, key: &ResourceKey) -> Option<serde_json::Value> {
        self.pending_objects.lock().remove(key)
    }

    pub fn set_chunks(&self, key: ResourceKey, chunks: ChunkSet) {
        self.pending_chunks.lock().insert(key, chunks);
    }

    pub fn take_chunks(&self, key: &ResourceKey) -> Option<ChunkSet> {
        self.pending_chunks.lock().remove(key)
    }
}

/// A job bound to one node: resolved argument objects, ready to run.
pub struct JobInstance {
    pub job_name: String,
    pub node: Node,
    pub retry_idx: u32,
    pub kind: JobKind,
    func: Option<JobFunc>,
    subworkflow: Option<SubWorkflowFunc>,
    literals: Vec<(usize, serde_json::Value)>,
    bound: Vec<(usize, Box<dyn ManagedArg>)>,
    ret: Option<Box<dyn ManagedArg>>,
    arity: usize,
}

impl JobInstance {
    pub fn bind(
        def: &JobDefinition,
        node: &Node,
        node_mgr: &NodeManager,
        res_mgr: &ResourceManager,
    ) -> EngineResult<Self> {
        let mut literals = Vec::new();
        let mut bound = Vec::new();
        for (idx, spec) in def.args.iter().enumerate() {
            match spec {
                ArgSpec::Literal(v) => literals.push((idx, v.clone())),
                ArgSpec::Managed(p) => {
                    let arg = p.bind(&def.name, &def.axes, node, node_mgr, res_mgr)?;
                    bound.push((idx, arg));
                }
            }
        }
        let ret = match &def.ret {
            Some(p) => Some(p.bind(&def.name, &def.axes, node, node_mgr, res_mgr)?),
            None => None,
        };
        Ok(Self {
            job_name: def.name.clone(),
            node: node.clone(),
            retry_idx: 0,
            kind: def.kind.clone(),
            func: def.func.clone(),
            subworkflow: def.subworkflow.clone(),
            arity: def.args.len(),
            literals,
            bound,
            ret,
        })
    }

    /// True for job kinds the scheduler must run synchronously in the main
    /// loop rather than submitting to the execution queue (§4.5: change-axis
    /// completes immediately; sub-workflows recurse into a nested instance).
    pub fn runs_inline(&self) -> bool {
        matches!(self.kind, JobKind::ChangeAxis { .. } | JobKind::SubWorkflow)
    }

    /// Materialises the nested workflow this instance's function returns, for
    /// `JobKind::SubWorkflow` instances.
    pub fn build_subworkflow(&self) -> EngineResult<Option<crate::workflow::WorkflowDefinition>> {
        match &self.subworkflow {
            Some(f) => Ok(Some(f(&self.node)?)),
            None => Ok(None),
        }
    }

    /// Executes a `JobKind::ChangeAxis` instance: stores `to_axis`'s chunk set
    /// as an alias of `from_axis`'s (rooted at this node's parent) and aliases
    /// the named resource from this node's key to the new node's key, via an
    /// object-shelf copy or a filesystem symlink (§4.2, §4.5).
    pub fn run_change_axis(&self, node_mgr: &NodeManager, res_mgr: &ResourceManager) -> EngineResult<()> {
        let JobKind::ChangeAxis {
            from_axis,
            to_axis,
            resource_name,
        } = &self.kind
        else {
            return Ok(());
        };
        let parent = self.node.prefix(self.node.len().saturating_sub(1));
        let chunk = self
            .node
            .chunk_for(from_axis)
            .cloned()
            .expect("change-axis instance bound to from_axis");
        let chunks = node_mgr.retrieve_chunks(from_axis, &parent)?;
        node_mgr.store_chunks(
            to_axis,
            &parent,
            chunks,
            ResourceKey::object(format!("__changeaxis__:{}", to_axis.as_str()), parent.clone()),
            false,
        )?;
        let to_node = parent.extended(to_axis.clone(), chunk);
        let src_key = ResourceKey::object(resource_name.clone(), self.node.clone());
        let dst_key = ResourceKey::object(resource_name.clone(), to_node);
        if let Some(bytes) = res_mgr.read_object(&Resource::object(src_key.clone()))? {
            res_mgr.write_object(&Resource::object(dst_key), &bytes)?;
        } else {
            let src_path = res_mgr.temp_path(&src_key);
            if src_path.exists() {
                let dst_path = res_mgr.temp_path(&dst_key);
                if let Some(p) = dst_path.parent() {
                    std::fs::create_dir_all(p)?;
                }
                if dst_path.exists() || dst_path.symlink_metadata().is_ok() {
                    std::fs::remove_file(&dst_path)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&src_path, &dst_path)?;
                #[cfg(not(unix))]
                std::fs::copy(&src_path, &dst_path).map(|_| ())?;
            }
        }
        Ok(())
    }

    pub fn inputs(&self) -> Vec<Resource> {
        let mut ins: Vec<Resource> = self.bound.iter().flat_map(|(_, a)| a.get_inputs()).collect();
        if let JobKind::ChangeAxis { resource_name, .. } = &self.kind {
            ins.push(Resource::object(ResourceKey::object(resource_name.clone(), self.node.clone())));
        }
        ins
    }

    pub fn outputs(&self) -> Vec<Resource> {
        let mut out: Vec<Resource> = self.bound.iter().flat_map(|(_, a)| a.get_outputs()).collect();
        if let Some(ret) = &self.ret {
            out.extend(ret.get_outputs());
        }
        if let JobKind::ChangeAxis {
            from_axis,
            to_axis,
            resource_name,
        } = &self.kind
        {
            // The resource this instance aliases onto `to_axis` isn't bound
            // through a `ManagedArg`, since run_change_axis writes it
            // directly; declare it as a tracked output so jobs keyed on the
            // new axis correctly depend on this instance having run (§4.5).
            let parent = self.node.prefix(self.node.len().saturating_sub(1));
            if let Some(chunk) = self.node.chunk_for(from_axis).cloned() {
                let to_node = parent.extended(to_axis.clone(), chunk);
                out.push(Resource::object(ResourceKey::object(resource_name.clone(), to_node)));
            }
        }
        out
    }

    /// True if this instance's outputs include a chunk-list write, meaning a
    /// successful run should trigger graph regeneration.
    pub fn triggers_regenerate(&self) -> bool {
        self.bound.iter().any(|(_, a)| a.triggers_regenerate())
            || self.ret.as_ref().is_some_and(|a| a.triggers_regenerate())
    }

    /// Runs the bound function (if any) and stages its managed outputs. Does
    /// not call `updatedb`; the caller does that once the caller knows
    /// whether downstream work has already committed against prior chunks.
    pub fn run(&self, env: &JobEnv) -> EngineResult<()> {
        for (_, arg) in &self.bound {
            arg.prepare(env)?;
        }
        if let Some(ret) = &self.ret {
            ret.prepare(env)?;
        }

        let Some(func) = &self.func else {
            return Ok(());
        };

        let mut values: Vec<Option<ArgValue>> = vec![None; self.arity];
        for (idx, v) in &self.literals {
            values[*idx] = Some(ArgValue::Object(v.clone()));
        }
        for (idx, arg) in &self.bound {
            values[*idx] = Some(arg.resolve(env)?);
        }
        let values: Vec<ArgValue> = values.into_iter().map(|v| v.expect("argument not bound")).collect();

        let result = func(env, &values)?;

        for (_, arg) in &self.bound {
            arg.push(env)?;
        }
        if let Some(ret) = &self.ret {
            if let Some(value) = result {
                ret.accept_return(env, value);
            }
            ret.push(env)?;
        }
        Ok(())
    }

    pub fn finish(&self, env: &JobEnv, downstream_committed: bool) -> EngineResult<()> {
        for (_, arg) in &self.bound {
            arg.updatedb(env, downstream_committed)?;
        }
        if let Some(ret) = &self.ret {
            ret.updatedb(env, downstream_committed)?;
        }
        Ok(())
    }
}
