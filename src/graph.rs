//! The workflow graph: expands job definitions into per-node instances,
//! tracks freshness against prior runs, and hands out ready jobs in
//! dependency order.

use crate::error::{EngineError, EngineResult};
use crate::job::{JobDefinition, JobEnv, JobInstance};
use crate::node::{Node, NodeManager};
use crate::resource::{ResourceKind, ResourceManager};
use crate::shelf::{Shelf, Shelves, SledShelf};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

fn job_id(name: &str, node: &Node) -> String {
    format!("{name}{}", node.displayname())
}

/// One line of a human-readable out-of-date explanation (§4.4's
/// `explain_out_of_date`): a resource annotated with its relative age.
#[derive(Debug, Clone)]
pub enum ExplainLine {
    Missing { resource: String, direction: &'static str },
    Age { resource: String, direction: &'static str, mtime_nanos: i128 },
}

impl std::fmt::Display for ExplainLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExplainLine::Missing { resource, direction } => {
                write!(f, "{direction} {resource}: missing")
            }
            ExplainLine::Age {
                resource,
                direction,
                mtime_nanos,
            } => write!(f, "{direction} {resource}: mtime={mtime_nanos}"),
        }
    }
}

/// Opaque handle to an in-flight job instance, returned by `pop_next_job`.
///
/// Wraps the instance's stable `(job name, node)` display id rather than a
/// bare index: `regenerate_with` rebuilds `instances` into a fresh `Vec` on
/// every split completion, which would otherwise leave handles held by a
/// scheduler's other concurrently in-flight jobs pointing at the wrong (or a
/// now out-of-bounds) slot. `id_index` remaps a handle to its current index
/// on every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

pub enum JobOutcome {
    Success,
    Failure,
}

pub struct WorkflowGraph {
    defs: Vec<JobDefinition>,
    node_manager: Arc<NodeManager>,
    resource_manager: Arc<ResourceManager>,
    /// The job-completion shelf (§3): `job display name -> bool`. Consulted
    /// only by `prune_stale_completions`; within-run completion tracking
    /// lives in `done` below, carried across `regenerate` calls by job id.
    completion: SledShelf<String, bool>,

    instances: Vec<Arc<JobInstance>>,
    /// `(job name, node) display id -> current index into `instances``.
    /// Rebuilt on every `regenerate_with`; the indirection `JobHandle` needs
    /// to stay valid across a regeneration it was not aware of.
    id_index: HashMap<String, usize>,
    topo_order: Vec<usize>,
    deps: Vec<Vec<usize>>,
    out_of_date: HashSet<usize>,
    done: HashSet<usize>,
    in_flight: HashSet<usize>,
    /// Instances that exhausted their retry budget this run (§7 `IncompleteJob`).
    /// Never popped again; a dependent can never become ready since its
    /// producer never joins `done`, which is how a permanent failure quiesces
    /// the branches that depend on it without needing explicit propagation.
    failed: HashSet<usize>,
}

impl WorkflowGraph {
    pub fn new(
        defs: Vec<JobDefinition>,
        node_manager: Arc<NodeManager>,
        resource_manager: Arc<ResourceManager>,
        shelves: &Shelves,
    ) -> EngineResult<Self> {
        Ok(Self {
            defs,
            node_manager,
            resource_manager,
            completion: shelves.tree("job_completion")?,
            instances: Vec::new(),
            id_index: HashMap::new(),
            topo_order: Vec::new(),
            deps: Vec::new(),
            out_of_date: HashSet::new(),
            done: HashSet::new(),
            in_flight: HashSet::new(),
            failed: HashSet::new(),
        })
    }

    pub fn env(&self) -> JobEnv {
        JobEnv::new(self.resource_manager.clone(), self.node_manager.clone())
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    /// Equivalent to [`Self::regenerate_with`] with both force flags clear.
    pub fn regenerate(&mut self) -> EngineResult<()> {
        self.regenerate_with(false, false)
    }

    /// Re-expands every job definition against the current axis chunk sets,
    /// recomputes dependencies and out-of-date status, and propagates
    /// `required_downstream` transitively from any out-of-date sink.
    ///
    /// `rerun` forces every instance to be treated as out of date regardless
    /// of its recorded freshness. `repopulate` forces an instance out of date
    /// if any of its declared output files is missing on disk, even when its
    /// completion record otherwise looks fresh (mirrors the original
    /// `Scheduler.rerun` / `Scheduler.repopulate` run options, §4.7).
    pub fn regenerate_with(&mut self, rerun: bool, repopulate: bool) -> EngineResult<()> {
        let old_done_ids: HashSet<String> = self
            .done
            .iter()
            .map(|&idx| job_id(&self.instances[idx].job_name, &self.instances[idx].node))
            .collect();
        // Jobs the scheduler currently holds `JobHandle`s for (submitted to
        // the execution queue, not yet completed) must stay `in_flight` under
        // the new index assignment too, or a split completion triggering
        // this regeneration would let `pop_next_job` resubmit work that is
        // still running.
        let old_in_flight_ids: HashSet<String> = self
            .in_flight
            .iter()
            .map(|&idx| job_id(&self.instances[idx].job_name, &self.instances[idx].node))
            .collect();

        let mut instances = Vec::new();
        for def in &self.defs {
            let nodes = if def.axes.is_empty() {
                vec![Node::root()]
            } else {
                let nodes = self.node_manager.retrieve_nodes(&Node::root(), &def.axes)?;
                if nodes.is_empty() {
                    continue; // axis not yet materialised: defer this definition
                }
                nodes
            };
            for node in nodes {
                instances.push(Arc::new(JobInstance::bind(
                    def,
                    &node,
                    &self.node_manager,
                    &self.resource_manager,
                )?));
            }
        }

        // Open Question (a): a split job's chunk set may shrink on rerun.
        // Any previously-known instance keyed on a now-dropped chunk simply
        // no longer appears in `instances` (retrieve_nodes omits it); clean
        // up its temporary outputs and drop its completion-shelf entry so a
        // later regeneration does not treat it as done-but-absent.
        let new_ids: HashSet<String> = instances
            .iter()
            .map(|inst| job_id(&inst.job_name, &inst.node))
            .collect();
        for old_inst in &self.instances {
            let id = job_id(&old_inst.job_name, &old_inst.node);
            if new_ids.contains(&id) {
                continue;
            }
            for out in old_inst.outputs() {
                if matches!(&out.kind, ResourceKind::File { user_facing: false, .. })
                    || matches!(&out.kind, ResourceKind::Object)
                {
                    self.resource_manager.cleanup(&out)?;
                }
            }
            self.completion.remove(&id)?;
        }

        let mut producer_of: HashMap<String, usize> = HashMap::new();
        for (idx, inst) in instances.iter().enumerate() {
            for out in inst.outputs() {
                let key = out.key.to_string();
                if let Some(&existing) = producer_of.get(&key) {
                    if existing != idx {
                        return Err(EngineError::DuplicateOutput {
                            resource: key,
                            first: job_id(&instances[existing].job_name, &instances[existing].node),
                            second: job_id(&inst.job_name, &inst.node),
                        });
                    }
                } else {
                    producer_of.insert(key, idx);
                }
            }
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); instances.len()];
        for (idx, inst) in instances.iter().enumerate() {
            for input in inst.inputs() {
                if let Some(&producer) = producer_of.get(&input.key.to_string()) {
                    if producer != idx {
                        deps[idx].push(producer);
                    }
                }
            }
            for res_key in self.node_manager.get_node_inputs(&inst.node) {
                if let Some(&producer) = producer_of.get(&res_key.to_string()) {
                    if producer != idx && !deps[idx].contains(&producer) {
                        deps[idx].push(producer);
                    }
                }
            }
        }

        let topo_order = topological_sort(&deps)?;

        // Per-job out-of-date, via the literal §4.4 mtime rule, before
        // propagating `required_downstream`.
        let mut base_ood = vec![false; instances.len()];
        for &idx in &topo_order {
            let forced = rerun || (repopulate && self.missing_output(&instances[idx])?);
            base_ood[idx] = forced || self.is_out_of_date(&instances[idx])?;
        }

        // required_downstream is transitive (Open Question (b)): walk the
        // topological order back to front (consumers before producers) and
        // mark every producer of an out-of-date job out of date too, however
        // many otherwise-fresh intermediates separate them.
        let mut out_of_date_flags = base_ood.clone();
        for &idx in topo_order.iter().rev() {
            if out_of_date_flags[idx] {
                for &producer in &deps[idx] {
                    out_of_date_flags[producer] = true;
                }
            }
        }
        let out_of_date: HashSet<usize> = out_of_date_flags
            .iter()
            .enumerate()
            .filter(|(_, &ood)| ood)
            .map(|(idx, _)| idx)
            .collect();

        self.done = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| old_done_ids.contains(&job_id(&inst.job_name, &inst.node)))
            .map(|(idx, _)| idx)
            .collect();
        self.in_flight = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| old_in_flight_ids.contains(&job_id(&inst.job_name, &inst.node)))
            .map(|(idx, _)| idx)
            .collect();
        self.id_index = instances
            .iter()
            .enumerate()
            .map(|(idx, inst)| (job_id(&inst.job_name, &inst.node), idx))
            .collect();
        self.instances = instances;
        self.deps = deps;
        self.topo_order = topo_order;
        self.out_of_date = out_of_date;
        self.failed.clear();
        Ok(())
    }

    /// Resolves a handle to its current index, re-keying on every call since
    /// `regenerate_with` may have rebuilt `instances` since the handle was
    /// issued. Fails rather than panicking if the instance no longer exists
    /// (e.g. its axis chunk was dropped while the job was in flight).
    fn resolve(&self, handle: &JobHandle) -> EngineResult<usize> {
        self.id_index
            .get(&handle.0)
            .copied()
            .ok_or_else(|| EngineError::UnknownResource(handle.0.clone()))
    }

    fn missing_output(&self, inst: &JobInstance) -> EngineResult<bool> {
        for out in inst.outputs() {
            if !self.resource_manager.exists(&out)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pure function of the resource manager's current state (§8 property
    /// 2): given a job instance's recorded input set I and output set O,
    /// decides whether it must run, by the literal §4.4 algorithm. Does not
    /// consult `required_downstream` — that is layered on afterwards as a
    /// transitive propagation in `regenerate_with`.
    fn is_out_of_date(&self, inst: &JobInstance) -> EngineResult<bool> {
        let inputs = inst.inputs();
        let outputs = inst.outputs();

        if inputs.is_empty() && outputs.is_empty() {
            return Ok(true); // no I, no O: run always
        }
        if inputs.is_empty() {
            return Ok(true); // axis-less generator: run always
        }
        if outputs.is_empty() {
            return Ok(true); // sink: run always
        }

        let mut i_max: Option<i128> = None;
        for input in &inputs {
            match self.resource_manager.mtime(input)? {
                Some(t) => i_max = Some(i_max.map_or(t, |m| m.max(t))),
                // A workflow input that has never been written is treated
                // conservatively as forcing a rerun, mirroring the missing
                // output rule below.
                None => return Ok(true),
            }
        }

        let mut o_min: Option<i128> = None;
        for out in &outputs {
            match self.resource_manager.mtime(out)? {
                Some(t) => o_min = Some(o_min.map_or(t, |m| m.min(t))),
                None => return Ok(true), // output mtime unknown: out of date
            }
        }

        // Ties are not out of date.
        Ok(i_max.unwrap() > o_min.unwrap())
    }

    /// Enumerates every input/output of a job instance with its relative
    /// age, mirroring `explain_out_of_date` (§4.4).
    fn explain_lines(&self, inst: &JobInstance) -> EngineResult<Vec<ExplainLine>> {
        let mut lines = Vec::new();
        for input in inst.inputs() {
            let name = input.key.to_string();
            match self.resource_manager.mtime(&input)? {
                Some(mtime_nanos) => lines.push(ExplainLine::Age {
                    resource: name,
                    direction: "input",
                    mtime_nanos,
                }),
                None => lines.push(ExplainLine::Missing {
                    resource: name,
                    direction: "input",
                }),
            }
        }
        for out in inst.outputs() {
            let name = out.key.to_string();
            match self.resource_manager.mtime(&out)? {
                Some(mtime_nanos) => lines.push(ExplainLine::Age {
                    resource: name,
                    direction: "output",
                    mtime_nanos,
                }),
                None => lines.push(ExplainLine::Missing {
                    resource: name,
                    direction: "output",
                }),
            }
        }
        Ok(lines)
    }

    /// A human-readable reason a job is considered out of date, for the
    /// `explain` CLI subcommand: up to date, never completed, blocked behind
    /// an out-of-date upstream, or a line-by-line input/output age dump.
    pub fn explain(&self, job_name: &str, node: &Node) -> EngineResult<String> {
        let idx = self
            .instances
            .iter()
            .position(|i| i.job_name == job_name && &i.node == node)
            .ok_or_else(|| EngineError::UnknownResource(job_id(job_name, node)))?;
        if !self.out_of_date.contains(&idx) {
            return Ok(format!("{} is up to date", job_id(job_name, node)));
        }
        if !self.completion.get(&job_id(job_name, node))?.unwrap_or(false) {
            return Ok(format!("{} has never completed", job_id(job_name, node)));
        }
        if self.deps[idx].iter().any(|d| self.out_of_date.contains(d)) {
            return Ok(format!(
                "{} is out of date because an upstream dependency is out of date",
                job_id(job_name, node)
            ));
        }
        let lines = self.explain_lines(&self.instances[idx])?;
        let detail = lines
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Ok(format!(
            "{} is out of date: {}",
            job_id(job_name, node),
            detail
        ))
    }

    /// Returns the next ready job instance (out of date, dependencies
    /// satisfied, not already in flight), if any.
    pub fn pop_next_job(&mut self) -> Option<JobHandle> {
        for &idx in &self.topo_order {
            if !self.out_of_date.contains(&idx) {
                continue;
            }
            if self.done.contains(&idx) || self.in_flight.contains(&idx) || self.failed.contains(&idx) {
                continue;
            }
            if self.deps[idx].iter().all(|d| self.done.contains(d)) {
                self.in_flight.insert(idx);
                let id = job_id(&self.instances[idx].job_name, &self.instances[idx].node);
                return Some(JobHandle(id));
            }
        }
        None
    }

    pub fn instance(&self, handle: &JobHandle) -> EngineResult<Arc<JobInstance>> {
        let idx = self.resolve(handle)?;
        Ok(self.instances[idx].clone())
    }

    pub fn is_empty_of_ready_work(&self) -> bool {
        self.in_flight.is_empty()
            && self.topo_order.iter().all(|idx| {
                !self.out_of_date.contains(idx) || self.done.contains(idx) || self.failed.contains(idx)
            })
    }

    /// Marks an in-flight instance as permanently failed: its retry budget is
    /// spent (§7 `IncompleteJob`). It is never popped again this run, and any
    /// consumer depending on it can never become ready since `deps[idx].iter()
    /// .all(|d| done.contains(d))` never holds for a producer that skipped
    /// `done` — no separate downstream-blocking logic is needed.
    pub fn mark_failed(&mut self, handle: &JobHandle) -> EngineResult<()> {
        let idx = self.resolve(handle)?;
        self.in_flight.remove(&idx);
        self.failed.insert(idx);
        Ok(())
    }

    /// Records a job instance's outcome. On success, persists its mtime
    /// snapshot and returns whether the instance's outputs require a graph
    /// regeneration (a split job changed its axis's chunk set).
    pub fn notify_completed(&mut self, handle: &JobHandle, outcome: JobOutcome) -> EngineResult<bool> {
        let idx = self.resolve(handle)?;
        self.in_flight.remove(&idx);
        match outcome {
            JobOutcome::Failure => Ok(false),
            JobOutcome::Success => {
                let inst = &self.instances[idx];
                self.completion.put(&job_id(&inst.job_name, &inst.node), &true)?;
                self.done.insert(idx);
                Ok(inst.triggers_regenerate())
            }
        }
    }

    /// The set of job display names currently flagged out of date, for
    /// tests asserting that regeneration is deterministic given an
    /// unchanged resource state.
    pub fn explain_lines_keys(&self) -> HashSet<String> {
        self.out_of_date
            .iter()
            .map(|&idx| job_id(&self.instances[idx].job_name, &self.instances[idx].node))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.topo_order
            .iter()
            .filter(|idx| {
                self.out_of_date.contains(idx) && !self.done.contains(idx) && !self.failed.contains(idx)
            })
            .count()
    }

    /// Removes every completed, non-user-facing temporary output whose every
    /// consumer has also completed (§4.2, §8 property 7). Returns the count
    /// of resources removed.
    pub fn cleanup_temporaries(&self) -> EngineResult<usize> {
        let mut consumers: HashMap<usize, Vec<usize>> = HashMap::new();
        for (consumer, producers) in self.deps.iter().enumerate() {
            for &producer in producers {
                consumers.entry(producer).or_default().push(consumer);
            }
        }
        let mut removed = 0;
        for &idx in &self.done {
            for out in self.instances[idx].outputs() {
                let is_temp_file = matches!(&out.kind, ResourceKind::File { user_facing: false, .. });
                if !is_temp_file {
                    continue;
                }
                let all_consumers_done = consumers
                    .get(&idx)
                    .map(|cs| cs.iter().all(|c| self.done.contains(c)))
                    .unwrap_or(true);
                if all_consumers_done {
                    self.resource_manager.cleanup(&out)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Drops job-completion shelf entries for display names that no longer
    /// correspond to any currently-defined job (stale entries left behind by
    /// a definition that was renamed or removed between runs).
    pub fn prune_stale_completions(&self) -> EngineResult<usize> {
        let live: HashSet<String> = self
            .instances
            .iter()
            .map(|inst| job_id(&inst.job_name, &inst.node))
            .collect();
        let mut pruned = 0;
        for key in self.completion.keys()? {
            if !live.contains(&key) {
                self.completion.remove(&key)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

fn topological_sort(deps: &[Vec<usize>]) -> EngineResult<Vec<usize>> {
    let n = deps.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (idx, d) in deps.iter().enumerate() {
        indegree[idx] = d.len();
        for &dep in d {
            dependents[dep].push(idx);
        }
    }
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        for &dep in &dependents[idx] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                queue.push_back(dep);
            }
        }
    }
    if order.len() != n {
        let stuck: Vec<String> = (0..n).filter(|i| !order.contains(i)).map(|i| i.to_string()).collect();
        return Err(EngineError::DependencyCycle { jobs: stuck });
    }
    Ok(order)
}
