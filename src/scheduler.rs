//! The job scheduler: drives a `WorkflowGraph` to completion over an
//! `ExecutionQueue`, handling retries, regeneration and interruption (§4.7).

use crate::error::{EngineError, EngineResult};
use crate::graph::JobOutcome;
use crate::job::JobDefinition;
use crate::queue::{ExecutionQueue, LocalThreadQueue, TicketSource};
use crate::workflow::WorkflowInstance;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Run-time options mirroring the original `Scheduler`'s `max_jobs`, `rerun`,
/// `repopulate`, `cleanup` and `prune` flags.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_jobs: usize,
    pub rerun: bool,
    pub repopulate: bool,
    pub cleanup: bool,
    pub prune: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            rerun: false,
            repopulate: false,
            cleanup: true,
            prune: true,
        }
    }
}

/// Shared interrupt flag: a first signal stops submitting new work and lets
/// in-flight jobs drain; a second cancels the drain outright.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicU8>);

impl InterruptFlag {
    pub fn signal(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn level(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-attempt bookkeeping for a job instance that has failed at least once.
#[derive(Default, Clone)]
struct RetryState {
    attempts: u32,
}

pub struct Scheduler<Q: ExecutionQueue> {
    queue: Q,
    tickets: TicketSource,
    options: SchedulerOptions,
    retry_budget: HashMap<String, u32>,
    contexts: HashMap<String, crate::job::JobContext>,
    interrupt: InterruptFlag,
}

impl<Q: ExecutionQueue> Scheduler<Q> {
    pub fn new(defs: &[JobDefinition], queue: Q, options: SchedulerOptions) -> Self {
        let retry_budget = defs
            .iter()
            .map(|d| (d.name.clone(), d.context.num_retry))
            .collect();
        let contexts = defs.iter().map(|d| (d.name.clone(), d.context.clone())).collect();
        Self {
            queue,
            tickets: TicketSource::default(),
            options,
            retry_budget,
            contexts,
            interrupt: InterruptFlag::default(),
        }
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Drains `instance`'s graph to completion, returning `Ok(())` once no
    /// job is out of date, or `Err(PipelineFailed)` once every job that can
    /// still make progress has either completed or is blocked behind a
    /// permanently failed dependency.
    pub async fn run(&mut self, instance: &mut WorkflowInstance) -> EngineResult<()> {
        if self.options.prune {
            instance.graph.prune_stale_completions()?;
        }
        instance
            .graph
            .regenerate_with(self.options.rerun, self.options.repopulate)?;

        let mut in_flight: HashMap<crate::queue::Ticket, (crate::graph::JobHandle, Arc<crate::job::JobEnv>)> =
            HashMap::new();
        let mut retries: HashMap<String, RetryState> = HashMap::new();
        let mut any_permanently_failed = false;

        loop {
            if self.interrupt.level() == 0 {
                while in_flight.len() < self.options.max_jobs.max(1) {
                    let Some(handle) = instance.graph.pop_next_job() else {
                        break;
                    };
                    let job = instance.graph.instance(&handle)?;

                    if job.runs_inline() {
                        self.run_inline(instance, handle).await?;
                        continue;
                    }

                    let job_id = format!("{}{}", job.job_name, job.node.displayname());
                    let retry_idx = retries.get(&job_id).map(|r| r.attempts).unwrap_or(0);
                    let job_log_dir = instance.layout.log_dir().join(job.node.subdir()).join(&job.job_name);
                    let exc_dir = job_log_dir.join(format!("exc{retry_idx}"));
                    std::fs::create_dir_all(&exc_dir)?;
                    let out_path = job_log_dir.join("job.out");
                    let err_path = job_log_dir.join("job.err");

                    let scaled_context = self
                        .contexts
                        .get(&job.job_name)
                        .map(|c| c.scaled(retry_idx))
                        .unwrap_or_default();
                    let env = Arc::new(
                        instance
                            .graph
                            .env()
                            .with_context(scaled_context)
                            .with_log_paths(out_path, err_path),
                    );

                    let ticket = self.tickets.next();
                    info!(job = %job.job_name, node = %job.node, retry = retry_idx, "submitting job");
                    let run_job = job.clone();
                    let run_env = env.clone();
                    self.queue.send(
                        ticket,
                        Box::new(move || {
                            run_job.run(&run_env).map_err(|e| {
                                let _ = std::fs::write(exc_dir.join("exception.txt"), e.to_string());
                                e
                            })
                        }),
                    );
                    in_flight.insert(ticket, (handle, env));
                }
            }

            if in_flight.is_empty() {
                if instance.graph.pending_count() == 0 {
                    return self.finish(instance, any_permanently_failed);
                }
                warn!("no job ready to run but work remains: stopping");
                return Err(EngineError::PipelineFailed);
            }

            if self.interrupt.level() >= 2 {
                return Err(EngineError::Interrupted);
            }

            let (ticket, report) = self.queue.wait().await?;
            let Some((handle, env)) = in_flight.remove(&ticket) else {
                continue;
            };
            let job_name = instance.graph.instance(&handle)?.job_name.clone();
            let node = instance.graph.instance(&handle)?.node.clone();
            let job_id = format!("{job_name}{}", node.displayname());

            match &report.result {
                Ok(()) => {
                    instance.graph.instance(&handle)?.finish(&env, false)?;
                    let needs_regen = instance.graph.notify_completed(&handle, JobOutcome::Success)?;
                    retries.remove(&job_id);
                    info!(
                        job = %job_name,
                        node = %node,
                        host = %report.host,
                        duration_ms = report.duration.as_millis(),
                        finished_at = %report.finished_at,
                        "job completed"
                    );
                    if needs_regen {
                        instance
                            .graph
                            .regenerate_with(self.options.rerun, self.options.repopulate)?;
                    }
                }
                Err(e) => {
                    let state = retries.entry(job_id.clone()).or_default();
                    state.attempts += 1;
                    let budget = *self.retry_budget.get(&job_name).unwrap_or(&0);
                    warn!(
                        job = %job_name,
                        node = %node,
                        host = %report.host,
                        attempt = state.attempts,
                        error = %e,
                        "job failed"
                    );
                    if state.attempts > budget {
                        any_permanently_failed = true;
                        instance.graph.mark_failed(&handle)?;
                        warn!(job = %job_name, node = %node, "retry budget exhausted");
                    } else {
                        instance.graph.notify_completed(&handle, JobOutcome::Failure)?;
                    }
                }
            }

            if any_permanently_failed && in_flight.is_empty() && instance.graph.is_empty_of_ready_work() {
                return Err(EngineError::PipelineFailed);
            }
        }
    }

    /// Runs a `ChangeAxis` or `SubWorkflow` instance synchronously in the main
    /// loop, bypassing the execution queue entirely (§4.5, §5). Sub-workflows
    /// always recurse on a fresh [`LocalThreadQueue`], regardless of the
    /// parent scheduler's own queue, since nested coordination is purely
    /// in-process bookkeeping rather than remote dispatch.
    async fn run_inline(
        &mut self,
        instance: &mut WorkflowInstance,
        handle: crate::graph::JobHandle,
    ) -> EngineResult<()> {
        use crate::job::JobKind;
        let job = instance.graph.instance(&handle)?;
        match &job.kind {
            JobKind::ChangeAxis { .. } => {
                info!(job = %job.job_name, node = %job.node, "running change-axis inline");
                job.run_change_axis(instance.graph.node_manager(), instance.graph.resource_manager())?;
                instance.graph.notify_completed(&handle, JobOutcome::Success)?;
                // A change-axis always materialises `to_axis`'s chunk set via
                // the node manager directly (not through a `Chunks`-kind
                // `ret`), so `triggers_regenerate` never sees it; regenerate
                // unconditionally so jobs keyed on the new axis can appear.
                instance
                    .graph
                    .regenerate_with(self.options.rerun, self.options.repopulate)?;
            }
            JobKind::SubWorkflow => {
                info!(job = %job.job_name, node = %job.node, "expanding sub-workflow");
                match job.build_subworkflow()? {
                    None => {
                        instance.graph.notify_completed(&handle, JobOutcome::Success)?;
                    }
                    Some(def) => {
                        let sub_dir = instance
                            .layout
                            .root
                            .join("sub")
                            .join(job.node.subdir())
                            .join(&job.job_name);
                        let mut sub_instance = WorkflowInstance::open(def.clone(), &sub_dir)?;
                        let mut sub_scheduler =
                            Scheduler::new(&def.jobs, LocalThreadQueue::new(), self.options.clone());
                        let outcome = sub_scheduler.run(&mut sub_instance).await;
                        sub_instance.close()?;
                        match outcome {
                            Ok(()) => {
                                instance.graph.notify_completed(&handle, JobOutcome::Success)?;
                            }
                            Err(e) => {
                                warn!(job = %job.job_name, node = %job.node, error = %e, "sub-workflow failed");
                                instance.graph.notify_completed(&handle, JobOutcome::Failure)?;
                                return Err(e);
                            }
                        }
                    }
                }
            }
            _ => unreachable!("run_inline called on a non-inline job kind"),
        }
        Ok(())
    }

    fn finish(&self, instance: &WorkflowInstance, any_permanently_failed: bool) -> EngineResult<()> {
        if any_permanently_failed {
            return Err(EngineError::PipelineFailed);
        }
        if self.options.cleanup {
            let removed = instance.graph.cleanup_temporaries()?;
            if removed > 0 {
                info!(removed, "cleaned up temporary resources");
            }
        }
        Ok(())
    }
}
