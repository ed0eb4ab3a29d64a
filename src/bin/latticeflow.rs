//! `latticeflow` CLI: the ambient interface to run, inspect and unlock
//! pipelines built directly against the library. The CLI is not a workflow
//! DSL — a real pipeline is assembled in Rust against `latticeflow::*` and
//! driven the same way `run` drives the small demo workflow built in here.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use latticeflow::arg::{ArgValue, Direction, ManagedPlaceholder};
use latticeflow::job::{ArgSpec, JobDefinition, JobKind};
use latticeflow::node::Node;
use latticeflow::{AppConfig, PipelineLock, Scheduler, WorkflowDefinition, WorkflowInstance};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "latticeflow")]
#[command(about = "Dependency-driven execution engine for multi-axis workflow graphs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file; falls back to defaults plus env overrides.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `RUST_LOG` / the config's `log_level` when set.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the embedded demo workflow to completion against a pipeline directory.
    Run {
        /// Pipeline directory; overrides the config's `pipeline_dir` when given.
        pipeline_dir: Option<PathBuf>,
        /// Force every job to be treated as out of date.
        #[arg(long)]
        rerun: bool,
        /// Force jobs whose declared outputs are missing on disk to rerun.
        #[arg(long)]
        repopulate: bool,
    },
    /// Print why a job at the workflow root is (or isn't) out of date.
    Explain {
        pipeline_dir: PathBuf,
        job_name: String,
    },
    /// Remove a stale lock directory left behind by a crashed run.
    Unlock { pipeline_dir: PathBuf },
}

fn demo_workflow() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new("demo");
    def.add(JobDefinition {
        name: "write_greeting".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![ArgSpec::Managed(ManagedPlaceholder::TempFile {
            name: "greeting".to_string(),
            axes: vec![],
            direction: Direction::Out,
        })],
        ret: None,
        kind: JobKind::Transform,
        func: Some(Arc::new(|_env, args| {
            if let ArgValue::Path(p) = &args[0] {
                std::fs::write(p, b"hello from latticeflow\n")?;
            }
            Ok(None)
        })),
        subworkflow: None,
    });
    def.add(JobDefinition {
        name: "shout".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::TempFile {
                name: "greeting".to_string(),
                axes: vec![],
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::TempFile {
                name: "greeting.shout".to_string(),
                axes: vec![],
                direction: Direction::Out,
            }),
        ],
        ret: None,
        kind: JobKind::Transform,
        func: Some(Arc::new(|_env, args| {
            let (ArgValue::Path(src), ArgValue::Path(dst)) = (&args[0], &args[1]) else {
                return Ok(None);
            };
            let text = std::fs::read_to_string(src)?;
            std::fs::write(dst, text.to_uppercase())?;
            Ok(None)
        })),
        subworkflow: None,
    });
    def
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Run {
            pipeline_dir,
            rerun,
            repopulate,
        } => {
            let pipeline_dir = pipeline_dir.unwrap_or(config.pipeline_dir.clone());
            let lock_path = pipeline_dir.join("db").join("lock");
            std::fs::create_dir_all(pipeline_dir.join("db"))?;
            let lock = PipelineLock::acquire(&lock_path).context("acquiring pipeline lock")?;

            let mut options = latticeflow::SchedulerOptions::from(&config.scheduler);
            options.rerun = options.rerun || rerun;
            options.repopulate = options.repopulate || repopulate;

            let def = demo_workflow();
            let job_defs = def.jobs.clone();
            let mut instance =
                WorkflowInstance::open(def, &pipeline_dir).context("opening workflow instance")?;
            let mut scheduler =
                Scheduler::new(&job_defs, latticeflow::LocalThreadQueue::new(), options);
            let result = scheduler.run(&mut instance).await;
            instance.close().context("closing workflow instance")?;
            lock.release().context("releasing pipeline lock")?;
            result.context("running workflow")?;
            info!("pipeline complete");
            Ok(())
        }
        Commands::Explain {
            pipeline_dir,
            job_name,
        } => {
            let mut instance = WorkflowInstance::open(demo_workflow(), &pipeline_dir)
                .context("opening workflow instance")?;
            instance.graph.regenerate().context("regenerating workflow graph")?;
            let explanation = instance
                .graph
                .explain(&job_name, &Node::root())
                .context("explaining job state")?;
            println!("{explanation}");
            instance.close()?;
            Ok(())
        }
        Commands::Unlock { pipeline_dir } => {
            let lock_path = pipeline_dir.join("db").join("lock");
            PipelineLock::force_unlock(&lock_path).context("removing lock directory")?;
            println!("removed lock at {}", lock_path.display());
            Ok(())
        }
    }
}
