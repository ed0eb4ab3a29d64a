//! latticeflow: a dependency-driven execution engine for multi-axis workflow
//! graphs. A workflow is a set of job definitions, each fanned out over zero
//! or more axes into per-node instances; the engine tracks which instances
//! are out of date against their recorded inputs/outputs and drives them to
//! completion over a pluggable execution queue.
//!
//! The top-level entry point for most callers is [`workflow::WorkflowInstance`]
//! paired with [`scheduler::Scheduler`].

pub mod arg;
pub mod axis;
pub mod config;
pub mod error;
pub mod graph;
pub mod job;
pub mod lock;
pub mod node;
pub mod queue;
pub mod resource;
pub mod scheduler;
pub mod shelf;
pub mod workflow;

pub use axis::{Axis, Chunk, ChunkSet};
pub use config::AppConfig;
pub use error::{EngineError, EngineResult};
pub use graph::{JobHandle, JobOutcome, WorkflowGraph};
pub use job::{JobContext, JobDefinition, JobEnv, JobInstance, JobKind};
pub use lock::PipelineLock;
pub use node::{Node, NodeManager};
pub use queue::{ExecutionQueue, LocalThreadQueue, Ticket};
pub use resource::{Resource, ResourceKey, ResourceManager};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use workflow::{PipelineLayout, WorkflowDefinition, WorkflowInstance};
