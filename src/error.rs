//! Error types for the workflow graph engine

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error taxonomy for the workflow engine (see design doc §7)
#[derive(Error, Debug)]
pub enum EngineError {
    /// Graph regeneration found a back edge while walking job dependencies
    #[error("dependency cycle detected: {}", .jobs.join(" -> "))]
    DependencyCycle { jobs: Vec<String> },

    /// Two job instances declared the same output resource
    #[error("duplicate output {resource} produced by both {first} and {second}")]
    DuplicateOutput {
        resource: String,
        first: String,
        second: String,
    },

    /// A managed argument's axes are not a subset of its job's axes
    #[error("job {job} argument axes {arg_axes:?} are not a subset of job axes {job_axes:?}")]
    JobArgMismatch {
        job: String,
        arg_axes: Vec<String>,
        job_axes: Vec<String>,
    },

    /// A split job redefined its chunk set inconsistently with already-committed downstream work
    #[error("axis {axis} chunks changed from {old:?} to {new:?} after downstream work committed")]
    AxisChunksMismatch {
        axis: String,
        old: Vec<String>,
        new: Vec<String>,
    },

    /// A submitted job exhausted its retry budget
    #[error("job {0} failed and exhausted its retry budget")]
    IncompleteJob(String),

    /// The execution queue failed to hand back a completed callable
    #[error("execution queue failed to receive completion for {0}")]
    ReceiveError(String),

    /// The pipeline lock directory already exists
    #[error("pipeline already running, remove {0} to override")]
    PipelineAlreadyRunning(String),

    /// The pipeline completed its drain with at least one fatal job failure
    #[error("pipeline failed")]
    PipelineFailed,

    /// No node is defined for a referenced axis (not yet materialised by its split job)
    #[error("axis {0} is not yet materialised")]
    AxisUndefined(String),

    /// A resource was looked up that neither the graph nor the node manager knows about
    #[error("unknown resource {0}")]
    UnknownResource(String),

    /// The engine was interrupted (first Ctrl-C: stop submitting; second: cancel drain)
    #[error("pipeline interrupted")]
    Interrupted,

    #[error("shelf error: {0}")]
    Shelf(#[from] sled::Error),

    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("key encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
