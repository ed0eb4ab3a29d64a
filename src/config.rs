//! Layered application configuration: defaults, overridden by an optional
//! TOML file, overridden again by `LATTICEFLOW_*` environment variables.
//! Mirrors the `load_config` / `apply_env_overrides` / `validate_config`
//! pipeline the teacher's configuration crates use.

use crate::error::{EngineError, EngineResult};
use crate::scheduler::SchedulerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application configuration: where the pipeline lives on disk and
/// how the scheduler should drive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub pipeline_dir: PathBuf,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
}

/// TOML-serialisable mirror of [`SchedulerOptions`] (kept distinct from the
/// runtime type since the runtime type is constructed from this plus CLI
/// flag overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_jobs: usize,
    pub rerun: bool,
    pub repopulate: bool,
    pub cleanup: bool,
    pub prune: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let opts = SchedulerOptions::default();
        Self {
            max_jobs: opts.max_jobs,
            rerun: opts.rerun,
            repopulate: opts.repopulate,
            cleanup: opts.cleanup,
            prune: opts.prune,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(c: &SchedulerConfig) -> Self {
        SchedulerOptions {
            max_jobs: c.max_jobs,
            rerun: c.rerun,
            repopulate: c.repopulate,
            cleanup: c.cleanup,
            prune: c.prune,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline_dir: PathBuf::from("./pipeline"),
            log_level: "info".to_string(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads defaults, then a TOML file if `path` is given and exists, then
    /// applies `LATTICEFLOW_*` environment overrides, then validates.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| EngineError::UnknownResource(format!("invalid config {}: {e}", path.display())))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LATTICEFLOW_PIPELINE_DIR") {
            self.pipeline_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("LATTICEFLOW_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(v) = std::env::var("LATTICEFLOW_MAX_JOBS") {
            if let Ok(n) = v.parse() {
                self.scheduler.max_jobs = n;
            }
        }
        if let Ok(v) = std::env::var("LATTICEFLOW_RERUN") {
            self.scheduler.rerun = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("LATTICEFLOW_CLEANUP") {
            self.scheduler.cleanup = parse_bool(&v);
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.scheduler.max_jobs == 0 {
            return Err(EngineError::UnknownResource(
                "scheduler.max_jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
