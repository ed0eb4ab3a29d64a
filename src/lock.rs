//! Directory-based mutual exclusion over a pipeline directory, mirroring the
//! original `os.mkdir`-as-atomic-lock implementation (`pypeliner.helpers`).

use crate::error::{EngineError, EngineResult};
use std::path::{Path, PathBuf};

/// Holds an exclusively-acquired pipeline lock for the lifetime of the
/// value; the lock directory is removed on drop.
pub struct PipelineLock {
    path: PathBuf,
    released: bool,
}

impl PipelineLock {
    /// Attempts to atomically create the lock directory at `path`. `mkdir`
    /// fails with `AlreadyExists` if another run holds it concurrently.
    pub fn acquire(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(Self {
                path,
                released: false,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                EngineError::PipelineAlreadyRunning(path.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Forcibly removes a lock left behind by a crashed run. Used by the
    /// `unlock` CLI subcommand.
    pub fn force_unlock(path: &Path) -> EngineResult<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn release(mut self) -> EngineResult<()> {
        self.released = true;
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
