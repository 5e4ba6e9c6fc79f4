use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed or incomplete job document. Carries every violation found so a
/// job file can be fixed in one pass; fatal before any side effect occurs.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub violations: Vec<String>,
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            violations: vec![message.into()],
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "invalid job specification:")?;
        for v in &self.violations {
            writeln!(f, "  - {}", v)?;
        }
        Ok(())
    }
}

/// Repair or solvation failure. Fatal for one run variant only.
#[derive(Debug, Error)]
pub enum PreparationError {
    #[error("structure repair failed for {input}: {message}")]
    Repair { input: PathBuf, message: String },
    #[error("solvation failed for {input}: {message}")]
    Solvation { input: PathBuf, message: String },
    #[error("declared input file not found: {path} (field '{field}')")]
    MissingInput { field: &'static str, path: PathBuf },
    #[error("preparation i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine failure mid-stage. Fatal for the owning run variant; partial
/// artifacts are left in place for post-mortem inspection.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{stage}' failed: engine exited with status {status}")]
    EngineFailed { stage: String, status: String },
    #[error("stage '{stage}' failed to start engine '{command}': {message}")]
    Spawn {
        stage: String,
        command: String,
        message: String,
    },
    #[error("stage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stage state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StageError {
    pub fn stage(&self) -> Option<&str> {
        match self {
            StageError::EngineFailed { stage, .. } | StageError::Spawn { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }
}

/// Path collision or unwritable output root. Fatal for the whole job since
/// provenance integrity cannot be guaranteed.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("run id collision: '{run_id}' produced by systems '{first}' and '{second}'")]
    RunIdCollision {
        run_id: String,
        first: String,
        second: String,
    },
    #[error("output root not writable: {path}: {message}")]
    UnwritableRoot { path: PathBuf, message: String },
    #[error("provenance lock not acquired within timeout: {path}")]
    LockTimeout { path: PathBuf },
    #[error("layout i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level failure of a whole invocation. Per-variant preparation and stage
/// failures do NOT surface here; they are aggregated in the run report.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("job document read error for {path}: {message}")]
    ReadJob { path: PathBuf, message: String },
}
