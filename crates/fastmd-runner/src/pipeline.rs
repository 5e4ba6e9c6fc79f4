use crate::errors::StageError;
use crate::job::{Ensemble, ParamSet, StageSpec};
use crate::resolve::PreparedInput;
use crate::sweep::RunVariant;
use chrono::Utc;
use fastmd_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use serde_json::json;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

pub const STAGE_OK: &str = "stage.ok";
pub const DONE_OK: &str = "done.ok";
pub const STAGE_STATE: &str = "stage_state.json";
pub const RUN_STATE: &str = "run_state.json";
pub const STAGE_SPEC_FILE: &str = "stage.json";
pub const CHECKPOINT_FILE: &str = "state.chk";

/// Fully resolved parameters for one stage of one run.
#[derive(Debug, Clone)]
pub struct StageParams {
    pub name: String,
    pub steps: u64,
    pub ensemble: Option<Ensemble>,
    pub params: ParamSet,
}

impl StageParams {
    pub fn resolve(run: &RunVariant, stage: &StageSpec) -> StageParams {
        StageParams {
            name: stage.name.clone(),
            steps: stage.steps,
            ensemble: stage.ensemble,
            params: run.params.merged(&stage.overrides),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "steps": self.steps,
            "ensemble": self.ensemble.map(|e| e.as_str()),
            "params": self.params,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    /// Checkpoint the engine produced, handed to the next stage as its
    /// resume point.
    pub checkpoint: Option<PathBuf>,
}

/// How one whole run ended, from this invocation's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    SkippedAlreadyDone,
}

/// Engine seam. The shipped implementation shells out to the simulation
/// engine; tests substitute an in-process fake.
pub trait StageEngine {
    fn run_stage(
        &self,
        input: &PreparedInput,
        stage: &StageParams,
        stage_dir: &Path,
        resume: Option<&Path>,
    ) -> Result<StageOutcome, StageError>;
}

/// Engine that spawns an external command per stage. The command receives a
/// single argument, the path of a JSON file describing the stage, and is
/// expected to leave its artifacts in the stage directory.
#[derive(Default)]
pub struct CommandEngine {
    /// Explicit command; when `None` the command is derived from the merged
    /// `engine` parameter (`openmm` becomes `fastmd-openmm`).
    pub engine_cmd: Option<String>,
}

impl CommandEngine {
    fn command_for(&self, stage: &StageParams) -> String {
        match &self.engine_cmd {
            Some(cmd) => cmd.clone(),
            None => format!("fastmd-{}", stage.params.get_str("engine", "openmm")),
        }
    }
}

fn input_json(input: &PreparedInput) -> serde_json::Value {
    match input {
        PreparedInput::SolvatedPdb { pdb } => json!({"kind": "pdb", "pdb": pdb}),
        PreparedInput::Amber { prmtop, coords } => {
            json!({"kind": "amber", "prmtop": prmtop, "coords": coords})
        }
        PreparedInput::Gromacs {
            top,
            coords,
            itp,
            include_dirs,
        } => json!({
            "kind": "gromacs",
            "top": top,
            "coords": coords,
            "itp": itp,
            "include_dirs": include_dirs,
        }),
        PreparedInput::Charmm {
            psf,
            params,
            coords,
        } => json!({"kind": "charmm", "psf": psf, "params": params, "coords": coords}),
    }
}

impl StageEngine for CommandEngine {
    fn run_stage(
        &self,
        input: &PreparedInput,
        stage: &StageParams,
        stage_dir: &Path,
        resume: Option<&Path>,
    ) -> Result<StageOutcome, StageError> {
        let command = self.command_for(stage);
        let payload = json!({
            "stage": stage.to_json(),
            "input": input_json(input),
            "resume": resume,
            "output_dir": stage_dir,
        });
        let input_path = stage_dir.join("engine_input.json");
        atomic_write_json_pretty(&input_path, &payload).map_err(|e| StageError::Spawn {
            stage: stage.name.clone(),
            command: command.clone(),
            message: e.to_string(),
        })?;

        let mut cmd = Command::new(&command);
        cmd.arg(&input_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|e| StageError::Spawn {
            stage: stage.name.clone(),
            command: command.clone(),
            message: e.to_string(),
        })?;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => info!("[{}] {}", command, line),
                    Err(_) => break,
                }
            }
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(StageError::EngineFailed {
                stage: stage.name.clone(),
                status: status.to_string(),
            });
        }
        let chk = stage_dir.join(CHECKPOINT_FILE);
        Ok(StageOutcome {
            checkpoint: chk.is_file().then_some(chk),
        })
    }
}

/// Writes `stage_state.json` as `running` on creation and flips it to
/// `failed` on drop unless `complete()` ran first, so a crash mid-stage is
/// visible in the tree.
struct StageStateGuard {
    path: PathBuf,
    stage: String,
    time_start: String,
    completed: bool,
}

impl StageStateGuard {
    fn begin(stage_dir: &Path, stage: &str) -> Result<Self, StageError> {
        let guard = Self {
            path: stage_dir.join(STAGE_STATE),
            stage: stage.to_string(),
            time_start: Utc::now().to_rfc3339(),
            completed: false,
        };
        guard.write("running", None)?;
        Ok(guard)
    }

    fn write(&self, status: &str, time_end: Option<String>) -> Result<(), StageError> {
        let state = json!({
            "stage": self.stage,
            "status": status,
            "time_start": self.time_start,
            "time_end": time_end,
        });
        atomic_write_json_pretty(&self.path, &state)
            .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))
    }

    fn complete(mut self) -> Result<(), StageError> {
        self.completed = true;
        self.write("completed", Some(Utc::now().to_rfc3339()))
    }
}

impl Drop for StageStateGuard {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.write("failed", Some(Utc::now().to_rfc3339()));
        }
    }
}

fn write_run_state(run_dir: &Path, run_id: &str, status: &str) -> Result<(), StageError> {
    let state = json!({
        "run_id": run_id,
        "status": status,
        "time": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join(RUN_STATE), &state)
        .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))
}

/// First stage without a completion marker; everything before it is trusted.
fn resume_index(run_dir: &Path, stages: &[StageSpec]) -> usize {
    for (idx, stage) in stages.iter().enumerate() {
        if !run_dir.join(&stage.name).join(STAGE_OK).is_file() {
            return idx;
        }
    }
    stages.len()
}

/// Drive one run through its stage pipeline. Idempotent: a run whose
/// `done.ok` exists is skipped, and a partially completed run restarts at the
/// first stage without `stage.ok`.
pub fn execute_run(
    run: &RunVariant,
    stages: &[StageSpec],
    run_dir: &Path,
    prepared: &PreparedInput,
    engine: &dyn StageEngine,
) -> Result<RunOutcome, StageError> {
    if run_dir.join(DONE_OK).is_file() {
        info!("run {}: already complete, skipping", run.run_id);
        return Ok(RunOutcome::SkippedAlreadyDone);
    }
    ensure_dir(run_dir).map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))?;
    write_run_state(run_dir, &run.run_id, "running")?;

    let start = resume_index(run_dir, stages);
    if start == stages.len() {
        // interrupted between the last stage's marker and the terminal
        // marker; nothing left to execute
        write_run_state(run_dir, &run.run_id, "completed")?;
        atomic_write_bytes(&run_dir.join(DONE_OK), b"ok\n")
            .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))?;
        return Ok(RunOutcome::Completed);
    }
    if start > 0 {
        info!(
            "run {}: resuming at stage '{}'",
            run.run_id, stages[start].name
        );
    }

    // completed stages are trusted as-is; a missing checkpoint just means
    // the engine starts the next stage without one
    let mut checkpoint: Option<PathBuf> = if start > 0 {
        let chk = run_dir.join(&stages[start - 1].name).join(CHECKPOINT_FILE);
        chk.is_file().then_some(chk)
    } else {
        None
    };

    for stage in &stages[start..] {
        let stage_dir = run_dir.join(&stage.name);
        ensure_dir(&stage_dir)
            .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))?;
        let params = StageParams::resolve(run, stage);
        atomic_write_json_pretty(&stage_dir.join(STAGE_SPEC_FILE), &params.to_json())
            .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))?;

        info!(
            "run {}: stage '{}' ({} steps)",
            run.run_id, stage.name, stage.steps
        );
        let guard = StageStateGuard::begin(&stage_dir, &stage.name)?;
        let outcome = engine.run_stage(prepared, &params, &stage_dir, checkpoint.as_deref())?;
        guard.complete()?;
        // marker last: everything the stage produced is on disk before it
        atomic_write_bytes(&stage_dir.join(STAGE_OK), b"ok\n")
            .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))?;

        checkpoint = outcome
            .checkpoint
            .or_else(|| {
                let chk = stage_dir.join(CHECKPOINT_FILE);
                chk.is_file().then_some(chk)
            });
    }

    write_run_state(run_dir, &run.run_id, "completed")?;
    atomic_write_bytes(&run_dir.join(DONE_OK), b"ok\n")
        .map_err(|e| StageError::Io(std::io::Error::other(e.to_string())))?;
    Ok(RunOutcome::Completed)
}
