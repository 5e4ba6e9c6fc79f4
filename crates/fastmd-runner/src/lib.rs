//! Multi-stage simulation workflow runner: parses a declarative job
//! document, expands parameter sweeps into runs, prepares each system's
//! input files, drives every run through its stage pipeline with
//! checkpoint/resume, and keeps a provenance record under the output root.

pub mod errors;
pub mod job;
pub mod pipeline;
pub mod plan;
pub mod provenance;
pub mod resolve;
pub mod sweep;

pub use errors::{ConfigError, LayoutError, PreparationError, RunnerError, StageError};
pub use job::{JobSpec, ParamSet, ParamValue};
pub use pipeline::{CommandEngine, RunOutcome, StageEngine};
pub use plan::{plan_job, Plan};
pub use resolve::{CommandPreparer, PreparedInput, Preparer};
pub use sweep::RunVariant;

use fastmd_core::canonical_json_digest;
use provenance::{base_versions, Layout, MetaSeed};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// How long a finishing invocation waits for `meta.lock`.
pub const META_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const AUTO_JOB_FILE: &str = "job.auto.yml";

/// Facts about this invocation recorded into meta.json.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub cli_argv: Vec<String>,
    pub versions: BTreeMap<String, String>,
}

impl Default for Invocation {
    fn default() -> Self {
        Self {
            cli_argv: std::env::args().collect(),
            versions: base_versions(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Preparation,
    Stage,
}

#[derive(Debug, Clone)]
pub struct FailedRun {
    pub run_id: String,
    pub stage: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// Per-run outcomes of one invocation. Individual failures land here rather
/// than aborting the job, so sibling runs still make progress.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedRun>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn has_stage_failure(&self) -> bool {
        self.failed.iter().any(|f| f.kind == FailureKind::Stage)
    }

    pub fn has_preparation_failure(&self) -> bool {
        self.failed
            .iter()
            .any(|f| f.kind == FailureKind::Preparation)
    }
}

/// Execute every run of a parsed job. The job document text is copied into
/// the project directory verbatim for provenance.
pub fn run_job(
    job: &JobSpec,
    job_document: &str,
    output_root: &Path,
    preparer: &dyn Preparer,
    engine: &dyn StageEngine,
    invocation: &Invocation,
) -> Result<RunReport, RunnerError> {
    // everything fallible-by-configuration happens before any side effect
    let variants = sweep::expand(job)?;

    let layout = Layout::new(output_root, &job.project);
    layout.ensure()?;
    fastmd_core::atomic_write_bytes(&layout.job_copy(), job_document.as_bytes()).map_err(|e| {
        LayoutError::UnwritableRoot {
            path: layout.project_dir.clone(),
            message: e.to_string(),
        }
    })?;

    let seed = MetaSeed {
        config_sha256: canonical_json_digest(&job.canonical_value()),
        cli_argv: invocation.cli_argv.clone(),
        versions: invocation.versions.clone(),
    };
    provenance::begin_meta(&layout, &seed, META_LOCK_TIMEOUT)?;

    let merged_defaults = job.merged_defaults();
    resolve::mirror_forcefields(&layout.inputs_dir(), &merged_defaults);

    // each system is prepared once and shared by all of its sweep points
    let mut prepared: BTreeMap<String, PreparedInput> = BTreeMap::new();
    let mut report = RunReport::default();
    for system in &job.systems {
        let sys_params = merged_defaults.merged(&system.overrides);
        match resolve::resolve_system(system, &sys_params, &layout.build_dir(), preparer) {
            Ok(input) => {
                resolve::mirror_inputs(&layout.inputs_dir(), &system.id, &input);
                prepared.insert(system.id.clone(), input);
            }
            Err(e) => {
                warn!("system {}: preparation failed: {}", system.id, e);
                let message = e.to_string();
                for variant in variants.iter().filter(|v| v.system.id == system.id) {
                    provenance::record_run_outcome(
                        &layout,
                        &variant.run_id,
                        "failed",
                        Some(&message),
                        META_LOCK_TIMEOUT,
                    )?;
                    report.failed.push(FailedRun {
                        run_id: variant.run_id.clone(),
                        stage: None,
                        kind: FailureKind::Preparation,
                        message: message.clone(),
                    });
                }
            }
        }
    }

    for variant in &variants {
        let Some(input) = prepared.get(&variant.system.id) else {
            continue;
        };
        let run_dir = layout.run_dir(&variant.run_id);
        match pipeline::execute_run(variant, &job.stages, &run_dir, input, engine) {
            Ok(RunOutcome::Completed) => {
                info!("run {}: completed", variant.run_id);
                provenance::record_run_outcome(
                    &layout,
                    &variant.run_id,
                    "completed",
                    None,
                    META_LOCK_TIMEOUT,
                )?;
                report.completed.push(variant.run_id.clone());
            }
            Ok(RunOutcome::SkippedAlreadyDone) => {
                provenance::record_run_outcome(
                    &layout,
                    &variant.run_id,
                    "skipped",
                    None,
                    META_LOCK_TIMEOUT,
                )?;
                report.skipped.push(variant.run_id.clone());
            }
            Err(e) => {
                warn!("run {}: {}", variant.run_id, e);
                provenance::record_run_outcome(
                    &layout,
                    &variant.run_id,
                    "failed",
                    Some(&e.to_string()),
                    META_LOCK_TIMEOUT,
                )?;
                report.failed.push(FailedRun {
                    run_id: variant.run_id.clone(),
                    stage: e.stage().map(str::to_string),
                    kind: FailureKind::Stage,
                    message: e.to_string(),
                });
            }
        }
    }

    provenance::finalize_meta(&layout, META_LOCK_TIMEOUT)?;
    Ok(report)
}

/// Read, parse and execute a job file.
pub fn run_from_yaml(
    path: &Path,
    output_root: &Path,
    preparer: &dyn Preparer,
    engine: &dyn StageEngine,
    invocation: &Invocation,
) -> Result<RunReport, RunnerError> {
    let document = read_document(path)?;
    let job = JobSpec::from_yaml_str(&document)?;
    run_job(&job, &document, output_root, preparer, engine, invocation)
}

/// Build the job a single structure file implies, deep-merging an optional
/// overrides document on top, without touching the filesystem.
pub fn auto_job_for(
    structure: &Path,
    overrides_path: Option<&Path>,
) -> Result<(JobSpec, String), RunnerError> {
    let mut value = job::auto_job_value(structure);
    if let Some(path) = overrides_path {
        let text = read_document(path)?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| {
            ConfigError::single(format!("overrides document is not valid YAML: {}", e))
        })?;
        let patch = serde_json::to_value(yaml)
            .map_err(|e| ConfigError::single(format!("overrides conversion failed: {}", e)))?;
        fastmd_core::deep_update(&mut value, &patch);
    }
    let document = serde_yaml::to_string(&value)
        .map_err(|e| ConfigError::single(format!("job rendering failed: {}", e)))?;
    let job = JobSpec::parse_value(value)?;
    Ok((job, document))
}

/// Single-structure shorthand: synthesize the default job for one PDB file,
/// persist it under `_build/` for inspection, and execute it.
pub fn simulate_from_pdb(
    structure: &Path,
    overrides_path: Option<&Path>,
    output_root: &Path,
    preparer: &dyn Preparer,
    engine: &dyn StageEngine,
    invocation: &Invocation,
) -> Result<RunReport, RunnerError> {
    let (job, document) = auto_job_for(structure, overrides_path)?;
    let layout = Layout::new(output_root, &job.project);
    layout.ensure()?;
    fastmd_core::atomic_write_bytes(
        &layout.build_dir().join(AUTO_JOB_FILE),
        document.as_bytes(),
    )
    .map_err(|e| LayoutError::UnwritableRoot {
        path: layout.project_dir.clone(),
        message: e.to_string(),
    })?;
    run_job(&job, &document, output_root, preparer, engine, invocation)
}

/// Write the commented example job file.
pub fn init_job_file(path: &Path, force: bool) -> Result<PathBuf, RunnerError> {
    if path.exists() && !force {
        return Err(RunnerError::ReadJob {
            path: path.to_path_buf(),
            message: "already exists (use --force to overwrite)".to_string(),
        });
    }
    fastmd_core::atomic_write_bytes(path, job::example_job_yaml().as_bytes()).map_err(|e| {
        RunnerError::ReadJob {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    Ok(path.to_path_buf())
}

fn read_document(path: &Path) -> Result<String, RunnerError> {
    fs::read_to_string(path).map_err(|e| RunnerError::ReadJob {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
