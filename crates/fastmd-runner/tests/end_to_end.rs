use chrono::Utc;
use fastmd_runner::errors::{PreparationError, StageError};
use fastmd_runner::pipeline::{StageEngine, StageOutcome, StageParams, CHECKPOINT_FILE, DONE_OK};
use fastmd_runner::resolve::{PreparedInput, Preparer, SolvationParams};
use fastmd_runner::{Invocation, JobSpec, RunnerError};
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "fastmd_e2e_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

struct FakePreparer;

impl Preparer for FakePreparer {
    fn repair_structure(
        &self,
        _raw: &Path,
        fixed: &Path,
        _ph: f64,
        _strict: bool,
    ) -> Result<(), PreparationError> {
        fs::write(fixed, b"FIXED\n")?;
        Ok(())
    }

    fn solvate_and_ionize(
        &self,
        _fixed: &Path,
        solvated: &Path,
        _params: &SolvationParams,
    ) -> Result<(), PreparationError> {
        fs::write(solvated, b"SOLVATED\n")?;
        Ok(())
    }
}

/// Counts stage invocations; fails any stage whose directory path contains
/// one of the configured markers.
struct FakeEngine {
    calls: RefCell<Vec<PathBuf>>,
    fail_if_path_contains: Option<String>,
}

impl FakeEngine {
    fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            fail_if_path_contains: None,
        }
    }

    fn failing_on(marker: &str) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            fail_if_path_contains: Some(marker.to_string()),
        }
    }
}

impl StageEngine for FakeEngine {
    fn run_stage(
        &self,
        _input: &PreparedInput,
        stage: &StageParams,
        stage_dir: &Path,
        _resume: Option<&Path>,
    ) -> Result<StageOutcome, StageError> {
        self.calls.borrow_mut().push(stage_dir.to_path_buf());
        if let Some(marker) = &self.fail_if_path_contains {
            if stage_dir.to_string_lossy().contains(marker.as_str()) {
                return Err(StageError::EngineFailed {
                    stage: stage.name.clone(),
                    status: "exit status: 1".to_string(),
                });
            }
        }
        let chk = stage_dir.join(CHECKPOINT_FILE);
        fs::write(&chk, b"CHK")?;
        Ok(StageOutcome {
            checkpoint: Some(chk),
        })
    }
}

fn write_inputs(root: &Path, names: &[&str]) {
    fs::create_dir_all(root).unwrap();
    for name in names {
        fs::write(root.join(name), b"ATOM\n").unwrap();
    }
}

fn two_by_two_job(input_root: &Path) -> String {
    format!(
        "\
project: p
stages:
  - name: nvt
    steps: 100
    ensemble: NVT
  - name: production
    steps: 200
    ensemble: NPT
systems:
  - id: protA
    pdb: {root}/a.pdb
  - id: protB
    pdb: {root}/b.pdb
sweep:
  temperature_K: [300, 310]
",
        root = input_root.display()
    )
}

fn read_meta(out: &Path) -> Value {
    serde_json::from_slice(&fs::read(out.join("p").join("meta.json")).unwrap()).unwrap()
}

#[test]
fn full_job_runs_every_variant_and_records_provenance() {
    let root = temp_root("full");
    let inputs = root.join("in");
    write_inputs(&inputs, &["a.pdb", "b.pdb"]);
    let job_path = root.join("job.yml");
    fs::write(&job_path, two_by_two_job(&inputs)).unwrap();
    let out = root.join("out");

    let engine = FakeEngine::new();
    let report = fastmd_runner::run_from_yaml(
        &job_path,
        &out,
        &FakePreparer,
        &engine,
        &Invocation::default(),
    )
    .expect("run");

    assert_eq!(report.completed.len(), 4);
    assert!(report.failed.is_empty());
    // 4 runs x 2 stages, each system prepared once
    assert_eq!(engine.calls.borrow().len(), 8);

    let project = out.join("p");
    assert!(project.join("job.yml").is_file());
    assert!(project.join("_build").join("protA_solvated.pdb").is_file());
    assert!(project
        .join("inputs")
        .join("protA")
        .join("protA_solvated.pdb")
        .is_file());
    for run_id in ["protA_T300", "protA_T310", "protB_T300", "protB_T310"] {
        assert!(project.join(run_id).join(DONE_OK).is_file(), "{}", run_id);
    }

    let meta = read_meta(&out);
    assert_eq!(meta["runs"]["protA_T310"]["outcome"], "completed");
    assert!(meta["config_sha256"]
        .as_str()
        .unwrap()
        .starts_with("sha256:"));
    assert!(meta["time_end"].is_i64());
    assert!(!project.join("meta.lock").exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn second_invocation_skips_finished_runs() {
    let root = temp_root("idempotent");
    let inputs = root.join("in");
    write_inputs(&inputs, &["a.pdb", "b.pdb"]);
    let job_path = root.join("job.yml");
    fs::write(&job_path, two_by_two_job(&inputs)).unwrap();
    let out = root.join("out");

    let engine = FakeEngine::new();
    fastmd_runner::run_from_yaml(&job_path, &out, &FakePreparer, &engine, &Invocation::default())
        .expect("first");
    engine.calls.borrow_mut().clear();

    let report = fastmd_runner::run_from_yaml(
        &job_path,
        &out,
        &FakePreparer,
        &engine,
        &Invocation::default(),
    )
    .expect("second");
    assert_eq!(report.skipped.len(), 4);
    assert!(report.completed.is_empty());
    assert!(engine.calls.borrow().is_empty());
    let meta = read_meta(&out);
    assert_eq!(meta["runs"]["protB_T300"]["outcome"], "skipped");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn config_error_leaves_the_output_root_untouched() {
    let root = temp_root("config");
    fs::create_dir_all(&root).unwrap();
    let job_path = root.join("job.yml");
    fs::write(&job_path, "project: p\nstages: []\nsystems: []\n").unwrap();
    let out = root.join("out");

    let err = fastmd_runner::run_from_yaml(
        &job_path,
        &out,
        &FakePreparer,
        &FakeEngine::new(),
        &Invocation::default(),
    )
    .expect_err("must fail");
    assert!(matches!(err, RunnerError::Config(_)), "{err}");
    assert!(!out.exists(), "no side effects on configuration errors");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn preparation_failure_fails_only_that_systems_runs() {
    let root = temp_root("prep");
    let inputs = root.join("in");
    // b.pdb deliberately absent
    write_inputs(&inputs, &["a.pdb"]);
    let job_path = root.join("job.yml");
    fs::write(&job_path, two_by_two_job(&inputs)).unwrap();
    let out = root.join("out");

    let report = fastmd_runner::run_from_yaml(
        &job_path,
        &out,
        &FakePreparer,
        &FakeEngine::new(),
        &Invocation::default(),
    )
    .expect("run");
    assert_eq!(report.completed, vec!["protA_T300", "protA_T310"]);
    assert_eq!(report.failed.len(), 2);
    assert!(report.has_preparation_failure());
    assert!(!report.has_stage_failure());

    let meta = read_meta(&out);
    assert_eq!(meta["runs"]["protB_T300"]["outcome"], "failed");
    assert!(meta["runs"]["protB_T310"]["detail"]
        .as_str()
        .unwrap()
        .contains("not found"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn stage_failure_in_one_run_spares_its_siblings() {
    let root = temp_root("stagefail");
    let inputs = root.join("in");
    write_inputs(&inputs, &["a.pdb", "b.pdb"]);
    let job_path = root.join("job.yml");
    fs::write(&job_path, two_by_two_job(&inputs)).unwrap();
    let out = root.join("out");

    let engine = FakeEngine::failing_on("protB_T310");
    let report = fastmd_runner::run_from_yaml(
        &job_path,
        &out,
        &FakePreparer,
        &engine,
        &Invocation::default(),
    )
    .expect("run");
    assert_eq!(report.completed.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].run_id, "protB_T310");
    assert_eq!(report.failed[0].stage.as_deref(), Some("nvt"));
    assert!(report.has_stage_failure());
    assert!(!out.join("p").join("protB_T310").join(DONE_OK).exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn shorthand_writes_the_synthesized_job_and_runs_it() {
    let root = temp_root("shorthand");
    let inputs = root.join("in");
    write_inputs(&inputs, &["villin.pdb"]);
    let out = root.join("out");

    let report = fastmd_runner::simulate_from_pdb(
        &inputs.join("villin.pdb"),
        None,
        &out,
        &FakePreparer,
        &FakeEngine::new(),
        &Invocation::default(),
    )
    .expect("run");
    assert_eq!(report.completed, vec!["auto_T300"]);

    let project = out.join("villin-auto");
    let auto_job = project.join("_build").join("job.auto.yml");
    assert!(auto_job.is_file());
    let job = JobSpec::from_yaml_str(&fs::read_to_string(&auto_job).unwrap()).expect("parse");
    assert_eq!(job.project, "villin-auto");
    assert_eq!(job.stages.len(), 4);
    for stage in ["minimize", "nvt", "npt", "production"] {
        assert!(
            project.join("auto_T300").join(stage).join("stage.ok").is_file(),
            "{} marker",
            stage
        );
    }
    let _ = fs::remove_dir_all(root);
}

#[test]
fn shorthand_overrides_document_is_deep_merged() {
    let root = temp_root("overrides");
    let inputs = root.join("in");
    write_inputs(&inputs, &["villin.pdb"]);
    let overrides = root.join("config.yml");
    fs::write(
        &overrides,
        "defaults:\n  temperature_K: 320\nsweep:\n  temperature_K: [320]\n",
    )
    .unwrap();
    let out = root.join("out");

    let report = fastmd_runner::simulate_from_pdb(
        &inputs.join("villin.pdb"),
        Some(&overrides),
        &out,
        &FakePreparer,
        &FakeEngine::new(),
        &Invocation::default(),
    )
    .expect("run");
    assert_eq!(report.completed, vec!["auto_T320"]);
    let _ = fs::remove_dir_all(root);
}
