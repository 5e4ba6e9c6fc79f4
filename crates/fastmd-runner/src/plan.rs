use crate::errors::LayoutError;
use crate::job::JobSpec;
use crate::provenance::Layout;
use crate::sweep;
use fastmd_analysis::{build_analyze_cmd, AnalysisRequest, PRODUCTION_STAGE, TOPOLOGY_FILE, TRAJECTORY_FILE};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    pub name: String,
    pub steps: u64,
    /// Simulated time at the stage's timestep, rounded to 3 decimals.
    pub approx_ps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRun {
    pub run_id: String,
    pub system_id: String,
    pub temperature_k: f64,
    pub run_dir: PathBuf,
    pub stages: Vec<PlannedStage>,
    /// Literal analysis argv for the production stage, when requested.
    pub analyze_cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub project: String,
    pub output_dir: PathBuf,
    pub runs: Vec<PlannedRun>,
}

pub fn steps_to_ps(steps: u64, timestep_fs: f64) -> f64 {
    let ps = steps as f64 * timestep_fs / 1000.0;
    (ps * 1000.0).round() / 1000.0
}

/// What `simulate` would do, computed without touching the filesystem.
pub fn plan_job(
    job: &JobSpec,
    output_root: &Path,
    analysis: Option<&AnalysisRequest>,
) -> Result<Plan, LayoutError> {
    let layout = Layout::new(output_root, &job.project);
    let variants = sweep::expand(job)?;

    let mut runs = Vec::new();
    for variant in &variants {
        let run_dir = layout.run_dir(&variant.run_id);
        let stages = job
            .stages
            .iter()
            .map(|stage| {
                let params = variant.params.merged(&stage.overrides);
                PlannedStage {
                    name: stage.name.clone(),
                    steps: stage.steps,
                    approx_ps: steps_to_ps(stage.steps, params.get_f64("timestep_fs", 2.0)),
                }
            })
            .collect();
        let analyze_cmd = analysis.map(|request| {
            let stage_dir = run_dir.join(PRODUCTION_STAGE);
            build_analyze_cmd(
                &stage_dir.join(TRAJECTORY_FILE),
                &stage_dir.join(TOPOLOGY_FILE),
                request,
            )
        });
        runs.push(PlannedRun {
            run_id: variant.run_id.clone(),
            system_id: variant.system.id.clone(),
            temperature_k: variant.params.get_f64("temperature_K", 300.0),
            run_dir,
            stages,
            analyze_cmd,
        });
    }

    Ok(Plan {
        project: job.project.clone(),
        output_dir: output_root.to_path_buf(),
        runs,
    })
}
