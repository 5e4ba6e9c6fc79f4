//! Bridge to the `fastmda` trajectory-analysis tool: locates finished
//! production trajectories under a project directory, builds the literal
//! command line, and streams the tool's output through the log.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const ANALYZE_TOOL: &str = "fastmda";
pub const TRAJECTORY_FILE: &str = "traj.dcd";
pub const TOPOLOGY_FILE: &str = "topology.pdb";
pub const PRODUCTION_STAGE: &str = "production";

/// What to ask of the analysis tool, straight from the CLI flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisRequest {
    pub slides: bool,
    pub frames: Option<String>,
    pub atoms: Option<String>,
}

/// A run directory whose production stage left an analyzable trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionRun {
    pub run_id: String,
    pub trajectory: PathBuf,
    pub topology: PathBuf,
}

/// The exact argv handed to the analysis tool.
pub fn build_analyze_cmd(
    trajectory: &Path,
    topology: &Path,
    request: &AnalysisRequest,
) -> Vec<String> {
    let mut cmd = vec![
        ANALYZE_TOOL.to_string(),
        "analyze".to_string(),
        "-traj".to_string(),
        trajectory.to_string_lossy().into_owned(),
        "-top".to_string(),
        topology.to_string_lossy().into_owned(),
    ];
    if request.slides {
        cmd.push("--slides".to_string());
    }
    if let Some(frames) = &request.frames {
        cmd.push("--frames".to_string());
        cmd.push(frames.clone());
    }
    if let Some(atoms) = &request.atoms {
        cmd.push("--atoms".to_string());
        cmd.push(atoms.clone());
    }
    cmd
}

/// Run directories directly under the project dir whose production stage has
/// both a trajectory and a topology, sorted by run id.
pub fn find_production_runs(project_dir: &Path) -> Vec<ProductionRun> {
    let mut runs = Vec::new();
    for entry in WalkDir::new(project_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('_') || name == "inputs" {
            continue;
        }
        let stage_dir = entry.path().join(PRODUCTION_STAGE);
        let trajectory = stage_dir.join(TRAJECTORY_FILE);
        let topology = stage_dir.join(TOPOLOGY_FILE);
        if trajectory.is_file() && topology.is_file() {
            runs.push(ProductionRun {
                run_id: name,
                trajectory,
                topology,
            });
        }
    }
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    runs
}

/// Spawn the given argv, streaming its stdout into the log line by line.
/// Returns whether the tool exited successfully.
pub fn run_and_stream(argv: &[String]) -> Result<bool> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start '{}'", argv[0]))?;
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => info!("[{}] {}", ANALYZE_TOOL, line),
                Err(_) => break,
            }
        }
    }
    let status = child.wait()?;
    Ok(status.success())
}

/// Analyze every finished production trajectory under a project. Returns
/// `false` when any analysis failed (or none were found).
pub fn analyze_project(project_dir: &Path, request: &AnalysisRequest) -> Result<bool> {
    let runs = find_production_runs(project_dir);
    if runs.is_empty() {
        warn!(
            "no production trajectories found under {}",
            project_dir.display()
        );
        return Ok(false);
    }
    let mut all_ok = true;
    for run in &runs {
        info!("analyzing {}", run.run_id);
        let argv = build_analyze_cmd(&run.trajectory, &run.topology, request);
        if !run_and_stream(&argv)? {
            warn!("analysis failed for {}", run.run_id);
            all_ok = false;
        }
    }
    Ok(all_ok)
}
