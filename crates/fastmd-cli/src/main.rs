use clap::{Parser, Subcommand};
use fastmd_analysis::AnalysisRequest;
use fastmd_runner::{
    plan_job, CommandEngine, CommandPreparer, Invocation, JobSpec, Plan, RunReport, RunnerError,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fastmds", version, about = "Multi-stage simulation workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job file (YAML) or a single structure (PDB) end to end.
    Simulate {
        /// Job document (.yml/.yaml) or structure file (anything else).
        #[arg(short = 's', long = "system")]
        system: PathBuf,
        /// Output root directory.
        #[arg(short = 'o', long = "output", default_value = "fastmd_runs")]
        output: PathBuf,
        /// Overrides document, deep-merged into the shorthand job
        /// (ignored for full job files).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Analyze production trajectories after the runs finish.
        #[arg(long)]
        analyze: bool,
        /// Frame selection handed to the analysis tool.
        #[arg(long)]
        frames: Option<String>,
        /// Atom selection handed to the analysis tool.
        #[arg(long)]
        atoms: Option<String>,
        /// Ask the analysis tool for slide output (true/false).
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        slides: bool,
        /// Print the execution plan and exit without touching the filesystem.
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a commented example job file.
    Init {
        #[arg(long, default_value = "job.yml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    let cli = Cli::parse();
    std::process::exit(run(cli.command));
}

fn run(command: Commands) -> i32 {
    match command {
        Commands::Simulate {
            system,
            output,
            config,
            analyze,
            frames,
            atoms,
            slides,
            dry_run,
        } => {
            let request = analyze.then_some(AnalysisRequest {
                slides,
                frames,
                atoms,
            });
            simulate(&system, &output, config.as_deref(), request, dry_run)
        }
        Commands::Init { path, force } => match fastmd_runner::init_job_file(&path, force) {
            Ok(path) => {
                println!("wrote: {}", path.display());
                0
            }
            Err(err) => {
                eprintln!("error: {}", err);
                exit_code_for(&err)
            }
        },
    }
}

fn simulate(
    system: &Path,
    output: &Path,
    config: Option<&Path>,
    request: Option<AnalysisRequest>,
    dry_run: bool,
) -> i32 {
    let is_yaml = matches!(
        system
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("yml") | Some("yaml")
    );
    if is_yaml && config.is_some() {
        println!("Warning: --config is ignored for YAML job files.");
    }

    let loaded = if is_yaml {
        fs::read_to_string(system)
            .map_err(|e| RunnerError::ReadJob {
                path: system.to_path_buf(),
                message: e.to_string(),
            })
            .and_then(|document| {
                let job = JobSpec::from_yaml_str(&document)?;
                Ok((job, document))
            })
    } else {
        fastmd_runner::auto_job_for(system, config)
    };
    let (job, document) = match loaded {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("error: {}", err);
            return exit_code_for(&err);
        }
    };

    if dry_run {
        let plan = match plan_job(&job, output, request.as_ref()) {
            Ok(plan) => plan,
            Err(err) => {
                let err = RunnerError::from(err);
                eprintln!("error: {}", err);
                return exit_code_for(&err);
            }
        };
        print_plan(&plan, is_yaml, request.as_ref());
        return 0;
    }

    let preparer = CommandPreparer::default();
    let engine = CommandEngine::default();
    let mut invocation = Invocation::default();
    invocation
        .versions
        .insert("fixer_cmd".to_string(), preparer.fixer_cmd.clone());
    invocation
        .versions
        .insert("solvate_cmd".to_string(), preparer.solvate_cmd.clone());
    invocation.versions.insert(
        "engine_cmd".to_string(),
        engine.engine_cmd.clone().unwrap_or_else(|| "auto".to_string()),
    );

    let result = if is_yaml {
        fastmd_runner::run_job(&job, &document, output, &preparer, &engine, &invocation)
    } else {
        fastmd_runner::simulate_from_pdb(system, config, output, &preparer, &engine, &invocation)
    };
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: {}", err);
            return exit_code_for(&err);
        }
    };
    print_report(&job, output, &report);

    if let Some(request) = &request {
        let project_dir = output.join(&job.project);
        match fastmd_analysis::analyze_project(&project_dir, request) {
            Ok(true) => {}
            Ok(false) => {
                println!("Analysis skipped or failed; install the analysis tool or adjust flags.")
            }
            Err(err) => eprintln!("error: analysis: {}", err),
        }
    }

    if report.has_stage_failure() {
        4
    } else if report.has_preparation_failure() {
        3
    } else {
        0
    }
}

fn print_plan(plan: &Plan, is_yaml: bool, request: Option<&AnalysisRequest>) {
    if is_yaml {
        println!("=== DRY RUN (SYSTEMIC SIMULATION) ===");
    } else {
        println!("=== DRY RUN (ONE-SHOT SIMULATION) ===");
    }
    println!("Project: {}", plan.project);
    println!("Output:  {}", plan.output_dir.display());
    match request {
        Some(r) => println!(
            "Analysis: Yes (slides={}, frames={}, atoms={})",
            r.slides,
            r.frames.as_deref().unwrap_or("all"),
            r.atoms.as_deref().unwrap_or("all"),
        ),
        None => println!("Analysis: No"),
    }
    for run in &plan.runs {
        println!(
            "- Run: {} @ {} K -> {}",
            run.system_id,
            run.temperature_k,
            run.run_dir.display()
        );
        for stage in &run.stages {
            println!(
                "    · {}: {} steps (~{} ps)",
                stage.name, stage.steps, stage.approx_ps
            );
        }
        if let Some(cmd) = &run.analyze_cmd {
            println!("    → fastmda command: {}", cmd.join(" "));
        }
    }
}

fn print_report(job: &JobSpec, output: &Path, report: &RunReport) {
    println!("project: {}", job.project);
    println!("project_dir: {}", output.join(&job.project).display());
    println!("completed: {}", report.completed.len());
    println!("skipped: {}", report.skipped.len());
    println!("failed: {}", report.failed.len());
    for failure in &report.failed {
        match &failure.stage {
            Some(stage) => println!(
                "failed_run: {} (stage {}): {}",
                failure.run_id, stage, failure.message
            ),
            None => println!("failed_run: {}: {}", failure.run_id, failure.message),
        }
    }
}

fn exit_code_for(err: &RunnerError) -> i32 {
    match err {
        RunnerError::Config(_) => 2,
        RunnerError::ReadJob { .. } => 2,
        RunnerError::Layout(_) => 5,
    }
}
