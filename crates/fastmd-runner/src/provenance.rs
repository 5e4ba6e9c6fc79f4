use crate::errors::LayoutError;
use chrono::Utc;
use fastmd_core::{atomic_write_json_pretty, ensure_dir};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const META_FILE: &str = "meta.json";
pub const META_LOCK: &str = "meta.lock";
pub const META_SCHEMA_VERSION: u64 = 1;

const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Where everything for one project lives under the output root.
#[derive(Debug, Clone)]
pub struct Layout {
    pub project_dir: PathBuf,
}

impl Layout {
    pub fn new(output_root: &Path, project: &str) -> Self {
        Self {
            project_dir: output_root.join(project),
        }
    }

    /// Create the project skeleton, mapping the failure to the output root.
    pub fn ensure(&self) -> Result<(), LayoutError> {
        for dir in [
            self.project_dir.clone(),
            self.build_dir(),
            self.inputs_dir(),
        ] {
            ensure_dir(&dir).map_err(|e| LayoutError::UnwritableRoot {
                path: self.project_dir.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn build_dir(&self) -> PathBuf {
        self.project_dir.join("_build")
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.project_dir.join("inputs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.project_dir.join(run_id)
    }

    pub fn job_copy(&self) -> PathBuf {
        self.project_dir.join("job.yml")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.project_dir.join(META_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.project_dir.join(META_LOCK)
    }
}

/// Exclusive `meta.lock` held across one meta.json update. Created with
/// create-new semantics, removed on drop.
#[derive(Debug)]
pub struct MetaLock {
    path: PathBuf,
}

impl Drop for MetaLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(layout: &Layout, timeout: Duration) -> Result<MetaLock, LayoutError> {
    let lock_path = layout.lock_path();
    let deadline = Instant::now() + timeout;
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                return Ok(MetaLock { path: lock_path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(LayoutError::LockTimeout { path: lock_path });
                }
                std::thread::sleep(LOCK_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_meta(layout: &Layout) -> Value {
    fs::read(layout.meta_path())
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| json!({}))
}

fn update_meta<F>(layout: &Layout, timeout: Duration, mutate: F) -> Result<(), LayoutError>
where
    F: FnOnce(&mut Value),
{
    let _lock = acquire_lock(layout, timeout)?;
    let mut meta = read_meta(layout);
    mutate(&mut meta);
    atomic_write_json_pretty(&layout.meta_path(), &meta).map_err(|e| {
        LayoutError::Io(std::io::Error::other(e.to_string()))
    })
}

/// Invocation-level facts recorded once at the start of a job.
#[derive(Debug, Clone)]
pub struct MetaSeed {
    pub config_sha256: String,
    pub cli_argv: Vec<String>,
    pub versions: BTreeMap<String, String>,
}

/// Baseline tool-version map; callers add collaborator commands.
pub fn base_versions() -> BTreeMap<String, String> {
    let mut v = BTreeMap::new();
    v.insert("fastmd".to_string(), env!("CARGO_PKG_VERSION").to_string());
    v.insert(
        "os".to_string(),
        format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
    );
    v
}

/// Open (or refresh) meta.json for this invocation. Outcomes of earlier
/// invocations survive; this invocation's start time replaces the old one.
pub fn begin_meta(layout: &Layout, seed: &MetaSeed, timeout: Duration) -> Result<(), LayoutError> {
    update_meta(layout, timeout, |meta| {
        meta["schema_version"] = json!(META_SCHEMA_VERSION);
        meta["time_start"] = json!(Utc::now().timestamp());
        meta["time_end"] = Value::Null;
        meta["config_sha256"] = json!(seed.config_sha256);
        meta["cli_argv"] = json!(seed.cli_argv);
        meta["versions"] = json!(seed.versions);
        if meta.get("runs").map_or(true, |r| !r.is_object()) {
            meta["runs"] = json!({});
        }
    })
}

/// Read-merge-write of one run's outcome; safe against a concurrent finisher.
pub fn record_run_outcome(
    layout: &Layout,
    run_id: &str,
    outcome: &str,
    detail: Option<&str>,
    timeout: Duration,
) -> Result<(), LayoutError> {
    let entry = json!({
        "outcome": outcome,
        "detail": detail,
        "time": Utc::now().timestamp(),
    });
    update_meta(layout, timeout, |meta| {
        if meta.get("runs").map_or(true, |r| !r.is_object()) {
            meta["runs"] = json!({});
        }
        meta["runs"][run_id] = entry;
    })
}

pub fn finalize_meta(layout: &Layout, timeout: Duration) -> Result<(), LayoutError> {
    update_meta(layout, timeout, |meta| {
        meta["time_end"] = json!(Utc::now().timestamp());
    })
}
