use crate::errors::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One typed configuration value. YAML scalars, sequences and mappings all
/// land here; the untagged order makes integers win over floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Merged parameter mapping with the override order builtin < project
/// defaults < system overrides < sweep point. Nested maps merge key-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet(pub BTreeMap<String, ParamValue>);

impl ParamSet {
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(|v| v.as_str()).unwrap_or(default)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) {
        self.0.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// New set with `over` applied on top of `self`.
    pub fn merged(&self, over: &ParamSet) -> ParamSet {
        let mut out = self.clone();
        for (k, v) in &over.0 {
            match (out.0.get_mut(k), v) {
                (Some(ParamValue::Map(dst)), ParamValue::Map(src)) => {
                    let merged = ParamSet(dst.clone()).merged(&ParamSet(src.clone()));
                    *dst = merged.0;
                }
                _ => {
                    out.0.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }
}

/// Parameters every job starts from; project defaults override these.
pub fn builtin_defaults() -> ParamSet {
    let mut p = ParamSet::default();
    p.insert("engine", ParamValue::Str("openmm".into()));
    p.insert("platform", ParamValue::Str("auto".into()));
    p.insert("ph", ParamValue::Float(7.0));
    p.insert("temperature_K", ParamValue::Int(300));
    p.insert("timestep_fs", ParamValue::Float(2.0));
    p.insert("friction_ps", ParamValue::Float(1.0));
    p.insert("pressure_atm", ParamValue::Float(1.0));
    p.insert("constraints", ParamValue::Str("HBonds".into()));
    p.insert("minimize_tolerance_kjmol_per_nm", ParamValue::Float(10.0));
    p.insert("minimize_max_iterations", ParamValue::Int(0));
    p.insert("report_interval", ParamValue::Int(1000));
    p.insert("checkpoint_interval", ParamValue::Int(10000));
    p.insert(
        "forcefield",
        ParamValue::List(vec![
            ParamValue::Str("charmm36.xml".into()),
            ParamValue::Str("charmm36/water.xml".into()),
        ]),
    );
    p.insert("ionic_strength_molar", ParamValue::Float(0.15));
    p.insert("neutralize", ParamValue::Bool(true));
    p.insert("ions", ParamValue::Str("NaCl".into()));
    p.insert("box_padding_nm", ParamValue::Float(1.0));
    p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ensemble {
    #[serde(rename = "NVT")]
    Nvt,
    #[serde(rename = "NPT")]
    Npt,
}

impl Ensemble {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ensemble::Nvt => "NVT",
            Ensemble::Npt => "NPT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSpec {
    pub name: String,
    pub steps: u64,
    pub ensemble: Option<Ensemble>,
    pub overrides: ParamSet,
}

/// Input-preparation route for one system. Exactly one route's discriminator
/// field may appear on a system (`pdb`/`fixed_pdb`, `prmtop`, `top`, `psf`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Route {
    Pdb {
        pdb: PathBuf,
        ph: Option<f64>,
    },
    FixedPdb {
        fixed_pdb: PathBuf,
        source_pdb: Option<PathBuf>,
    },
    Amber {
        prmtop: PathBuf,
        coords: PathBuf,
    },
    Gromacs {
        top: PathBuf,
        coords: PathBuf,
        itp: Vec<PathBuf>,
        include_dirs: Vec<PathBuf>,
    },
    Charmm {
        psf: PathBuf,
        params: Vec<PathBuf>,
        coords: PathBuf,
    },
}

impl Route {
    pub fn kind(&self) -> &'static str {
        match self {
            Route::Pdb { .. } => "pdb",
            Route::FixedPdb { .. } => "fixed_pdb",
            Route::Amber { .. } => "amber",
            Route::Gromacs { .. } => "gromacs",
            Route::Charmm { .. } => "charmm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSpec {
    pub id: String,
    pub route: Route,
    pub overrides: ParamSet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepAxis {
    pub name: String,
    pub values: Vec<ParamValue>,
}

/// Canonical, validated job. Immutable after parse; everything downstream is
/// derived as new values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub project: String,
    pub defaults: ParamSet,
    pub stages: Vec<StageSpec>,
    pub systems: Vec<SystemSpec>,
    pub sweep: Vec<SweepAxis>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    project: Option<String>,
    #[serde(default)]
    defaults: ParamSet,
    #[serde(default)]
    stages: Vec<RawStage>,
    #[serde(default)]
    systems: Vec<RawSystem>,
    #[serde(default)]
    sweep: IndexMap<String, Vec<ParamValue>>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    name: Option<String>,
    steps: Option<i64>,
    ensemble: Option<String>,
    #[serde(flatten)]
    overrides: ParamSet,
}

#[derive(Debug, Deserialize)]
struct RawSystem {
    id: Option<String>,
    pdb: Option<PathBuf>,
    fixed_pdb: Option<PathBuf>,
    source_pdb: Option<PathBuf>,
    ph: Option<f64>,
    prmtop: Option<PathBuf>,
    inpcrd: Option<PathBuf>,
    rst7: Option<PathBuf>,
    top: Option<PathBuf>,
    gro: Option<PathBuf>,
    g96: Option<PathBuf>,
    #[serde(default)]
    itp: Vec<PathBuf>,
    #[serde(default)]
    include_dirs: Vec<PathBuf>,
    psf: Option<PathBuf>,
    params: Option<ParamValue>,
    prm: Option<ParamValue>,
    rtf: Option<ParamValue>,
    #[serde(rename = "str")]
    str_files: Option<ParamValue>,
    crd: Option<PathBuf>,
    #[serde(flatten)]
    overrides: ParamSet,
}

impl JobSpec {
    pub fn from_yaml_str(raw: &str) -> Result<JobSpec, ConfigError> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::single(format!("job document is not valid YAML: {}", e)))?;
        let json = serde_json::to_value(yaml)
            .map_err(|e| ConfigError::single(format!("job document conversion failed: {}", e)))?;
        Self::parse_value(json)
    }

    pub fn parse_value(value: Value) -> Result<JobSpec, ConfigError> {
        let raw: RawJob = serde_json::from_value(value)
            .map_err(|e| ConfigError::single(format!("job document has invalid shape: {}", e)))?;
        parse_raw(raw)
    }

    /// Merged defaults for this job (builtin overridden by project defaults).
    pub fn merged_defaults(&self) -> ParamSet {
        builtin_defaults().merged(&self.defaults)
    }

    /// Canonical JSON form used for the provenance content hash.
    pub fn canonical_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_raw(raw: RawJob) -> Result<JobSpec, ConfigError> {
    let mut violations = Vec::new();

    let project = match raw.project {
        Some(p) if !p.trim().is_empty() => p,
        _ => {
            violations.push("project: missing or empty".to_string());
            String::new()
        }
    };

    if raw.stages.is_empty() {
        violations.push("stages: at least one stage is required".to_string());
    }
    let mut stages = Vec::new();
    for (idx, st) in raw.stages.into_iter().enumerate() {
        let name = match st.name {
            Some(n) if !n.trim().is_empty() => n,
            _ => {
                violations.push(format!("stages[{}]: name missing or empty", idx));
                continue;
            }
        };
        let steps = match st.steps {
            None => 0,
            Some(s) if s >= 0 => s as u64,
            Some(s) => {
                violations.push(format!("stage '{}': steps must be >= 0 (got {})", name, s));
                0
            }
        };
        let ensemble = match st.ensemble.as_deref() {
            None => None,
            Some(e) if e.eq_ignore_ascii_case("nvt") => Some(Ensemble::Nvt),
            Some(e) if e.eq_ignore_ascii_case("npt") => Some(Ensemble::Npt),
            Some(e) => {
                violations.push(format!(
                    "stage '{}': unknown ensemble '{}' (expected NVT or NPT)",
                    name, e
                ));
                None
            }
        };
        stages.push(StageSpec {
            name,
            steps,
            ensemble,
            overrides: st.overrides,
        });
    }

    if raw.systems.is_empty() {
        violations.push("systems: at least one system is required".to_string());
    }
    let mut systems = Vec::new();
    let mut seen_ids: Vec<String> = Vec::new();
    for (idx, sys) in raw.systems.into_iter().enumerate() {
        let label = sys
            .id
            .clone()
            .unwrap_or_else(|| format!("systems[{}]", idx));
        let id = match sys.id.clone() {
            Some(i) if !i.trim().is_empty() => i,
            _ => {
                violations.push(format!("{}: id missing or empty", label));
                continue;
            }
        };
        if !is_fs_safe(&id) {
            violations.push(format!(
                "system '{}': id must be filesystem-safe ([A-Za-z0-9._-] only)",
                id
            ));
        }
        if seen_ids.contains(&id) {
            violations.push(format!("system '{}': duplicate id", id));
        }
        seen_ids.push(id.clone());

        match build_route(&id, &sys, &mut violations) {
            Some(route) => systems.push(SystemSpec {
                id,
                route,
                overrides: sys.overrides,
            }),
            None => {}
        }
    }

    let schema = builtin_defaults().merged(&raw.defaults);
    let mut sweep = Vec::new();
    for (name, values) in raw.sweep {
        if !schema.contains_key(&name) {
            violations.push(format!(
                "sweep: axis '{}' does not name a known parameter",
                name
            ));
            continue;
        }
        if values.is_empty() {
            violations.push(format!("sweep: axis '{}' has no values", name));
            continue;
        }
        sweep.push(SweepAxis { name, values });
    }

    if violations.is_empty() {
        Ok(JobSpec {
            project,
            defaults: raw.defaults,
            stages,
            systems,
            sweep,
        })
    } else {
        Err(ConfigError::new(violations))
    }
}

fn build_route(id: &str, sys: &RawSystem, violations: &mut Vec<String>) -> Option<Route> {
    // Route discriminators; secondary files attach to whichever is present.
    let mut present: Vec<(&'static str, Vec<&'static str>)> = Vec::new();
    let mut pdb_fields = Vec::new();
    if sys.pdb.is_some() {
        pdb_fields.push("pdb");
    }
    if sys.fixed_pdb.is_some() {
        pdb_fields.push("fixed_pdb");
    }
    if !pdb_fields.is_empty() {
        present.push(("pdb", pdb_fields));
    }
    if sys.prmtop.is_some() {
        present.push(("amber", vec!["prmtop"]));
    }
    if sys.top.is_some() {
        present.push(("gromacs", vec!["top"]));
    }
    if sys.psf.is_some() {
        present.push(("charmm", vec!["psf"]));
    }

    if present.is_empty() {
        violations.push(format!(
            "system '{}': no recognized route (expected one of pdb, fixed_pdb, prmtop, top, psf)",
            id
        ));
        return None;
    }
    if present.len() > 1 {
        let fields: Vec<&str> = present.iter().flat_map(|(_, f)| f.iter().copied()).collect();
        violations.push(format!(
            "system '{}': fields from multiple routes present: {}",
            id,
            fields.join(", ")
        ));
        return None;
    }

    match present[0].0 {
        "pdb" => {
            if let Some(fixed) = &sys.fixed_pdb {
                if sys.pdb.is_some() {
                    violations.push(format!(
                        "system '{}': give either 'pdb' or 'fixed_pdb', not both",
                        id
                    ));
                    return None;
                }
                Some(Route::FixedPdb {
                    fixed_pdb: fixed.clone(),
                    source_pdb: sys.source_pdb.clone(),
                })
            } else {
                Some(Route::Pdb {
                    pdb: sys.pdb.clone().unwrap(),
                    ph: sys.ph,
                })
            }
        }
        "amber" => {
            let coords = sys.inpcrd.clone().or_else(|| sys.rst7.clone());
            match coords {
                Some(coords) => Some(Route::Amber {
                    prmtop: sys.prmtop.clone().unwrap(),
                    coords,
                }),
                None => {
                    violations.push(format!(
                        "system '{}': amber route requires 'inpcrd' or 'rst7'",
                        id
                    ));
                    None
                }
            }
        }
        "gromacs" => {
            let coords = sys.gro.clone().or_else(|| sys.g96.clone());
            match coords {
                Some(coords) => Some(Route::Gromacs {
                    top: sys.top.clone().unwrap(),
                    coords,
                    itp: sys.itp.clone(),
                    include_dirs: sys.include_dirs.clone(),
                }),
                None => {
                    violations.push(format!(
                        "system '{}': gromacs route requires 'gro' or 'g96'",
                        id
                    ));
                    None
                }
            }
        }
        "charmm" => {
            let mut params = Vec::new();
            for v in [&sys.params, &sys.prm, &sys.rtf, &sys.str_files] {
                if let Some(v) = v {
                    params.extend(paths_of(v));
                }
            }
            if params.is_empty() {
                violations.push(format!(
                    "system '{}': charmm route requires parameter files via 'params' or 'prm'/'rtf'/'str'",
                    id
                ));
                return None;
            }
            match &sys.crd {
                Some(crd) => Some(Route::Charmm {
                    psf: sys.psf.clone().unwrap(),
                    params,
                    coords: crd.clone(),
                }),
                None => {
                    violations.push(format!(
                        "system '{}': charmm route requires coordinates via 'crd'",
                        id
                    ));
                    None
                }
            }
        }
        _ => unreachable!(),
    }
}

fn paths_of(value: &ParamValue) -> Vec<PathBuf> {
    match value {
        ParamValue::Str(s) => vec![PathBuf::from(s)],
        ParamValue::List(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(PathBuf::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn is_fs_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub fn auto_project_name(structure: &Path) -> String {
    let stem = structure
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("system");
    format!("{}-auto", stem)
}

/// Built-in job synthesized for the single-structure shorthand; the caller
/// deep-merges any overrides document on top before parsing.
pub fn auto_job_value(structure: &Path) -> Value {
    serde_json::json!({
        "project": auto_project_name(structure),
        "defaults": {
            "engine": "openmm",
            "platform": "auto",
            "temperature_K": 300,
            "timestep_fs": 2.0,
            "constraints": "HBonds",
            "minimize_tolerance_kjmol_per_nm": 10.0,
            "minimize_max_iterations": 0,
            "forcefield": ["charmm36.xml", "charmm36/water.xml"],
            "ionic_strength_molar": 0.15,
            "neutralize": true,
            "ions": "NaCl",
            "box_padding_nm": 1.0,
            "report_interval": 1000,
            "checkpoint_interval": 10000,
        },
        "stages": [
            {"name": "minimize", "steps": 0},
            {"name": "nvt", "steps": 250000, "ensemble": "NVT"},
            {"name": "npt", "steps": 500000, "ensemble": "NPT"},
            {"name": "production", "steps": 1000000, "ensemble": "NPT"},
        ],
        "systems": [
            {"id": "auto", "pdb": structure.to_string_lossy()},
        ],
        "sweep": {"temperature_K": [300]},
    })
}

/// Ready-to-edit example job document written by `fastmds init`.
pub fn example_job_yaml() -> &'static str {
    "\
project: example-project
defaults:
  engine: openmm
  platform: auto
  ph: 7.0                      # pH used when repairing raw PDB structures
  temperature_K: 300
  timestep_fs: 2.0
  constraints: HBonds
  minimize_tolerance_kjmol_per_nm: 10.0
  minimize_max_iterations: 0
  report_interval: 1000
  checkpoint_interval: 10000
  forcefield: [charmm36.xml, charmm36/water.xml]
  ionic_strength_molar: 0.15
  neutralize: true
  ions: NaCl
  box_padding_nm: 1.0
stages:
  - name: minimize
    steps: 0
  - name: nvt
    steps: 250000
    ensemble: NVT
  - name: npt
    steps: 500000
    ensemble: NPT
  - name: production
    steps: 1000000
    ensemble: NPT
systems:
  # pdb: is repaired automatically (at defaults.ph); fixed_pdb: skips repair.
  - id: protA
    pdb: path/to/protein.pdb
sweep:
  temperature_K: [300]
"
}
