use crate::errors::PreparationError;
use crate::job::{ParamSet, ParamValue, Route, SystemSpec};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Solvent-box settings pulled out of the merged parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SolvationParams {
    pub box_padding_nm: f64,
    pub ionic_strength_molar: f64,
    pub ions: String,
    pub neutralize: bool,
}

impl SolvationParams {
    pub fn from_params(params: &ParamSet) -> Self {
        Self {
            box_padding_nm: params.get_f64("box_padding_nm", 1.0),
            ionic_strength_molar: params.get_f64("ionic_strength_molar", 0.15),
            ions: params.get_str("ions", "NaCl").to_string(),
            neutralize: params.get_bool("neutralize", true),
        }
    }
}

/// Simulation-ready input files, whatever route produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedInput {
    SolvatedPdb {
        pdb: PathBuf,
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

impl PreparedInput {
    /// Files that belong in the project's input mirror.
    pub fn files(&self) -> Vec<&Path> {
        match self {
            PreparedInput::SolvatedPdb { pdb } => vec![pdb.as_path()],
            PreparedInput::Amber { prmtop, coords } => vec![prmtop.as_path(), coords.as_path()],
            PreparedInput::Gromacs {
                top, coords, itp, ..
            } => {
                let mut out = vec![top.as_path(), coords.as_path()];
                out.extend(itp.iter().map(|p| p.as_path()));
                out
            }
            PreparedInput::Charmm {
                psf,
                params,
                coords,
            } => {
                let mut out = vec![psf.as_path(), coords.as_path()];
                out.extend(params.iter().map(|p| p.as_path()));
                out
            }
        }
    }
}

/// Structure repair and solvation seam. The shipped implementation shells out;
/// tests substitute an in-process fake.
pub trait Preparer {
    fn repair_structure(
        &self,
        raw: &Path,
        fixed: &Path,
        ph: f64,
        strict: bool,
    ) -> Result<(), PreparationError>;

    fn solvate_and_ionize(
        &self,
        fixed: &Path,
        solvated: &Path,
        params: &SolvationParams,
    ) -> Result<(), PreparationError>;
}

/// Preparer that spawns external fixer/solvation tools and streams their
/// output into the log.
pub struct CommandPreparer {
    pub fixer_cmd: String,
    pub solvate_cmd: String,
}

impl Default for CommandPreparer {
    fn default() -> Self {
        Self {
            fixer_cmd: "fastmd-pdbfix".to_string(),
            solvate_cmd: "fastmd-solvate".to_string(),
        }
    }
}

impl Preparer for CommandPreparer {
    fn repair_structure(
        &self,
        raw: &Path,
        fixed: &Path,
        ph: f64,
        strict: bool,
    ) -> Result<(), PreparationError> {
        let mut cmd = Command::new(&self.fixer_cmd);
        cmd.arg("--input")
            .arg(raw)
            .arg("--output")
            .arg(fixed)
            .arg("--ph")
            .arg(ph.to_string());
        if strict {
            cmd.arg("--strict");
        }
        stream_tool(cmd, &self.fixer_cmd).map_err(|message| PreparationError::Repair {
            input: raw.to_path_buf(),
            message,
        })
    }

    fn solvate_and_ionize(
        &self,
        fixed: &Path,
        solvated: &Path,
        params: &SolvationParams,
    ) -> Result<(), PreparationError> {
        let mut cmd = Command::new(&self.solvate_cmd);
        cmd.arg("--input")
            .arg(fixed)
            .arg("--output")
            .arg(solvated)
            .arg("--padding-nm")
            .arg(params.box_padding_nm.to_string())
            .arg("--ionic-strength")
            .arg(params.ionic_strength_molar.to_string())
            .arg("--ions")
            .arg(&params.ions);
        if params.neutralize {
            cmd.arg("--neutralize");
        }
        stream_tool(cmd, &self.solvate_cmd).map_err(|message| PreparationError::Solvation {
            input: fixed.to_path_buf(),
            message,
        })
    }
}

fn stream_tool(mut cmd: Command, label: &str) -> Result<(), String> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to start '{}': {}", label, e))?;
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => info!("[{}] {}", label, line),
                Err(_) => break,
            }
        }
    }
    let status = child
        .wait()
        .map_err(|e| format!("failed waiting for '{}': {}", label, e))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("'{}' exited with status {}", label, status))
    }
}

/// Turn a declared system into simulation-ready input files under the
/// project's `_build/` directory. Pre-parameterized routes only validate that
/// their files exist.
pub fn resolve_system(
    system: &SystemSpec,
    params: &ParamSet,
    build_dir: &Path,
    preparer: &dyn Preparer,
) -> Result<PreparedInput, PreparationError> {
    match &system.route {
        Route::Pdb { pdb, ph } => {
            require_file("pdb", pdb)?;
            fs::create_dir_all(build_dir)?;
            let fixed = build_dir.join(format!("{}_fixed.pdb", system.id));
            let solvated = build_dir.join(format!("{}_solvated.pdb", system.id));
            let ph = ph.unwrap_or_else(|| params.get_f64("ph", 7.0));
            preparer.repair_structure(pdb, &fixed, ph, true)?;
            preparer.solvate_and_ionize(&fixed, &solvated, &SolvationParams::from_params(params))?;
            Ok(PreparedInput::SolvatedPdb { pdb: solvated })
        }
        Route::FixedPdb { fixed_pdb, .. } => {
            require_file("fixed_pdb", fixed_pdb)?;
            fs::create_dir_all(build_dir)?;
            let solvated = build_dir.join(format!("{}_solvated.pdb", system.id));
            preparer.solvate_and_ionize(
                fixed_pdb,
                &solvated,
                &SolvationParams::from_params(params),
            )?;
            Ok(PreparedInput::SolvatedPdb { pdb: solvated })
        }
        Route::Amber { prmtop, coords } => {
            require_file("prmtop", prmtop)?;
            require_file("inpcrd/rst7", coords)?;
            Ok(PreparedInput::Amber {
                prmtop: prmtop.clone(),
                coords: coords.clone(),
            })
        }
        Route::Gromacs {
            top,
            coords,
            itp,
            include_dirs,
        } => {
            require_file("top", top)?;
            require_file("gro/g96", coords)?;
            for p in itp {
                require_file("itp", p)?;
            }
            Ok(PreparedInput::Gromacs {
                top: top.clone(),
                coords: coords.clone(),
                itp: itp.clone(),
                include_dirs: include_dirs.clone(),
            })
        }
        Route::Charmm {
            psf,
            params: param_files,
            coords,
        } => {
            require_file("psf", psf)?;
            require_file("crd", coords)?;
            for p in param_files {
                require_file("params", p)?;
            }
            Ok(PreparedInput::Charmm {
                psf: psf.clone(),
                params: param_files.clone(),
                coords: coords.clone(),
            })
        }
    }
}

fn require_file(field: &'static str, path: &Path) -> Result<(), PreparationError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PreparationError::MissingInput {
            field,
            path: path.to_path_buf(),
        })
    }
}

/// Best-effort copy of a system's input files into `inputs/<system-id>/`.
/// A failed copy is logged and skipped; the run itself is unaffected.
pub fn mirror_inputs(inputs_dir: &Path, system_id: &str, prepared: &PreparedInput) {
    let dest_dir = inputs_dir.join(system_id);
    for src in prepared.files() {
        copy_into(src, &dest_dir);
    }
}

/// Mirror force-field files named in the merged defaults, when they exist on
/// disk (bundled force fields are resolved by the engine itself and skipped).
pub fn mirror_forcefields(inputs_dir: &Path, params: &ParamSet) {
    let dest_dir = inputs_dir.join("forcefields");
    if let Some(ParamValue::List(items)) = params.get("forcefield") {
        for item in items {
            if let Some(name) = item.as_str() {
                let src = Path::new(name);
                if src.is_file() {
                    copy_into(src, &dest_dir);
                }
            }
        }
    }
}

fn copy_into(src: &Path, dest_dir: &Path) {
    let Some(name) = src.file_name() else {
        return;
    };
    if let Err(e) = fs::create_dir_all(dest_dir) {
        warn!("input mirror skipped ({}): {}", dest_dir.display(), e);
        return;
    }
    let dest = dest_dir.join(name);
    if let Err(e) = fs::copy(src, &dest) {
        warn!(
            "input mirror copy failed ({} -> {}): {}",
            src.display(),
            dest.display(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use chrono::Utc;
    use std::cell::RefCell;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fastmd_resolve_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[derive(Default)]
    struct FakePreparer {
        calls: RefCell<Vec<String>>,
    }

    impl Preparer for FakePreparer {
        fn repair_structure(
            &self,
            raw: &Path,
            fixed: &Path,
            ph: f64,
            strict: bool,
        ) -> Result<(), PreparationError> {
            self.calls
                .borrow_mut()
                .push(format!("repair ph={} strict={} {}", ph, strict, raw.display()));
            fs::write(fixed, b"FIXED\n")?;
            Ok(())
        }

        fn solvate_and_ionize(
            &self,
            _fixed: &Path,
            solvated: &Path,
            params: &SolvationParams,
        ) -> Result<(), PreparationError> {
            self.calls.borrow_mut().push(format!(
                "solvate padding={} ionic={} ions={} neutralize={}",
                params.box_padding_nm, params.ionic_strength_molar, params.ions, params.neutralize
            ));
            fs::write(solvated, b"SOLVATED\n")?;
            Ok(())
        }
    }

    fn system_of(yaml_systems: &str) -> (JobSpec, SystemSpec) {
        let yaml = format!(
            "project: p\nstages:\n  - name: production\n    steps: 10\nsystems:\n{}",
            yaml_systems
        );
        let job = JobSpec::from_yaml_str(&yaml).expect("parse");
        let sys = job.systems[0].clone();
        (job, sys)
    }

    #[test]
    fn pdb_route_repairs_then_solvates() {
        let root = temp_root("pdb");
        fs::create_dir_all(&root).unwrap();
        let raw = root.join("protA.pdb");
        fs::write(&raw, b"ATOM\n").unwrap();
        let (job, sys) = system_of(&format!("  - id: protA\n    pdb: {}\n", raw.display()));
        let params = job.merged_defaults().merged(&sys.overrides);

        let prep = FakePreparer::default();
        let out = resolve_system(&sys, &params, &root.join("_build"), &prep).expect("resolve");
        match out {
            PreparedInput::SolvatedPdb { pdb } => {
                assert!(pdb.ends_with("protA_solvated.pdb"));
                assert!(pdb.is_file());
            }
            other => panic!("unexpected input: {:?}", other),
        }
        let calls = prep.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("repair ph=7 strict=true"), "{}", calls[0]);
        assert!(calls[1].contains("ions=NaCl"), "{}", calls[1]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fixed_pdb_route_skips_repair() {
        let root = temp_root("fixed");
        fs::create_dir_all(&root).unwrap();
        let fixed = root.join("protA_fixed.pdb");
        fs::write(&fixed, b"ATOM\n").unwrap();
        let (job, sys) = system_of(&format!(
            "  - id: protA\n    fixed_pdb: {}\n",
            fixed.display()
        ));
        let params = job.merged_defaults().merged(&sys.overrides);

        let prep = FakePreparer::default();
        resolve_system(&sys, &params, &root.join("_build"), &prep).expect("resolve");
        let calls = prep.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("solvate"), "{}", calls[0]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn amber_route_passes_through_when_files_exist() {
        let root = temp_root("amber");
        fs::create_dir_all(&root).unwrap();
        let prmtop = root.join("s.prmtop");
        let inpcrd = root.join("s.inpcrd");
        fs::write(&prmtop, b"x").unwrap();
        fs::write(&inpcrd, b"x").unwrap();
        let (job, sys) = system_of(&format!(
            "  - id: s\n    prmtop: {}\n    inpcrd: {}\n",
            prmtop.display(),
            inpcrd.display()
        ));
        let params = job.merged_defaults();

        let prep = FakePreparer::default();
        let out = resolve_system(&sys, &params, &root.join("_build"), &prep).expect("resolve");
        assert!(matches!(out, PreparedInput::Amber { .. }));
        assert!(prep.calls.borrow().is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_declared_file_is_reported_with_its_field() {
        let (job, sys) = system_of("  - id: s\n    pdb: does/not/exist.pdb\n");
        let params = job.merged_defaults();
        let prep = FakePreparer::default();
        let err = resolve_system(&sys, &params, &temp_root("missing"), &prep)
            .expect_err("must fail");
        match err {
            PreparationError::MissingInput { field, .. } => assert_eq!(field, "pdb"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn system_ph_beats_defaults_for_repair() {
        let root = temp_root("ph");
        fs::create_dir_all(&root).unwrap();
        let raw = root.join("a.pdb");
        fs::write(&raw, b"ATOM\n").unwrap();
        let (job, sys) = system_of(&format!(
            "  - id: a\n    pdb: {}\n    ph: 5.5\n",
            raw.display()
        ));
        let params = job.merged_defaults().merged(&sys.overrides);
        let prep = FakePreparer::default();
        resolve_system(&sys, &params, &root.join("_build"), &prep).expect("resolve");
        assert!(
            prep.calls.borrow()[0].starts_with("repair ph=5.5"),
            "{}",
            prep.calls.borrow()[0]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn mirror_copies_prepared_files() {
        let root = temp_root("mirror");
        fs::create_dir_all(&root).unwrap();
        let solvated = root.join("s_solvated.pdb");
        fs::write(&solvated, b"SOLVATED\n").unwrap();
        let prepared = PreparedInput::SolvatedPdb {
            pdb: solvated.clone(),
        };
        let inputs = root.join("inputs");
        mirror_inputs(&inputs, "s", &prepared);
        assert!(inputs.join("s").join("s_solvated.pdb").is_file());
        let _ = fs::remove_dir_all(root);
    }
}
