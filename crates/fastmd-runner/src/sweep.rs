use crate::errors::LayoutError;
use crate::job::{JobSpec, ParamSet, ParamValue, SystemSpec};
use std::collections::BTreeMap;

/// One concrete run: a system crossed with one sweep point, parameters fully
/// merged, with a stable filesystem-safe identifier.
#[derive(Debug, Clone)]
pub struct RunVariant {
    pub system: SystemSpec,
    pub point: ParamSet,
    pub params: ParamSet,
    pub run_id: String,
}

/// Cross product of systems and sweep points, in job declaration order with
/// the last sweep axis varying fastest. An empty sweep still yields one run
/// per system, pinned to the merged temperature so run ids keep their shape.
pub fn expand(job: &JobSpec) -> Result<Vec<RunVariant>, LayoutError> {
    let base = job.merged_defaults();
    let mut variants = Vec::new();
    let mut seen: BTreeMap<String, String> = BTreeMap::new();

    for system in &job.systems {
        let sys_params = base.merged(&system.overrides);
        for point in sweep_points(job, &sys_params) {
            let params = sys_params.merged(&point);
            let run_id = run_id_for(&system.id, job, &point);
            if let Some(first) = seen.get(&run_id) {
                return Err(LayoutError::RunIdCollision {
                    run_id,
                    first: first.clone(),
                    second: system.id.clone(),
                });
            }
            seen.insert(run_id.clone(), system.id.clone());
            variants.push(RunVariant {
                system: system.clone(),
                point,
                params,
                run_id,
            });
        }
    }
    Ok(variants)
}

fn sweep_points(job: &JobSpec, sys_params: &ParamSet) -> Vec<ParamSet> {
    if job.sweep.is_empty() {
        // Synthesize a single temperature point so the run id and the layout
        // come out identical to an explicit one-value sweep.
        let temp = sys_params
            .get("temperature_K")
            .cloned()
            .unwrap_or(ParamValue::Int(300));
        let mut point = ParamSet::default();
        point.insert("temperature_K", temp);
        return vec![point];
    }

    let mut points = Vec::new();
    let mut idx = vec![0usize; job.sweep.len()];
    loop {
        let mut point = ParamSet::default();
        for (axis, i) in job.sweep.iter().zip(&idx) {
            point.insert(axis.name.clone(), axis.values[*i].clone());
        }
        points.push(point);

        // odometer increment, last axis fastest
        let mut pos = job.sweep.len();
        loop {
            if pos == 0 {
                return points;
            }
            pos -= 1;
            idx[pos] += 1;
            if idx[pos] < job.sweep[pos].values.len() {
                break;
            }
            idx[pos] = 0;
        }
    }
}

fn run_id_for(system_id: &str, job: &JobSpec, point: &ParamSet) -> String {
    let mut id = system_id.to_string();
    if job.sweep.is_empty() {
        if let Some(v) = point.get("temperature_K") {
            id.push_str(&format!("_T{}", canonical_value(v)));
        }
        return id;
    }
    for axis in &job.sweep {
        if let Some(v) = point.get(&axis.name) {
            id.push('_');
            match axis_tag(&axis.name) {
                Some(tag) => id.push_str(tag),
                None => {
                    id.push_str(&axis.name);
                    id.push('-');
                }
            }
            id.push_str(&canonical_value(v));
        }
    }
    id
}

fn axis_tag(axis: &str) -> Option<&'static str> {
    match axis {
        "temperature_K" => Some("T"),
        "pressure_atm" => Some("P"),
        "ph" => Some("pH"),
        "ionic_strength_molar" => Some("I"),
        _ => None,
    }
}

/// Filesystem-safe rendering of a sweep value. Integral floats collapse to
/// their integer form so `300` and `300.0` name the same run (and collide
/// loudly instead of silently diverging).
fn canonical_value(value: &ParamValue) -> String {
    let raw = match value {
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string().replace('.', "p")
            }
        }
        ParamValue::Bool(b) => b.to_string(),
        ParamValue::Str(s) => s.clone(),
        other => format!("{:?}", other),
    };
    let raw = if let Some(rest) = raw.strip_prefix('-') {
        format!("m{}", rest)
    } else {
        raw
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
