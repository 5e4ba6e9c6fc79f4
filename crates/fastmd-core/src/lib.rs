use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write-to-temp-then-rename with fsync on the file and its parent directory,
/// so a marker either exists with its full contents or not at all.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a JSON value with object keys recursively sorted, so two
/// documents that differ only in key order or surface formatting hash equal.
pub fn canonical_json_digest(value: &Value) -> String {
    let canon = canonicalize(value);
    let bytes = serde_json::to_vec(&canon).unwrap_or_default();
    format!("sha256:{}", sha256_bytes(&bytes))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Recursive JSON-object merge: `src` wins, nested objects merge key-wise.
pub fn deep_update(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => {
                        deep_update(existing, v);
                    }
                    _ => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_root(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "fastmd_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn atomic_write_creates_parents_and_no_temp_leftovers() {
        let root = temp_root("atomic");
        let target = root.join("a").join("b").join("marker.ok");
        atomic_write_bytes(&target, b"done\n").expect("write");
        assert_eq!(fs::read(&target).expect("read"), b"done\n");
        let siblings: Vec<_> = fs::read_dir(target.parent().unwrap())
            .expect("dir")
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1, "temp files left behind: {:?}", siblings);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"project": "p", "defaults": {"temperature_K": 300, "ph": 7.0}});
        let b = json!({"defaults": {"ph": 7.0, "temperature_K": 300}, "project": "p"});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn canonical_digest_distinguishes_values() {
        let a = json!({"temperature_K": 300});
        let b = json!({"temperature_K": 310});
        assert_ne!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn deep_update_merges_nested_objects() {
        let mut dst = json!({"defaults": {"temperature_K": 300, "ph": 7.0}, "project": "x"});
        let src = json!({"defaults": {"temperature_K": 310}});
        deep_update(&mut dst, &src);
        assert_eq!(dst["defaults"]["temperature_K"], json!(310));
        assert_eq!(dst["defaults"]["ph"], json!(7.0));
        assert_eq!(dst["project"], json!("x"));
    }

    #[test]
    fn sha256_file_matches_bytes() {
        let root = temp_root("sha");
        ensure_dir(&root).expect("dir");
        let path = root.join("data.bin");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(sha256_file(&path).expect("hash"), sha256_bytes(b"abc"));
        let _ = fs::remove_dir_all(root);
    }
}
