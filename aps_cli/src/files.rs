//! JSON file input and atomic output.

use aps_core::ApsError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::{fs, io::Write, path::Path};

/// Replace `path` with `bytes` via a synced sibling file and a rename, so a
/// crash never leaves a half-written ledger.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ApsError> {
    let text = fs::read_to_string(path)
        .map_err(|e| ApsError::Io(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| ApsError::InvalidInput(format!("{}: {e}", path.display())))
}

/// `read_json` for optional inputs; a missing flag means an empty list.
pub fn read_list<T: DeserializeOwned>(path: Option<&Path>) -> Result<Vec<T>, ApsError> {
    path.map_or_else(|| Ok(Vec::new()), read_json)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ApsError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ApsError::InvalidInput(format!("serialize {}: {e}", path.display())))?;
    write_atomic(path, &bytes).map_err(|e| ApsError::Io(format!("write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ledger.json");
        fs::write(&p, b"old").unwrap();
        write_atomic(&p, b"new").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"new");
        assert!(!p.with_extension("new").exists());
    }

    #[test]
    fn malformed_json_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("g.json");
        fs::write(&p, b"[{").unwrap();
        let err = read_json::<Vec<u32>>(&p).unwrap_err();
        assert!(matches!(err, ApsError::InvalidInput(_)));
        let err = read_json::<Vec<u32>>(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ApsError::Io(_)));
    }
}
