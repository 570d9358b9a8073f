//! Atomic file persistence.
//!
//! Every durable record in the state directory is written with the same
//! discipline: serialize, write to a temporary file in the same directory
//! (same filesystem, so the rename cannot cross devices), fsync, then
//! rename over the target. A crash at any point leaves either the previous
//! record or the new one.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::StateError;

/// Write `bytes` to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let dir = path.parent().ok_or_else(|| {
        StateError::io(
            format!("no parent directory for {}", path.display()),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_owned());
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp_path)
        .map_err(|e| StateError::io(format!("create {}", tmp_path.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| StateError::io(format!("write {}", tmp_path.display()), e))?;
    file.sync_all()
        .map_err(|e| StateError::io(format!("fsync {}", tmp_path.display()), e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| {
        StateError::io(
            format!("rename {} -> {}", tmp_path.display(), path.display()),
            e,
        )
    })
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StateError::Serialize {
        what: path.display().to_string(),
        source: e,
    })?;
    write_atomic(path, &json)
}

/// Read and parse a JSON record. Returns `Ok(None)` if the file does not
/// exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(format!("read {}", path.display()), e)),
    };
    let value = serde_json::from_str(&contents).map_err(|e| StateError::Deserialize {
        path: path.to_owned(),
        source: e,
    })?;
    Ok(Some(value))
}
