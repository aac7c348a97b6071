//! Crash-safe file primitives.
//!
//! Every write stages the complete content in a uniquely named temporary file
//! in the target's directory, fsyncs it, and publishes it with a single
//! rename. A reader therefore sees either the previous committed content or
//! the new one. If any step fails the staged file is dropped, which unlinks
//! it, and the target is untouched.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::schema::{self, DecodeError, Record};

const TEMP_PREFIX: &str = ".staged-";
const TEMP_SUFFIX: &str = ".tmp";

/// A fully written, fsynced temp file that has not been published yet.
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Publish by rename, replacing any existing target.
    pub fn commit(self) -> Result<(), StoreError> {
        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| StoreError::io(format!("rename onto {}", target.display()), e.error))?;
        sync_parent(&target);
        Ok(())
    }

    /// Publish only if the target does not exist. Returns `false` (and
    /// discards the staged file) when it does.
    pub fn commit_exclusive(self) -> Result<bool, StoreError> {
        let target = self.target;
        match self.tmp.persist_noclobber(&target) {
            Ok(_) => {
                sync_parent(&target);
                Ok(true)
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io(
                format!("exclusive publish of {}", target.display()),
                e.error,
            )),
        }
    }
}

/// Write `bytes` to a temp file beside `path` without publishing it.
pub fn stage(path: &Path, bytes: &[u8]) -> Result<StagedWrite, StoreError> {
    let dir = parent_of(path)?;
    ensure_dir(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(format!("create temp in {}", dir.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| StoreError::io("set temp permissions", e))?;
    }

    tmp.write_all(bytes)
        .map_err(|e| StoreError::io(format!("write temp for {}", path.display()), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(format!("fsync temp for {}", path.display()), e))?;

    Ok(StagedWrite {
        tmp,
        target: path.to_path_buf(),
    })
}

/// Replace the content of `path` atomically.
pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    stage(path, bytes)?.commit()
}

/// Create `path` with `bytes` only if it does not exist yet.
pub fn create_exclusive(path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
    stage(path, bytes)?.commit_exclusive()
}

/// Read the whole file. `None` when it does not exist.
pub fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(format!("read {}", path.display()), e)),
    }
}

pub fn write_record<T: Record>(path: &Path, record: &T) -> Result<(), StoreError> {
    write_bytes(path, &schema::encode(record)?)
}

/// Read and decode a record.
///
/// Unparsable content is quarantined and reported as absent. An envelope
/// from another schema or a newer version is an error and stays in place.
pub fn read_record<T: Record>(path: &Path) -> Result<Option<T>, StoreError> {
    let Some(bytes) = read_bytes(path)? else {
        return Ok(None);
    };
    match schema::decode::<T>(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(DecodeError::Corrupt(reason)) => {
            let moved_to = quarantine(path)?;
            warn!(
                path = %path.display(),
                quarantined = %moved_to.display(),
                schema = T::SCHEMA,
                reason = %reason,
                "corrupt record quarantined"
            );
            Ok(None)
        }
        Err(incompatible) => Err(incompatible.into_store_error(path)),
    }
}

/// Delete `path`. Returns whether a file was removed.
pub fn remove(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => {
            sync_parent(path);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(format!("remove {}", path.display()), e)),
    }
}

/// Move a damaged artifact aside as `<name>.corrupt-<timestamp>`.
pub fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let target = path.with_file_name(format!("{name}.corrupt-{stamp}"));
    fs::rename(path, &target)
        .map_err(|e| StoreError::io(format!("quarantine {}", path.display()), e))?;
    Ok(target)
}

/// Delete temp files left behind by writers that died before publishing.
pub fn sweep_staged(dir: &Path, older_than: Duration) -> Result<usize, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(format!("list {}", dir.display()), e)),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= older_than && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "swept abandoned temp files");
    }
    Ok(removed)
}

/// Committed record files in `dir` with the given extension, skipping
/// staged temps and quarantined copies.
pub fn list_records(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(format!("list {}", dir.display()), e)),
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            let hidden = p
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
            !hidden && p.extension().is_some_and(|ext| ext == extension)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

pub fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| StoreError::io(format!("create {}", dir.display()), e))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(format!("create {}", dir.display()), e))
    }
}

fn parent_of(path: &Path) -> Result<&Path, StoreError> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| StoreError::InvalidKey(format!("{} has no parent directory", path.display())))
}

/// Best effort: commit the directory entry change.
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Record for Note {
        const SCHEMA: &'static str = "tron.note";
        const VERSION: u32 = 1;
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/note.json");
        write_bytes(&path, b"first").unwrap();
        write_bytes(&path, b"second").unwrap();
        assert_eq!(read_bytes(&path).unwrap().unwrap(), b"second");
    }

    #[test]
    fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_bytes(&dir.path().join("nope")).unwrap().is_none());
        assert!(read_record::<Note>(&dir.path().join("nope.json")).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_bytes(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn staged_write_leaves_target_untouched_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.json");
        write_bytes(&path, b"committed").unwrap();

        let staged = stage(&path, b"pending").unwrap();
        assert!(staged.temp_path().exists());
        assert_eq!(read_bytes(&path).unwrap().unwrap(), b"committed");

        // Abandoning the staged write removes its temp file.
        let temp = staged.temp_path().to_path_buf();
        drop(staged);
        assert!(!temp.exists());
        assert_eq!(read_bytes(&path).unwrap().unwrap(), b"committed");
    }

    #[test]
    fn failed_write_keeps_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.json");
        write_bytes(&path, b"committed").unwrap();

        // A directory at the target makes the rename fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir_all(blocked.join("child")).unwrap();
        assert!(write_bytes(&blocked, b"data").is_err());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "temp file leaked: {leftovers:?}");
        assert_eq!(read_bytes(&path).unwrap().unwrap(), b"committed");
    }

    #[test]
    fn create_exclusive_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        assert!(create_exclusive(&path, b"one").unwrap());
        assert!(!create_exclusive(&path, b"two").unwrap());
        assert_eq!(read_bytes(&path).unwrap().unwrap(), b"one");
    }

    #[test]
    fn corrupt_record_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.json");
        fs::write(&path, b"{\"schema\":\"tron.no").unwrap();

        assert!(read_record::<Note>(&path).unwrap().is_none());
        assert!(!path.exists());
        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn incompatible_record_is_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.json");
        fs::write(&path, br#"{"schema":"tron.note","version":9,"data":{}}"#).unwrap();

        let err = read_record::<Note>(&path).unwrap_err();
        assert!(matches!(err, StoreError::IncompatibleSchema { .. }));
        assert!(path.exists());
    }

    #[test]
    fn record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.json");
        let note = Note { text: "hi".into() };
        write_record(&path, &note).unwrap();
        assert_eq!(read_record::<Note>(&path).unwrap(), Some(note));
    }

    #[test]
    fn listing_skips_temps_and_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        write_bytes(&dir.path().join("a.json"), b"{}").unwrap();
        let _staged = stage(&dir.path().join("b.json"), b"{}").unwrap();
        fs::write(dir.path().join("c.json.corrupt-20260101T000000.000Z"), b"x").unwrap();

        let listed = list_records(dir.path(), "json").unwrap();
        assert_eq!(listed, vec![dir.path().join("a.json")]);
    }

    #[test]
    fn sweep_removes_abandoned_temps() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage(&dir.path().join("a.json"), b"{}").unwrap();
        // Simulate a writer that died: keep the temp file on disk.
        let (_file, temp_path) = staged.tmp.keep().unwrap();
        assert!(temp_path.exists());

        assert_eq!(sweep_staged(dir.path(), Duration::ZERO).unwrap(), 1);
        assert!(!temp_path.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.json");
        write_bytes(&path, b"{}").unwrap();
        assert!(remove(&path).unwrap());
        assert!(!remove(&path).unwrap());
    }
}
