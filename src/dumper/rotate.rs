//! Retention-bounded rotation of previous backup artifacts.
//!
//! The live artifact `dir/name.ext` is renamed to
//! `dir/name-2024-01-02T03-04-05.678.ext` before a new backup is written, and
//! only the newest `keep` renamed copies are left on disk.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Utc};
use tracing::debug;

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Split `path` into (directory, stem, extension-with-dot).
fn parts(path: &Path) -> (PathBuf, String, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (dir, stem, ext)
}

/// Name a rotated copy of `path` for the given instant.
fn backup_name(stem: &str, ext: &str, at: &NaiveDateTime) -> String {
    format!("{}-{}{}", stem, at.format(BACKUP_TIME_FORMAT), ext)
}

/// Parse the timestamp out of a rotated file name, if it is one of ours.
fn backup_time(file_name: &str, stem: &str, ext: &str) -> Option<NaiveDateTime> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('-')?;
    let stamp = rest.strip_suffix(ext)?;
    NaiveDateTime::parse_from_str(stamp, BACKUP_TIME_FORMAT).ok()
}

/// Rotated copies of `path`, newest first.
pub fn list_backups(path: &Path) -> io::Result<Vec<PathBuf>> {
    let (dir, stem, ext) = parts(path);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(at) = backup_time(&name, &stem, &ext) {
            found.push((at, entry.path()));
        }
    }

    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Move the current artifact aside and prune old copies beyond `keep`.
///
/// A missing artifact is not an error; pruning still runs.
pub fn rotate(path: &Path, keep: usize) -> io::Result<()> {
    if path.exists() {
        let (dir, stem, ext) = parts(path);
        let target = dir.join(backup_name(&stem, &ext, &Utc::now().naive_utc()));
        debug!(from = %path.display(), to = %target.display(), "rotating backup");
        std::fs::rename(path, &target)?;
    }

    for old in list_backups(path)?.into_iter().skip(keep) {
        debug!(path = %old.display(), "removing expired backup");
        std::fs::remove_file(&old)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_name_round_trips() {
        let at = NaiveDateTime::parse_from_str("2024-01-02T03-04-05.678", BACKUP_TIME_FORMAT)
            .unwrap();
        let name = backup_name("dump", ".sql", &at);
        assert_eq!(name, "dump-2024-01-02T03-04-05.678.sql");
        assert_eq!(backup_time(&name, "dump", ".sql"), Some(at));
        assert_eq!(backup_time("dump.sql", "dump", ".sql"), None);
        assert_eq!(backup_time("other-2024-01-02T03-04-05.678.sql", "dump", ".sql"), None);
    }

    #[test]
    fn test_rotate_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        rotate(&dir.path().join("nothing.sql"), 3).unwrap();
        rotate(&dir.path().join("missing-dir").join("x.sql"), 3).unwrap();
    }

    #[test]
    fn test_rotate_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("dump.sql");

        for stamp in [
            "2024-01-01T00-00-00.000",
            "2024-01-02T00-00-00.000",
            "2024-01-03T00-00-00.000",
        ] {
            std::fs::write(dir.path().join(format!("dump-{}.sql", stamp)), stamp).unwrap();
        }
        std::fs::write(&live, "current").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        rotate(&live, 2).unwrap();

        assert!(!live.exists());
        let kept = list_backups(&live).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(std::fs::read_to_string(&kept[0]).unwrap(), "current");
        assert!(kept[1].ends_with("dump-2024-01-03T00-00-00.000.sql"));
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
