// ABOUTME: Startup recovery for the document-file backends.
// ABOUTME: Removes temporary files left behind by writes that crashed before their rename.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use quill_core::StorageError;

pub(crate) const TEMP_EXTENSION: &str = "tmp";

/// Remove every `*.tmp` file in the entity directories under `root`.
///
/// A temp file only exists when a write died between creating it and
/// renaming it over the live document, so the live document is still the
/// last complete write and the temp file can be dropped. Returns how many
/// files were removed.
pub fn remove_stale_temp_files(root: &Path) -> Result<usize, StorageError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        for file in fs::read_dir(entry.path())? {
            let path = file?.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                tracing::info!("removing stale temp file {}", path.display());
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    if removed > 0 {
        tracing::info!("recovery removed {} stale temp files", removed);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn removes_only_temp_files() {
        let dir = TempDir::new().unwrap();
        let players = dir.path().join("players");
        fs::create_dir_all(&players).unwrap();
        fs::write(players.join("p1.json"), b"{}").unwrap();
        fs::write(players.join("p1.json.tmp"), b"{\"half").unwrap();
        fs::write(players.join("p2.yaml.tmp"), b"half").unwrap();

        let removed = remove_stale_temp_files(dir.path()).unwrap();
        assert_eq!(removed, 2);
        assert!(players.join("p1.json").exists());
        assert!(!players.join("p1.json.tmp").exists());
    }

    #[test]
    fn missing_root_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let removed = remove_stale_temp_files(&dir.path().join("absent")).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn ignores_files_at_root_level() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("stray.tmp"), b"x").unwrap();
        assert_eq!(remove_stale_temp_files(dir.path()).unwrap(), 0);
        assert!(dir.path().join("stray.tmp").exists());
    }
}
