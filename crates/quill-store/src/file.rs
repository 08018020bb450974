// ABOUTME: Document-file backend storing one JSON or YAML document per record.
// ABOUTME: Writes are serialized per file and land via temp file, fsync and atomic rename.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use quill_core::{
    DocumentFormat, EntityKey, EntityType, Envelope, Revision, StorageError, decode_document,
    encode_document,
};

use crate::backend::{Backend, RecordIter, check_target_revision};
use crate::recovery::{TEMP_EXTENSION, remove_stale_temp_files};

const PROBE_FILE: &str = ".quill-probe";

/// One in-process lock per document path. Entries are dropped once no
/// thread holds or waits on them.
#[derive(Default)]
struct PathLocks {
    inner: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.inner.lock().entry(path.to_path_buf()).or_default());
        let out = {
            let _guard = lock.lock();
            f()
        };
        let mut map = self.inner.lock();
        // Only the map and this thread still hold the lock.
        if Arc::strong_count(&lock) == 2 {
            map.remove(path);
        }
        out
    }
}

/// Stores records as `<root>/<entity>/<key>.<json|yaml>`.
pub struct FileBackend {
    root: PathBuf,
    format: DocumentFormat,
    locks: PathLocks,
    closed: AtomicBool,
}

impl FileBackend {
    /// Open (creating if needed) a document store rooted at `root` and clean
    /// up temp files left by interrupted writes.
    pub fn open(root: impl Into<PathBuf>, format: DocumentFormat) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        remove_stale_temp_files(&root)?;
        tracing::info!(
            root = %root.display(),
            format = format.extension(),
            "file backend ready"
        );
        Ok(Self {
            root,
            format,
            locks: PathLocks::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn entity_dir(&self, entity: &EntityType) -> PathBuf {
        self.root.join(entity.as_str())
    }

    fn document_path(&self, entity: &EntityType, key: &EntityKey) -> PathBuf {
        self.entity_dir(entity)
            .join(format!("{}.{}", key.as_str(), self.format.extension()))
    }

    fn read_path(
        &self,
        entity: &EntityType,
        key: &str,
        path: &Path,
    ) -> Result<Option<Envelope>, StorageError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_document(self.format, &bytes)
            .map(Some)
            .map_err(|e| StorageError::malformed(entity.as_str(), key, e))
    }
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// document, never a partial one.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp_path = temp_path(path);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    sync_dir(dir)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TEMP_EXTENSION);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// Directory handles cannot be fsynced portably outside unix.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        self.format.extension()
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        fs::create_dir_all(&self.root)?;
        let probe = self.root.join(PROBE_FILE);
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    fn read_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
    ) -> Result<Option<Envelope>, StorageError> {
        self.ensure_open()?;
        let path = self.document_path(entity, key);
        self.locks
            .with_lock(&path, || self.read_path(entity, key.as_str(), &path))
    }

    fn write_one(
        &self,
        entity: &EntityType,
        key: &EntityKey,
        envelope: &Envelope,
        expected: Revision,
    ) -> Result<Revision, StorageError> {
        self.ensure_open()?;
        check_target_revision(entity, key, envelope, expected)?;

        let dir = self.entity_dir(entity);
        let path = self.document_path(entity, key);
        let bytes = encode_document(self.format, envelope)
            .map_err(|e| StorageError::malformed(entity.as_str(), key.as_str(), e))?;

        self.locks.with_lock(&path, || {
            let actual = self
                .read_path(entity, key.as_str(), &path)?
                .map(|stored| stored.revision)
                .unwrap_or(Revision::ZERO);
            if actual != expected {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }

            fs::create_dir_all(&dir)?;
            write_atomic(&dir, &path, &bytes)?;
            tracing::debug!(
                entity = entity.as_str(),
                key = key.as_str(),
                revision = %envelope.revision,
                "wrote document"
            );
            Ok(envelope.revision)
        })
    }

    fn delete(&self, entity: &EntityType, key: &EntityKey) -> Result<(), StorageError> {
        self.ensure_open()?;
        let dir = self.entity_dir(entity);
        let path = self.document_path(entity, key);
        self.locks.with_lock(&path, || match fs::remove_file(&path) {
            Ok(()) => sync_dir(&dir),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
    }

    fn read_all(&self, entity: &EntityType) -> Result<RecordIter<'_>, StorageError> {
        self.ensure_open()?;
        let dir = self.entity_dir(entity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Box::new(std::iter::empty())),
            Err(e) => return Err(e.into()),
        };

        let extension = self.format.extension();
        let entity = entity.clone();
        let iter = entries.filter_map(move |entry| {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => return Some(Err(e.into())),
            };
            if path.extension().is_none_or(|ext| ext != extension) {
                return None;
            }
            let stem = path.file_stem()?.to_string_lossy().into_owned();
            let key = match EntityKey::new(stem) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unrecognized document");
                    return None;
                }
            };
            let result = self.locks.with_lock(&path, || {
                self.read_path(&entity, key.as_str(), &path)
            });
            match result {
                Ok(Some(envelope)) => Some(Ok((key, envelope))),
                // Deleted between listing and reading.
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::new(iter))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
