//! Filesystem primitives used by the cache.
//!
//! Writes are exclusive-locked for the duration of the write only: a sibling
//! `.<name>.lock` file is created with `create_new`, the bytes go to
//! `.<name>.tmp`, are synced, and are renamed over the target. Lock and temp
//! files are hidden so directory listings never report them.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

use crate::Error;

const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Storage backend for catalogs and history files.
pub trait Storage: Send + Sync {
    /// Create a directory and its parents. Succeeds if it already exists.
    fn create_dir(&self, path: &Path) -> Result<(), Error>;

    /// Durably replace the file at `path` with `bytes`.
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), Error>;

    /// Read a file, or `None` if it does not exist.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, Error>;

    /// Names of the visible regular files directly inside `dir`.
    fn list_files(&self, dir: &Path) -> Result<Vec<String>, Error>;

    /// Delete one file. Missing files are not an error.
    fn delete_file(&self, path: &Path) -> Result<(), Error>;

    /// Recursively delete a directory. Returns whether anything was deleted.
    fn delete_dir(&self, path: &Path) -> Result<bool, Error>;

    /// A path inside `dir` that no existing file occupies.
    fn available_path(&self, dir: &Path) -> PathBuf;
}

/// Local filesystem storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

struct WriteLock {
    path: PathBuf,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn hidden_sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let hidden = if name.starts_with('.') { format!("{name}{suffix}") } else { format!(".{name}{suffix}") };
    path.with_file_name(hidden)
}

fn lock_age(lock_path: &Path) -> Option<Duration> {
    fs::metadata(lock_path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| SystemTime::now().duration_since(time).ok())
}

impl FsStorage {
    fn acquire_lock(&self, path: &Path) -> Result<WriteLock, Error> {
        let lock_path = hidden_sibling(path, ".lock");
        let deadline = Instant::now() + LOCK_WAIT_TIMEOUT;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => return Ok(WriteLock { path: lock_path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&lock_path).is_some_and(|age| age > LOCK_STALE_AFTER) {
                        tracing::warn!("removing stale lock {}", lock_path.display());
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(path.to_path_buf()));
                    }
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(Error::storage(&lock_path, e)),
            }
        }
    }
}

impl Storage for FsStorage {
    fn create_dir(&self, path: &Path) -> Result<(), Error> {
        fs::create_dir_all(path).map_err(|e| Error::storage(path, e))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), Error> {
        let _lock = self.acquire_lock(path)?;
        let tmp_path = hidden_sibling(path, ".tmp");

        let result = File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp_path, path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::storage(path, e));
        }

        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(path, e)),
        }
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<String>, Error> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(dir, e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_file && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }

    fn delete_file(&self, path: &Path) -> Result<(), Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(path, e)),
        }
    }

    fn delete_dir(&self, path: &Path) -> Result<bool, Error> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage(path, e)),
        }
    }

    fn available_path(&self, dir: &Path) -> PathBuf {
        loop {
            let candidate = dir.join(Uuid::now_v7().simple().to_string());
            if !candidate.exists() {
                return candidate;
            }
        }
    }
}
