use super::{QueueError, QueueState, QueueStore};
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// An exclusive advisory lock on a file, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

/// Block until the advisory lock on `path` is ours. The file is created if
/// missing and its contents are never read.
pub fn lock_exclusive_at(path: &Path) -> Result<FileLock, QueueError> {
    let io_err = |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)?;
    file.lock_exclusive().map_err(io_err)?;
    Ok(FileLock { _file: file })
}

/// Whole-state JSON file, replaced atomically (write temp, fsync, rename).
///
/// The data file is swapped by rename on every write, so locks live on
/// sibling files: `<name>.lock` for single operations and
/// `<name>.drain.lock` for drains.
pub struct JsonFileStore {
    path: PathBuf,
    fsync: bool,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn tmp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> QueueError {
        QueueError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl QueueStore for JsonFileStore {
    fn load(&mut self) -> Result<QueueState, QueueError> {
        let tmp = self.tmp_path();
        if tmp.exists() {
            // Leftover from a write that never reached rename; writers hold
            // the lock, so nobody is mid-write now.
            warn!(path = %tmp.display(), "discarding incomplete queue write");
            let _ = fs::remove_file(&tmp);
        }

        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueState::default());
            }
            Err(e) => return Err(self.io_err(&self.path, e)),
        };
        serde_json::from_slice(&raw).map_err(|source| QueueError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    fn persist(&mut self, state: &QueueState) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(parent, e))?;
        }

        let bytes = serde_json::to_vec_pretty(state).map_err(QueueError::Encode)?;
        let tmp = self.tmp_path();
        {
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| self.io_err(&tmp, e))?;
            f.write_all(&bytes).map_err(|e| self.io_err(&tmp, e))?;
            if self.fsync {
                f.sync_all().map_err(|e| self.io_err(&tmp, e))?;
            }
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(&self.path, e))?;

        if self.fsync {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                // Directory fsync makes the rename itself durable; not every
                // platform allows opening a directory, so failure is tolerated.
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn exclusive(&self) -> Result<Option<FileLock>, QueueError> {
        lock_exclusive_at(&self.sibling(".lock")).map(Some)
    }

    fn drain_lock_path(&self) -> Option<PathBuf> {
        Some(self.sibling(".drain.lock"))
    }
}
