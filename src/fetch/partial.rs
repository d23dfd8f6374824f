use std::{
    collections::BTreeSet,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

pub const PARTIAL_SUFFIX: &str = ".part";

/// `<destination>.part`, next to the destination so promotion is a same-directory rename.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut s: OsString = destination.as_os_str().to_owned();
    s.push(PARTIAL_SUFFIX);
    PathBuf::from(s)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX) && n.len() > PARTIAL_SUFFIX.len())
}

/// Remove every `*.part` file directly inside `dir`. Returns how many were removed.
pub fn sweep(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if is_partial(&path) && entry.file_type()?.is_file() {
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "removed partial file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Session-scoped registry of partial files. Dropping the guard deletes every
/// registered partial that was not promoted, then sweeps the directory, so
/// cleanup also happens when the owning future is cancelled.
#[derive(Debug)]
pub struct PartialGuard {
    dir: PathBuf,
    paths: Mutex<BTreeSet<PathBuf>>,
}

impl PartialGuard {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), paths: Mutex::new(BTreeSet::new()) }
    }

    pub fn register(&self, path: &Path) {
        self.lock().insert(path.to_path_buf());
    }

    /// Forget a partial that has been promoted to its destination.
    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn pending(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Drop cannot await, so cleanup uses blocking `std::fs` once per session.
impl Drop for PartialGuard {
    fn drop(&mut self) {
        let paths = std::mem::take(self.paths.get_mut().unwrap_or_else(PoisonError::into_inner));
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed partial file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(path = %path.display(), "could not remove partial file: {err}"),
            }
        }
        if let Err(err) = sweep(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), "partial sweep failed: {err}");
        }
    }
}
