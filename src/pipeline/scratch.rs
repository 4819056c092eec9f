//! Scratch files shared between the pipeline stages.
//!
//! The HTML page and the rendered single-page PDF are handed from stage to
//! stage through the filesystem. [`ScratchFiles`] owns both paths and removes
//! the files when the job ends, on success, on error, and when the job future
//! is dropped or panics (via `Drop`).
//!
//! With [`ScratchPolicy::Fixed`] the paths are the same for every job, so no
//! two jobs may use one work directory at once. [`gate_for`] hands every
//! archiver in the process the same gate for the same directory, and
//! [`ScratchLock`] extends the exclusion to other processes.
//! [`ScratchPolicy::PerJob`] puts the files in a private `TempDir` instead.

use crate::config::{ArchiveConfig, ScratchPolicy};
use crate::error::GenerationError;
use fs2::FileExt;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Name of the advisory lock file kept in a fixed-path work directory.
pub const LOCK_FILE_NAME: &str = ".convo-archive.lock";

static GATES: Lazy<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The in-process job gate for `work_dir`.
///
/// Paths are compared after canonicalisation, so `./out` and its absolute
/// form share one gate. Gates nobody holds are dropped from the registry.
pub fn gate_for(work_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = location_key(work_dir);
    let mut gates = GATES.lock().unwrap_or_else(|e| e.into_inner());
    gates.retain(|_, gate| Arc::strong_count(gate) > 1);
    Arc::clone(gates.entry(key).or_default())
}

fn location_key(work_dir: &Path) -> PathBuf {
    // canonicalize needs the directory; the job creates it anyway
    if let Err(e) = std::fs::create_dir_all(work_dir) {
        debug!("Cannot create work dir {}: {}", work_dir.display(), e);
    }
    std::fs::canonicalize(work_dir)
        .or_else(|_| std::path::absolute(work_dir))
        .unwrap_or_else(|_| work_dir.to_path_buf())
}

/// Exclusive advisory lock on a work directory's fixed scratch paths.
///
/// Held for the whole job and released on drop. The lock file itself is
/// left in place.
#[derive(Debug)]
pub struct ScratchLock {
    file: File,
    path: PathBuf,
}

impl ScratchLock {
    /// Take the lock without waiting. `Ok(None)` means another job holds it.
    pub fn try_acquire(work_dir: &Path) -> Result<Option<Self>, GenerationError> {
        let path = work_dir.join(LOCK_FILE_NAME);
        let write_err = |source: std::io::Error| GenerationError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(work_dir).map_err(write_err)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(write_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked {}", path.display());
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!("{} is held by another job", path.display());
                Ok(None)
            }
            Err(e) => Err(write_err(e)),
        }
    }
}

impl Drop for ScratchLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Scratch HTML/PDF paths for one job.
#[derive(Debug)]
pub struct ScratchFiles {
    html: PathBuf,
    pdf: PathBuf,
    // Kept alive until cleanup; removing it deletes the per-job directory.
    dir: Option<TempDir>,
    cleaned: bool,
}

impl ScratchFiles {
    /// Resolve the scratch paths for a new job and clear stale leftovers.
    pub fn prepare(config: &ArchiveConfig) -> Result<Self, GenerationError> {
        let work_dir = &config.work_dir;
        std::fs::create_dir_all(work_dir).map_err(|e| GenerationError::Write {
            path: work_dir.clone(),
            source: e,
        })?;

        let (base, dir) = match config.scratch {
            ScratchPolicy::Fixed => (work_dir.clone(), None),
            ScratchPolicy::PerJob => {
                let dir = tempfile::Builder::new()
                    .prefix(".convo-job-")
                    .tempdir_in(work_dir)
                    .map_err(|e| GenerationError::Write {
                        path: work_dir.clone(),
                        source: e,
                    })?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let scratch = Self {
            html: base.join(&config.html_file_name),
            pdf: base.join(&config.page_file_name),
            dir,
            cleaned: false,
        };

        // A crashed earlier run can leave files at the fixed paths.
        for path in [&scratch.html, &scratch.pdf] {
            if path.exists() {
                debug!("Removing stale scratch file {}", path.display());
                remove_quietly(path);
            }
        }

        Ok(scratch)
    }

    pub fn html_path(&self) -> &Path {
        &self.html
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf
    }

    /// Delete both scratch files. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        remove_quietly(&self.html);
        remove_quietly(&self.pdf);
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove scratch directory {}: {}", path.display(), e);
            }
        }
        self.cleaned = true;
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed scratch file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove scratch file {}: {}", path.display(), e),
    }
}
