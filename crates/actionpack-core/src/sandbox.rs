//! Sandboxed atomic file writer.
//!
//! All pack writes land under one realpath-resolved root. The containment
//! check canonicalizes the *parent* directory before the temp file is
//! created and forms the final destination by joining that canonical
//! parent with the vetted basename. This kills symlink traversal at the
//! moment of the check; a concurrent attacker with write access inside the
//! sandbox root is outside the threat model.
//!
//! The write itself is the usual crash-safe sequence: temp file in the
//! same directory, full write, fchmod, fsync, refuse directory
//! destinations, atomic rename, best-effort parent fsync.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Write failures. Display strings are the transcript `STEP <i> write ERR`
/// details.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("path must be absolute")]
    NotAbsolute,
    #[error("bad path")]
    BadPath,
    #[error("bad filename")]
    BadFilename,
    #[error("bad parent dir")]
    BadParentDir,
    #[error("path outside root")]
    OutsideRoot,
    #[error("executable writes forbidden")]
    ExecWritesForbidden,
    #[error("mkstemp failed: {0}")]
    TempCreate(std::io::Error),
    #[error("temp is not a regular file")]
    TempNotRegular,
    #[error("write failed")]
    WriteFailed,
    #[error("destination is a directory")]
    DestinationIsDirectory,
    #[error("rename failed: {0}")]
    RenameFailed(std::io::Error),
}

/// A realpath-resolved sandbox root. Construction canonicalizes once, at
/// startup; the server refuses to run without one.
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    canonical: PathBuf,
    canonical_str: String,
}

impl SandboxRoot {
    /// Resolves `path` to its canonical form.
    ///
    /// # Errors
    ///
    /// Fails if the directory does not exist or cannot be canonicalized.
    pub fn resolve(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let canonical = fs::canonicalize(path)?;
        let canonical_str = canonical.to_string_lossy().into_owned();
        Ok(Self {
            canonical,
            canonical_str,
        })
    }

    /// The canonical root path.
    #[must_use]
    pub fn canonical(&self) -> &Path {
        &self.canonical
    }

    /// Boundary-aware prefix check: `candidate` is the root itself or a
    /// descendant. `"/tmp/rootx"` is not under `"/tmp/root"`.
    #[must_use]
    pub fn contains_str(&self, candidate: &str) -> bool {
        if candidate.is_empty() {
            return false;
        }
        let root = self.canonical_str.as_str();
        match candidate.strip_prefix(root) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    /// [`Self::contains_str`] over a `Path`.
    #[must_use]
    pub fn contains_path(&self, candidate: &Path) -> bool {
        self.contains_str(&candidate.to_string_lossy())
    }
}

/// Effective mode for a write: masked to `0o777` with setuid/setgid/sticky
/// cleared, defaulting to `0o644` when nothing remains.
fn effective_mode(requested: u32) -> u32 {
    let mut m = requested & 0o777;
    m &= !0o7000;
    if m == 0 {
        m = 0o644;
    }
    m
}

/// Atomically writes `data` to the absolute `path` under `root`.
///
/// On success returns the canonical destination path, which the executor
/// records so a file written by the current pack can never be executed by
/// a later step of the same pack.
///
/// # Errors
///
/// See [`WriteError`]; no file outside the root is ever created or
/// truncated, and a failed write leaves no temp file behind.
pub fn write_file(
    root: &SandboxRoot,
    allow_exec_writes: bool,
    path: &str,
    data: &[u8],
    mode: u32,
) -> Result<PathBuf, WriteError> {
    if !path.starts_with('/') {
        return Err(WriteError::NotAbsolute);
    }
    let Some(slash) = path.rfind('/') else {
        return Err(WriteError::BadPath);
    };
    if slash == 0 {
        return Err(WriteError::BadPath);
    }
    let parent = &path[..slash];
    let base = &path[slash + 1..];
    if base.is_empty() || base.contains('/') {
        return Err(WriteError::BadFilename);
    }

    let parent_canon = fs::canonicalize(parent).map_err(|_| WriteError::BadParentDir)?;
    if !root.contains_path(&parent_canon) {
        return Err(WriteError::BadParentDir);
    }
    let canon = parent_canon.join(base);
    if !root.contains_path(&canon) {
        return Err(WriteError::OutsideRoot);
    }

    let mode = effective_mode(mode);
    if !allow_exec_writes && mode & 0o111 != 0 {
        return Err(WriteError::ExecWritesForbidden);
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".ap_tmp.")
        .tempfile_in(&parent_canon)
        .map_err(WriteError::TempCreate)?;

    let meta = tmp.as_file().metadata().map_err(|_| WriteError::TempNotRegular)?;
    if !meta.is_file() {
        return Err(WriteError::TempNotRegular);
    }

    tmp.write_all(data).map_err(|_| WriteError::WriteFailed)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|_| WriteError::WriteFailed)?;
    tmp.as_file().sync_all().map_err(|_| WriteError::WriteFailed)?;

    // rename(2) over a directory fails anyway; refusing up front gives the
    // caller a stable error instead of an OS-specific one.
    if let Ok(dst) = fs::symlink_metadata(&canon) {
        if dst.is_dir() {
            return Err(WriteError::DestinationIsDirectory);
        }
    }

    tmp.persist(&canon)
        .map_err(|e| WriteError::RenameFailed(e.error))?;

    // Durability of the rename itself is best-effort.
    if let Ok(dir) = fs::File::open(&parent_canon) {
        let _ = dir.sync_all();
    }

    Ok(canon)
}
