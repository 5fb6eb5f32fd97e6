//! Sender-side state files: the receiver directory and the line-oriented
//! receiver setup files.
//!
//! Every mutation is lock-then-read-modify-write-atomic: an advisory
//! `.lock` file serializes concurrent CLI invocations, and the content is
//! written to a temp file in the same directory, fchmodded to 0600,
//! fsynced, and renamed over the destination.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use actionpack_core::paths;
use anyhow::{Context, Result};
use fs2::FileExt;

/// Exclusive advisory lock held for the lifetime of the guard.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquires (blocking) the lock file next to `path`.
    ///
    /// # Errors
    ///
    /// Fails if the lock file cannot be created or locked.
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".lock");
            std::path::PathBuf::from(p)
        };
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Atomically writes `data` to `path` with mode 0600.
///
/// # Errors
///
/// Any I/O failure of the temp-write-rename sequence.
pub fn write_text_atomic(path: &Path, data: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp.")
        .tempfile_in(parent)
        .context("creating temp file")?;
    tmp.write_all(data.as_bytes()).context("writing temp file")?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o600))
        .context("setting temp file mode")?;
    tmp.as_file().sync_all().context("syncing temp file")?;
    tmp.persist(path)
        .with_context(|| format!("renaming over {}", path.display()))?;
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Loads the receiver directory (`name → host:port`), skipping comments
/// and malformed lines. A missing file is an empty directory.
#[must_use]
pub fn load_receivers() -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(path) = paths::receivers_path() else {
        return out;
    };
    let Ok(text) = std::fs::read_to_string(path) else {
        return out;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, addr)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let addr = addr.trim();
        if name.is_empty() || addr.is_empty() {
            continue;
        }
        out.insert(name.to_string(), addr.to_string());
    }
    out
}

/// Persists the receiver directory under its lock.
///
/// # Errors
///
/// Fails when `HOME` is unavailable or the write fails.
pub fn save_receivers(receivers: &BTreeMap<String, String>) -> Result<()> {
    paths::ensure_data_dir().context("HOME unavailable; cannot persist receivers")?;
    let path = paths::receivers_path().context("HOME unavailable")?;
    let _lock = FileLock::acquire(&path)?;
    let mut data = String::new();
    for (name, addr) in receivers {
        data.push_str(name);
        data.push(' ');
        data.push_str(addr);
        data.push('\n');
    }
    write_text_atomic(&path, &data)
}

/// Replaces every line of `path` starting with `prefix` by `line`, or
/// appends `line` if none matched. Used to upsert one key's entry in the
/// pubkeys and policy files.
///
/// # Errors
///
/// Fails when the lock or the atomic rewrite fails.
pub fn replace_or_append_line(path: &Path, prefix: &str, line: &str) -> Result<()> {
    let _lock = FileLock::acquire(path)?;
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<String> = existing.lines().map(ToString::to_string).collect();
    let mut replaced = false;
    for l in &mut lines {
        if l.trim_start().starts_with(prefix) {
            *l = line.to_string();
            replaced = true;
        }
    }
    if !replaced {
        lines.push(line.to_string());
    }
    let mut data = lines.join("\n");
    data.push('\n');
    write_text_atomic(path, &data)
}
