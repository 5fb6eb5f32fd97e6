//! Replay cache: persistent record of accepted pack identifiers.
//!
//! The cache is an append-only text file of `hex(pack_id)\texpires_ms`
//! lines mirrored by an in-memory map. On load, entries whose nonzero
//! expiry is already in the past are pruned; entries with expiry 0 are
//! permanent. The check-then-record step is a single critical section at
//! the call site (the executor holds the cache behind a mutex), so the
//! replay decision is linearizable.
//!
//! Appends are flushed but not fsynced: losing the tail of the file on
//! power failure re-opens a bounded replay window, which the expiry bound
//! already tolerates.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Outcome of a replay check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    /// Identifier not seen before (or only by an expired entry); recorded.
    Fresh,
    /// Identifier already accepted and still live.
    Replayed,
}

/// In-memory map plus its backing append-only file.
#[derive(Debug)]
pub struct ReplayCache {
    path: PathBuf,
    seen: HashMap<String, u64>,
}

impl ReplayCache {
    /// Loads the cache from `path`, pruning entries whose nonzero expiry
    /// is before `now_ms`. A missing file yields an empty cache.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>, now_ms: u64) -> Self {
        let path = path.into();
        let mut seen = HashMap::new();
        if let Ok(text) = std::fs::read_to_string(&path) {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((hex, expires)) = line.split_once('\t') else {
                    continue;
                };
                let Ok(expires_ms) = expires.trim().parse::<u64>() else {
                    continue;
                };
                if expires_ms != 0 && expires_ms < now_ms {
                    continue;
                }
                seen.insert(hex.to_string(), expires_ms);
            }
        }
        Self { path, seen }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Checks `pack_id_hex` against the cache and, when fresh, records it
    /// with `expires_ms` both in memory and on disk.
    ///
    /// An existing entry rejects the pack while its expiry is 0 (permanent)
    /// or still in the future; an expired entry is overwritten and the pack
    /// accepted.
    pub fn check_and_record(
        &mut self,
        pack_id_hex: &str,
        expires_ms: u64,
        now_ms: u64,
    ) -> ReplayCheck {
        if let Some(&expiry) = self.seen.get(pack_id_hex) {
            if expiry == 0 || expiry > now_ms {
                return ReplayCheck::Replayed;
            }
            self.seen.remove(pack_id_hex);
        }
        self.seen.insert(pack_id_hex.to_string(), expires_ms);
        self.append(pack_id_hex, expires_ms);
        ReplayCheck::Fresh
    }

    fn append(&self, pack_id_hex: &str, expires_ms: u64) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                writeln!(file, "{pack_id_hex}\t{expires_ms}")?;
                file.flush()
            });
        if let Err(e) = result {
            // The in-memory record still protects this process; only the
            // cross-restart record is degraded.
            warn!(path = %self.path.display(), error = %e, "replay cache append failed");
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
