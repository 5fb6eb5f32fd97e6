//! Pack model: the authored, signed, and executed unit of work.
//!
//! A [`Pack`] carries a key identifier (selecting a verifier key and policy
//! on the receiver), a random 16-byte [`PackId`] used for replay detection,
//! optional time bounds, a pack-wide environment map, and an ordered list of
//! [`Step`]s. Packs are produced by the script compiler, serialized by the
//! codec, signed once, and discarded after transmission.

use std::collections::BTreeMap;

use rand::RngCore;

/// Hard cap on the number of steps a single pack may carry.
pub const MAX_STEPS: usize = 10_000;

/// Hard cap on the sum of embedded file bytes across all write steps.
pub const MAX_TOTAL_WRITE_BYTES: usize = 8 * 1024 * 1024;

/// Maximum length of a `key_id` in bytes.
pub const MAX_KEY_ID_LEN: usize = 255;

/// Random 16-byte pack identifier.
///
/// The identifier doubles as the replay-cache key and the transcript
/// identifier. It is generated from the OS RNG at compile time and never
/// reused: a sender that wants to retransmit must build a fresh pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackId(pub [u8; 16]);

impl PackId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Lowercase hex form (32 chars), as used in transcripts and the
    /// replay-cache file.
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the 32-char hex form back into an identifier.
    #[must_use]
    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut id = [0u8; 16];
        hex::decode_to_slice(s, &mut id).ok()?;
        Some(Self(id))
    }
}

/// One exec step: spawn `argv` with the pack environment applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecStep {
    /// Command and arguments. `argv[0]` is resolved by the executor
    /// (absolute path, relative-under-root, or a mapped bare name).
    pub argv: Vec<String>,
    /// Working directory; empty means the receiver's default.
    pub cwd: String,
    /// Per-step wall-clock timeout; 0 means no timeout.
    pub timeout_ms: u32,
}

/// One file write step, applied atomically under the receiver's sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFileStep {
    /// Absolute destination path on the receiver.
    pub path: String,
    /// Raw file contents.
    pub data: Vec<u8>,
    /// Requested mode; masked to `0o777` and policy-checked on the receiver.
    pub mode: u32,
}

/// A pack step. Kept as a tagged sum so step handling stays exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Exec(ExecStep),
    WriteFile(WriteFileStep),
}

/// The authored unit: signed as one payload, executed as one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pack {
    /// Selects the verifier key and policy on the receiving side.
    pub key_id: String,
    /// Creation time in epoch milliseconds; 0 means no creation bound.
    pub created_ms: u64,
    /// Expiry in epoch milliseconds; 0 means no absolute expiry.
    pub expires_ms: u64,
    /// Replay key and transcript identifier.
    pub pack_id: PackId,
    /// Pack-wide environment additions, applied to every exec step.
    pub env: BTreeMap<String, String>,
    /// Ordered steps; side effects within a pack are sequential.
    pub steps: Vec<Step>,
}

impl Pack {
    /// Sum of embedded bytes across all write steps.
    #[must_use]
    pub fn total_write_bytes(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s {
                Step::WriteFile(w) => w.data.len(),
                Step::Exec(_) => 0,
            })
            .sum()
    }
}
