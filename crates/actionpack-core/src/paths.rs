//! Default on-disk locations for receiver and sender state.
//!
//! Everything lives under `$HOME/.local/share/actionpack`. Callers that
//! need different locations pass explicit paths; these helpers only supply
//! the conventional defaults, and return `None` when `HOME` is unset.

use std::path::PathBuf;

/// The user's home directory, from `HOME`.
#[must_use]
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Application data directory: `$HOME/.local/share/actionpack`.
#[must_use]
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".local/share/actionpack"))
}

/// Creates the data directory if needed and returns it.
///
/// # Errors
///
/// Fails when `HOME` is unset or the directory cannot be created.
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = data_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "HOME unavailable")
    })?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Trusted-sender public key table.
#[must_use]
pub fn pubkeys_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("action_pack_pubkeys"))
}

/// Per-key policy file.
#[must_use]
pub fn policy_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("action_pack.policy"))
}

/// Replay cache file.
#[must_use]
pub fn seen_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("action_pack_seen"))
}

/// Receiver daemon configuration.
#[must_use]
pub fn receiver_conf_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("action_pack_receiver.conf"))
}

/// Sender-side receiver directory (name → host:port).
#[must_use]
pub fn receivers_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("action_pack_receivers"))
}

/// Sender-side private key store directory.
#[must_use]
pub fn keys_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("keys"))
}
