//! Trusted-sender public key table.
//!
//! One line per key: `key_id<WS>base64(pubkey)`. Lines starting with `#`
//! and blank lines are skipped; a later entry for the same `key_id`
//! overwrites an earlier one. Malformed lines are ignored rather than
//! failing the whole file, so a hand-edited table with one bad line does
//! not lock out every sender.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

/// `key_id` → base64 public key.
pub type PubkeyMap = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("unable to open pubkeys file: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Loads the public key table from `path`.
///
/// # Errors
///
/// Fails only if the file cannot be read; malformed lines are skipped.
pub fn load_pubkeys(path: &Path) -> Result<PubkeyMap, KeystoreError> {
    let text = std::fs::read_to_string(path).map_err(|source| KeystoreError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_pubkeys(&text))
}

fn parse_pubkeys(text: &str) -> PubkeyMap {
    let mut out = PubkeyMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key_id, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let pubkey = rest.trim();
        if key_id.is_empty() || pubkey.is_empty() {
            continue;
        }
        out.insert(key_id.to_string(), pubkey.to_string());
    }
    out
}
