//! Key management: `keygen` and `export-pub`.

use actionpack_core::crypto::KeyStore;
use actionpack_core::paths;
use anyhow::{Context, Result};

/// Opens the sender's key store, creating the directory on first use.
pub fn open_keystore() -> Result<KeyStore> {
    paths::ensure_data_dir().context("HOME unavailable; cannot open key store")?;
    let dir = paths::keys_dir().context("HOME unavailable")?;
    Ok(KeyStore::open(dir)?)
}

/// Ensures a key exists and prints its public key. Idempotent.
pub fn keygen(key_id: &str) -> Result<()> {
    let pubkey = open_keystore()?.generate(key_id)?;
    println!("{pubkey}");
    Ok(())
}

/// Prints the public key of an existing key.
pub fn export_pub(key_id: &str) -> Result<()> {
    let pubkey = open_keystore()?.export_public(key_id)?;
    println!("{pubkey}");
    Ok(())
}
