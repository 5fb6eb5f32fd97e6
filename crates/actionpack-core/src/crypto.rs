//! Signing capability: ECDSA P-256 over SHA-256 with a file-backed key
//! store.
//!
//! Four operations, no algorithm alternatives: `generate`, `export_public`,
//! `sign`, and the free [`verify`]. Private keys never leave the store; the
//! exported form is the base64 of the SEC1 uncompressed public point (65
//! bytes), and signatures are DER-encoded so verifiers accept exactly what
//! signers produce.
//!
//! # Storage
//!
//! One `<key_id>.key` file per key under the store directory, holding the
//! raw 32-byte secret scalar. Files are created `0600` inside a `0700`
//! directory and permissions are re-verified on every open; a key file
//! readable by group or other is refused rather than used.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

/// Errors from key management, signing, and verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No key stored under this identifier.
    #[error("key not found: {key_id}")]
    KeyNotFound {
        /// The identifier that was not found.
        key_id: String,
    },

    /// Identifier contains characters unsafe for a file name.
    #[error("invalid key_id: {key_id}")]
    InvalidKeyId {
        /// The offending identifier.
        key_id: String,
    },

    /// Stored key bytes do not form a valid P-256 secret scalar.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Key file or directory is readable by group or other.
    #[error("insecure permissions on {path}")]
    InsecurePermissions {
        /// The path with insecure permissions.
        path: String,
    },

    /// Public key is not valid base64 or not a valid SEC1 point.
    #[error("bad public key encoding")]
    BadPublicKey,

    /// Signature bytes are not valid DER ECDSA.
    #[error("bad signature encoding")]
    BadSignature,

    /// Signature does not verify over the payload.
    #[error("verification failed")]
    VerificationFailed,
}

/// File-backed store of P-256 signing keys, one file per `key_id`.
#[derive(Debug, Clone)]
pub struct KeyStore {
    keys_dir: PathBuf,
}

impl KeyStore {
    /// Opens (creating if needed) a key store rooted at `keys_dir`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or is readable by group or
    /// other.
    pub fn open(keys_dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let keys_dir = keys_dir.as_ref().to_path_buf();
        if !keys_dir.exists() {
            fs::create_dir_all(&keys_dir)?;
            fs::set_permissions(&keys_dir, fs::Permissions::from_mode(0o700))?;
        }
        let mode = fs::metadata(&keys_dir)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(CryptoError::InsecurePermissions {
                path: keys_dir.display().to_string(),
            });
        }
        Ok(Self { keys_dir })
    }

    /// Ensures a key exists for `key_id` and returns its public key as
    /// base64 of the SEC1 uncompressed point. Idempotent: an existing key
    /// is returned, never regenerated.
    ///
    /// # Errors
    ///
    /// Fails on invalid `key_id`, storage errors, or corrupt key material.
    pub fn generate(&self, key_id: &str) -> Result<String, CryptoError> {
        let path = self.key_path(key_id)?;
        if path.exists() {
            return self.export_public(key_id);
        }

        let key = SigningKey::random(&mut rand::thread_rng());
        let secret = key.to_bytes();

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(secret.as_slice())?;
        file.sync_all()?;

        Ok(encode_public(&key))
    }

    /// Exports the public key for an existing `key_id`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] if no key is stored under `key_id`.
    pub fn export_public(&self, key_id: &str) -> Result<String, CryptoError> {
        let key = self.load(key_id)?;
        Ok(encode_public(&key))
    }

    /// Signs `payload` with the key stored under `key_id`. The signature
    /// is ECDSA P-256 over SHA-256, DER-encoded.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] if the key does not exist, or a storage
    /// error reading it.
    pub fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.load(key_id)?;
        let signature: Signature = key.sign(payload);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn load(&self, key_id: &str) -> Result<SigningKey, CryptoError> {
        let path = self.key_path(key_id)?;
        if !path.exists() {
            return Err(CryptoError::KeyNotFound {
                key_id: key_id.to_string(),
            });
        }
        let mode = fs::metadata(&path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(CryptoError::InsecurePermissions {
                path: path.display().to_string(),
            });
        }
        let bytes = fs::read(&path)?;
        SigningKey::from_slice(&bytes)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))
    }

    fn key_path(&self, key_id: &str) -> Result<PathBuf, CryptoError> {
        // key_id becomes a file name; restrict it to a safe alphabet.
        let safe = !key_id.is_empty()
            && key_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && !key_id.starts_with('.');
        if !safe {
            return Err(CryptoError::InvalidKeyId {
                key_id: key_id.to_string(),
            });
        }
        Ok(self.keys_dir.join(format!("{key_id}.key")))
    }
}

fn encode_public(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    BASE64.encode(point.as_bytes())
}

/// Verifies a DER ECDSA P-256 signature over `payload` against a base64
/// SEC1 public key.
///
/// # Errors
///
/// [`CryptoError::BadPublicKey`] or [`CryptoError::BadSignature`] for
/// malformed inputs, [`CryptoError::VerificationFailed`] when the signature
/// does not match.
pub fn verify(pubkey_b64: &str, payload: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let point = BASE64
        .decode(pubkey_b64.trim())
        .map_err(|_| CryptoError::BadPublicKey)?;
    let key = VerifyingKey::from_sec1_bytes(&point).map_err(|_| CryptoError::BadPublicKey)?;
    let signature = Signature::from_der(signature).map_err(|_| CryptoError::BadSignature)?;
    key.verify(payload, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, KeyStore) {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path().join("keys")).unwrap();
        (dir, store)
    }

    #[test]
    fn generate_is_idempotent() {
        let (_dir, store) = store();
        let first = store.generate("default").unwrap();
        let second = store.generate("default").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.export_public("default").unwrap(), first);
    }

    #[test]
    fn exported_key_is_uncompressed_sec1() {
        let (_dir, store) = store();
        let pub_b64 = store.generate("k1").unwrap();
        let bytes = BASE64.decode(pub_b64).unwrap();
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[0], 0x04);
    }

    #[test]
    fn sign_verify_round_trip() {
        let (_dir, store) = store();
        let pub_b64 = store.generate("k1").unwrap();
        let payload = b"signed payload bytes";
        let sig = store.sign("k1", payload).unwrap();
        verify(&pub_b64, payload, &sig).unwrap();
    }

    #[test]
    fn tamper_detection_payload_and_signature() {
        let (_dir, store) = store();
        let pub_b64 = store.generate("k1").unwrap();
        let payload = b"signed payload bytes".to_vec();
        let sig = store.sign("k1", &payload).unwrap();

        let mut bad_payload = payload.clone();
        bad_payload[0] ^= 0x01;
        assert!(verify(&pub_b64, &bad_payload, &sig).is_err());

        // Flipping a bit in the DER body either breaks the encoding or the
        // verification; both must fail.
        let mut bad_sig = sig.clone();
        let last = bad_sig.len() - 1;
        bad_sig[last] ^= 0x01;
        assert!(verify(&pub_b64, &payload, &bad_sig).is_err());
    }

    #[test]
    fn verify_with_wrong_key_fails() {
        let (_dir, store) = store();
        store.generate("a").unwrap();
        let other = store.generate("b").unwrap();
        let sig = store.sign("a", b"payload").unwrap();
        assert!(matches!(
            verify(&other, b"payload", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn missing_key_and_bad_key_id() {
        let (_dir, store) = store();
        assert!(matches!(
            store.export_public("nope"),
            Err(CryptoError::KeyNotFound { .. })
        ));
        assert!(matches!(
            store.generate("../escape"),
            Err(CryptoError::InvalidKeyId { .. })
        ));
        assert!(matches!(
            store.generate(""),
            Err(CryptoError::InvalidKeyId { .. })
        ));
    }

    #[test]
    fn rejects_group_readable_key_file() {
        let (_dir, store) = store();
        store.generate("k1").unwrap();
        let path = store.key_path("k1").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            store.sign("k1", b"x"),
            Err(CryptoError::InsecurePermissions { .. })
        ));
    }

    #[test]
    fn verify_rejects_malformed_inputs() {
        let (_dir, store) = store();
        let pub_b64 = store.generate("k1").unwrap();
        let sig = store.sign("k1", b"p").unwrap();
        assert!(matches!(
            verify("!!!not-base64!!!", b"p", &sig),
            Err(CryptoError::BadPublicKey)
        ));
        assert!(matches!(
            verify(&pub_b64, b"p", b"not der"),
            Err(CryptoError::BadSignature)
        ));
    }
}
