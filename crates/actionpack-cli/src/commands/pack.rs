//! Pack authoring and delivery: `pack`, `run`, `send`.

use std::path::Path;
use std::process::ExitCode;

use actionpack_core::executor::now_epoch_ms;
use actionpack_core::{compile_script, encode_envelope, encode_payload, Envelope, Pack};
use anyhow::{Context, Result};

use super::finish_transcript;
use super::keys::open_keystore;
use crate::client;

/// Compiles, signs, and frames a script into wire bytes.
fn build_envelope(script_path: &Path, key_id: &str, ttl_ms: u64) -> Result<(Pack, Vec<u8>)> {
    let script = std::fs::read_to_string(script_path)
        .with_context(|| format!("unable to open: {}", script_path.display()))?;
    let pack = compile_script(&script, key_id, now_epoch_ms(), ttl_ms)?;
    let payload = encode_payload(&pack)?;
    let signature = open_keystore()?.sign(key_id, &payload)?;
    let bytes = encode_envelope(&Envelope { payload, signature })?;
    Ok((pack, bytes))
}

/// `pack <script> --out <file>`: write a signed envelope to disk.
pub fn pack(script: &Path, out: &Path, key_id: &str, ttl_ms: u64) -> Result<ExitCode> {
    let (pack, bytes) = build_envelope(script, key_id, ttl_ms)?;
    std::fs::write(out, &bytes).with_context(|| format!("unable to write: {}", out.display()))?;
    println!("OK pack_id={} bytes={}", pack.pack_id.hex(), bytes.len());
    Ok(ExitCode::SUCCESS)
}

/// `run <script> --to <receiver>`: compile, sign, deliver, print the
/// transcript.
pub fn run(script: &Path, to: &str, key_id: &str, ttl_ms: u64) -> Result<ExitCode> {
    let (_pack, bytes) = build_envelope(script, key_id, ttl_ms)?;
    let transcript = client::send_envelope(to, &bytes)?;
    Ok(finish_transcript(&transcript))
}

/// `send --to <receiver> <file>`: deliver a prebuilt envelope.
pub fn send(to: &str, file: &Path) -> Result<ExitCode> {
    let bytes =
        std::fs::read(file).with_context(|| format!("unable to open: {}", file.display()))?;
    let transcript = client::send_envelope(to, &bytes)?;
    Ok(finish_transcript(&transcript))
}
