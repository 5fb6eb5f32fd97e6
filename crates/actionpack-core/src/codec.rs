//! Binary codec for the pack payload and the transport envelope.
//!
//! Two frames, both little-endian:
//!
//! ```text
//! envelope:  "SAP1" | u32 payload_len | payload | u32 sig_len | sig
//! payload:   "APK1" | u8 version | u8 key_id_len | u16 reserved
//!            | u64 created_ms | u64 expires_ms | u8[16] pack_id
//!            | u32 env_count | u32 step_count | key_id
//!            | env entries | steps
//! ```
//!
//! The payload is what gets signed, so the encoding must be deterministic
//! for a given pack: the encoder writes env entries in the pack map's
//! iteration order and never reorders steps. The decoder is written against
//! untrusted bytes: every read is bounds-checked, lengths are validated
//! before allocation, step and embedded-write totals are capped, and
//! trailing bytes after the last step fail the decode.
//!
//! # Versioning
//!
//! The encoder writes payload version 2. Version 1 payloads are still
//! accepted on decode but reject write steps (opcode 2), which did not
//! exist in that version. The u16 reserved field is read and discarded.

use thiserror::Error;

use crate::pack::{
    ExecStep, Pack, PackId, Step, WriteFileStep, MAX_KEY_ID_LEN, MAX_STEPS, MAX_TOTAL_WRITE_BYTES,
};

const ENVELOPE_MAGIC: &[u8; 4] = b"SAP1";
const PAYLOAD_MAGIC: &[u8; 4] = b"APK1";
const PAYLOAD_VERSION: u8 = 2;

/// Fixed payload header size: magic, version, key_id_len, reserved,
/// created_ms, expires_ms, pack_id, env_count, step_count.
const PAYLOAD_HEADER_LEN: usize = 4 + 1 + 1 + 2 + 8 + 8 + 16 + 4 + 4;

const OPCODE_EXEC: u8 = 1;
const OPCODE_WRITE: u8 = 2;

/// Codec failures. Display strings are the wire-level error details that
/// end up in `ERR bad envelope:` / `ERR bad payload:` transcript lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("envelope too small")]
    EnvelopeTooSmall,
    #[error("bad envelope magic")]
    BadEnvelopeMagic,
    #[error("envelope truncated")]
    EnvelopeTruncated,
    #[error("empty payload")]
    EmptyPayload,
    #[error("empty signature")]
    EmptySignature,
    #[error("too large")]
    TooLarge,

    #[error("payload too small")]
    PayloadTooSmall,
    #[error("bad payload magic")]
    BadPayloadMagic,
    #[error("payload header truncated")]
    HeaderTruncated,
    #[error("unsupported payload version")]
    UnsupportedVersion,
    #[error("payload key_id truncated")]
    KeyIdTruncated,
    #[error("env truncated")]
    EnvTruncated,
    #[error("too many steps")]
    TooManySteps,
    #[error("step truncated")]
    StepTruncated,
    #[error("argv truncated")]
    ArgvTruncated,
    #[error("write truncated")]
    WriteTruncated,
    #[error("unsupported opcode")]
    UnsupportedOpcode,
    #[error("payload has trailing bytes")]
    TrailingBytes,

    #[error("missing key_id")]
    MissingKeyId,
    #[error("key_id too long")]
    KeyIdTooLong,
    #[error("string too long")]
    StringTooLong,
    #[error("blob too large")]
    BlobTooLarge,
    #[error("too many argv entries")]
    TooManyArgs,
    #[error("total embedded write bytes too large")]
    WriteBytesTooLarge,
}

/// Transport envelope: the signed payload plus its detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Bounds-checked cursor over untrusted input.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> bool {
        n <= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if !self.need(n) {
            return None;
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Some(head)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn read_u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32_le(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64_le(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    /// u16 length-prefixed byte string.
    fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u16_le()? as usize;
        self.take(len)
    }

    /// u16 length-prefixed UTF-8 string (lossy: the wire format carries
    /// arbitrary bytes; non-UTF-8 sequences are replaced, never rejected).
    fn read_string(&mut self) -> Option<String> {
        self.read_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

fn write_u16_le(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64_le(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// u16 length-prefixed string; values above 65 535 bytes do not fit.
fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    if s.len() > u16::MAX as usize {
        return Err(CodecError::StringTooLong);
    }
    write_u16_le(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// u32 length-prefixed blob, for embedded file bytes.
fn write_blob(out: &mut Vec<u8>, data: &[u8]) -> Result<(), CodecError> {
    if data.len() > u32::MAX as usize {
        return Err(CodecError::BlobTooLarge);
    }
    write_u32_le(out, data.len() as u32);
    out.extend_from_slice(data);
    Ok(())
}

/// Encodes a pack into the signed payload form (version 2).
///
/// # Errors
///
/// Rejects empty or oversized `key_id`, more than [`MAX_STEPS`] steps,
/// embedded write bytes beyond [`MAX_TOTAL_WRITE_BYTES`], and any string or
/// blob that does not fit its length prefix.
pub fn encode_payload(pack: &Pack) -> Result<Vec<u8>, CodecError> {
    if pack.key_id.is_empty() {
        return Err(CodecError::MissingKeyId);
    }
    if pack.key_id.len() > MAX_KEY_ID_LEN {
        return Err(CodecError::KeyIdTooLong);
    }
    if pack.steps.len() > MAX_STEPS {
        return Err(CodecError::TooManySteps);
    }
    let mut total_write = 0usize;
    for step in &pack.steps {
        if let Step::WriteFile(w) = step {
            total_write = total_write.saturating_add(w.data.len());
            if total_write > MAX_TOTAL_WRITE_BYTES {
                return Err(CodecError::WriteBytesTooLarge);
            }
        }
    }

    let mut out = Vec::with_capacity(PAYLOAD_HEADER_LEN + pack.key_id.len());
    out.extend_from_slice(PAYLOAD_MAGIC);
    out.push(PAYLOAD_VERSION);
    out.push(pack.key_id.len() as u8);
    write_u16_le(&mut out, 0); // reserved
    write_u64_le(&mut out, pack.created_ms);
    write_u64_le(&mut out, pack.expires_ms);
    out.extend_from_slice(&pack.pack_id.0);
    write_u32_le(&mut out, pack.env.len() as u32);
    write_u32_le(&mut out, pack.steps.len() as u32);
    out.extend_from_slice(pack.key_id.as_bytes());

    // Env entries, in map iteration order. The payload is what gets signed,
    // so the pack builder controls the order the signature covers.
    for (k, v) in &pack.env {
        write_str(&mut out, k)?;
        write_str(&mut out, v)?;
    }

    for step in &pack.steps {
        match step {
            Step::Exec(e) => {
                out.push(OPCODE_EXEC);
                out.push(0); // flags (reserved)
                write_u16_le(&mut out, 0); // reserved
                write_u32_le(&mut out, e.timeout_ms);
                write_str(&mut out, &e.cwd)?;
                if e.argv.len() > u16::MAX as usize {
                    return Err(CodecError::TooManyArgs);
                }
                write_u16_le(&mut out, e.argv.len() as u16);
                for arg in &e.argv {
                    write_str(&mut out, arg)?;
                }
            },
            Step::WriteFile(w) => {
                out.push(OPCODE_WRITE);
                out.push(0); // flags (reserved)
                write_u16_le(&mut out, 0); // reserved
                write_u32_le(&mut out, w.mode);
                write_str(&mut out, &w.path)?;
                write_blob(&mut out, &w.data)?;
            },
        }
    }

    Ok(out)
}

/// Decodes an untrusted payload buffer into a [`Pack`].
///
/// # Errors
///
/// Fails on bad magic, unsupported version, any truncated field, unknown
/// opcodes, limit violations, and trailing bytes after the last step.
pub fn decode_payload(payload: &[u8]) -> Result<Pack, CodecError> {
    let mut r = Reader::new(payload);
    if !r.need(PAYLOAD_HEADER_LEN) {
        return Err(CodecError::PayloadTooSmall);
    }
    if r.take(4) != Some(PAYLOAD_MAGIC.as_slice()) {
        return Err(CodecError::BadPayloadMagic);
    }

    let version = r.read_u8().ok_or(CodecError::HeaderTruncated)?;
    let key_id_len = r.read_u8().ok_or(CodecError::HeaderTruncated)? as usize;
    let _reserved = r.read_u16_le().ok_or(CodecError::HeaderTruncated)?;
    if version != 1 && version != PAYLOAD_VERSION {
        return Err(CodecError::UnsupportedVersion);
    }

    let mut pack = Pack {
        created_ms: r.read_u64_le().ok_or(CodecError::HeaderTruncated)?,
        expires_ms: r.read_u64_le().ok_or(CodecError::HeaderTruncated)?,
        ..Pack::default()
    };
    let id = r.take(16).ok_or(CodecError::HeaderTruncated)?;
    let mut pack_id = [0u8; 16];
    pack_id.copy_from_slice(id);
    pack.pack_id = PackId(pack_id);
    let env_count = r.read_u32_le().ok_or(CodecError::HeaderTruncated)?;
    let step_count = r.read_u32_le().ok_or(CodecError::HeaderTruncated)?;

    let key_id = r.take(key_id_len).ok_or(CodecError::KeyIdTruncated)?;
    pack.key_id = String::from_utf8_lossy(key_id).into_owned();

    for _ in 0..env_count {
        let k = r.read_string().ok_or(CodecError::EnvTruncated)?;
        let v = r.read_string().ok_or(CodecError::EnvTruncated)?;
        pack.env.insert(k, v);
    }

    if step_count as usize > MAX_STEPS {
        return Err(CodecError::TooManySteps);
    }
    pack.steps.reserve(step_count as usize);
    let mut total_write = 0usize;
    for _ in 0..step_count {
        let opcode = r.read_u8().ok_or(CodecError::StepTruncated)?;
        let _flags = r.read_u8().ok_or(CodecError::StepTruncated)?;
        let _reserved = r.read_u16_le().ok_or(CodecError::StepTruncated)?;
        let field_a = r.read_u32_le().ok_or(CodecError::StepTruncated)?;
        let text = r.read_string().ok_or(CodecError::StepTruncated)?;
        match opcode {
            OPCODE_EXEC => {
                let argc = r.read_u16_le().ok_or(CodecError::ArgvTruncated)?;
                let mut argv = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    argv.push(r.read_string().ok_or(CodecError::ArgvTruncated)?);
                }
                pack.steps.push(Step::Exec(ExecStep {
                    argv,
                    cwd: text,
                    timeout_ms: field_a,
                }));
            },
            OPCODE_WRITE => {
                if version == 1 {
                    return Err(CodecError::UnsupportedOpcode);
                }
                let blob_len = r.read_u32_le().ok_or(CodecError::WriteTruncated)? as usize;
                if total_write + blob_len > MAX_TOTAL_WRITE_BYTES {
                    return Err(CodecError::WriteBytesTooLarge);
                }
                let data = r.take(blob_len).ok_or(CodecError::WriteTruncated)?.to_vec();
                total_write += data.len();
                pack.steps.push(Step::WriteFile(WriteFileStep {
                    path: text,
                    data,
                    mode: field_a,
                }));
            },
            _ => return Err(CodecError::UnsupportedOpcode),
        }
    }

    if r.remaining() != 0 {
        return Err(CodecError::TrailingBytes);
    }
    Ok(pack)
}

/// Encodes an envelope into its wire form.
///
/// # Errors
///
/// Both fields must be nonempty and fit a u32 length prefix.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, CodecError> {
    if env.payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    if env.signature.is_empty() {
        return Err(CodecError::EmptySignature);
    }
    if env.payload.len() > u32::MAX as usize || env.signature.len() > u32::MAX as usize {
        return Err(CodecError::TooLarge);
    }
    let mut out = Vec::with_capacity(12 + env.payload.len() + env.signature.len());
    out.extend_from_slice(ENVELOPE_MAGIC);
    write_u32_le(&mut out, env.payload.len() as u32);
    out.extend_from_slice(&env.payload);
    write_u32_le(&mut out, env.signature.len() as u32);
    out.extend_from_slice(&env.signature);
    Ok(out)
}

/// Decodes an untrusted envelope buffer.
///
/// The frame must be consumed exactly: bytes after the signature fail the
/// decode rather than being ignored.
///
/// # Errors
///
/// Fails on bad magic, any truncated length or field, and trailing bytes.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let mut r = Reader::new(bytes);
    if !r.need(4 + 4 + 4) {
        return Err(CodecError::EnvelopeTooSmall);
    }
    if r.take(4) != Some(ENVELOPE_MAGIC.as_slice()) {
        return Err(CodecError::BadEnvelopeMagic);
    }
    let payload_len = r.read_u32_le().ok_or(CodecError::EnvelopeTruncated)? as usize;
    if !r.need(payload_len + 4) {
        return Err(CodecError::EnvelopeTruncated);
    }
    let payload = r
        .take(payload_len)
        .ok_or(CodecError::EnvelopeTruncated)?
        .to_vec();
    let sig_len = r.read_u32_le().ok_or(CodecError::EnvelopeTruncated)? as usize;
    if r.remaining() != sig_len {
        return Err(CodecError::EnvelopeTruncated);
    }
    let signature = r.take(sig_len).ok_or(CodecError::EnvelopeTruncated)?.to_vec();
    Ok(Envelope { payload, signature })
}
