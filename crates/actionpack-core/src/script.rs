//! Script compiler: line-oriented authoring format → [`Pack`].
//!
//! The format is deliberately small: one instruction per line, no shell
//! evaluation:
//!
//! ```text
//! # comments and blank lines are ignored
//! cd /path            sets cwd for subsequent execs
//! timeout 600000      sets timeout (ms) for subsequent execs
//! env KEY=VALUE       sets one pack-wide environment entry
//! put /abs/dest @/src embeds a local file as a write step (mode 0644)
//! exec git status     appends an exec step with the current cwd/timeout
//! ```
//!
//! Tokens are whitespace-separated with single/double quoting and `\`
//! escaping of the next character, in or out of quotes.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::pack::{ExecStep, Pack, PackId, Step, WriteFileStep, MAX_STEPS, MAX_TOTAL_WRITE_BYTES};

/// Script compilation failures, one per malformed instruction shape.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cd requires exactly 1 arg")]
    CdArity,
    #[error("timeout requires exactly 1 arg")]
    TimeoutArity,
    #[error("invalid timeout value")]
    BadTimeout,
    #[error("env requires exactly 1 arg (KEY=VALUE)")]
    EnvArity,
    #[error("env requires KEY=VALUE")]
    BadEnvEntry,
    #[error("put requires: put <dest_abs_path> @<src_path>")]
    PutArity,
    #[error("put destination must be an absolute path")]
    PutDestNotAbsolute,
    #[error("put source must be @<path>")]
    PutBadSource,
    #[error("put unable to open source: {0}")]
    PutSourceUnreadable(String),
    #[error("exec requires at least 1 arg")]
    ExecArity,
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),
    #[error("script has no steps")]
    NoSteps,
    #[error("too many steps")]
    TooManySteps,
    #[error("total embedded write bytes too large")]
    WriteBytesTooLarge,
}

/// Splits one line into tokens. Quotes group, `\` escapes the next
/// character, a trailing backslash is kept literal.
fn tokenize(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    let mut quote = '\0';

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if !in_quote && (c == ' ' || c == '\t') {
            if !cur.is_empty() {
                out.push(std::mem::take(&mut cur));
            }
            continue;
        }
        if !in_quote && (c == '"' || c == '\'') {
            in_quote = true;
            quote = c;
            continue;
        }
        if in_quote && c == quote {
            in_quote = false;
            quote = '\0';
            continue;
        }
        if c == '\\' {
            match chars.next() {
                Some(escaped) => cur.push(escaped),
                None => cur.push(c),
            }
            continue;
        }
        cur.push(c);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Compiles a script into a pack with a fresh random [`PackId`].
///
/// `ttl_ms == 0` means no expiry. The compiler enforces the step-count and
/// embedded-write-byte limits while reading so an oversized script fails
/// before the codec ever sees it.
///
/// # Errors
///
/// Returns a [`ScriptError`] for any malformed instruction, an unreadable
/// `put` source, or a script that produces no steps.
pub fn compile_script(
    script: &str,
    key_id: &str,
    now_ms: u64,
    ttl_ms: u64,
) -> Result<Pack, ScriptError> {
    let mut pack = Pack {
        key_id: key_id.to_string(),
        created_ms: now_ms,
        expires_ms: if ttl_ms != 0 { now_ms + ttl_ms } else { 0 },
        pack_id: PackId::random(),
        ..Pack::default()
    };

    let mut cwd = String::new();
    let mut timeout_ms: u32 = 0;
    let mut total_write = 0usize;

    for raw_line in script.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens = tokenize(line);
        let Some(op) = tokens.first() else {
            continue;
        };

        match op.as_str() {
            "cd" => {
                if tokens.len() != 2 {
                    return Err(ScriptError::CdArity);
                }
                cwd = tokens[1].clone();
            },
            "timeout" => {
                if tokens.len() != 2 {
                    return Err(ScriptError::TimeoutArity);
                }
                let v: u64 = tokens[1].parse().map_err(|_| ScriptError::BadTimeout)?;
                timeout_ms = u32::try_from(v).unwrap_or(u32::MAX);
            },
            "env" => {
                if tokens.len() != 2 {
                    return Err(ScriptError::EnvArity);
                }
                let (k, v) = tokens[1]
                    .split_once('=')
                    .ok_or(ScriptError::BadEnvEntry)?;
                if k.is_empty() {
                    return Err(ScriptError::BadEnvEntry);
                }
                pack.env.insert(k.to_string(), v.to_string());
            },
            "put" => {
                if tokens.len() != 3 {
                    return Err(ScriptError::PutArity);
                }
                let dest = &tokens[1];
                let src = &tokens[2];
                if !dest.starts_with('/') {
                    return Err(ScriptError::PutDestNotAbsolute);
                }
                let Some(src_path) = src.strip_prefix('@').filter(|p| !p.is_empty()) else {
                    return Err(ScriptError::PutBadSource);
                };
                let data = fs::read(Path::new(src_path))
                    .map_err(|_| ScriptError::PutSourceUnreadable(src_path.to_string()))?;
                total_write += data.len();
                if total_write > MAX_TOTAL_WRITE_BYTES {
                    return Err(ScriptError::WriteBytesTooLarge);
                }
                pack.steps.push(Step::WriteFile(WriteFileStep {
                    path: dest.clone(),
                    data,
                    mode: 0o644,
                }));
            },
            "exec" => {
                if tokens.len() < 2 {
                    return Err(ScriptError::ExecArity);
                }
                pack.steps.push(Step::Exec(ExecStep {
                    argv: tokens[1..].to_vec(),
                    cwd: cwd.clone(),
                    timeout_ms,
                }));
            },
            other => return Err(ScriptError::UnknownInstruction(other.to_string())),
        }

        if pack.steps.len() > MAX_STEPS {
            return Err(ScriptError::TooManySteps);
        }
    }

    if pack.steps.is_empty() {
        return Err(ScriptError::NoSteps);
    }
    Ok(pack)
}
