//! Per-key authorization policy.
//!
//! A [`KeyPolicy`] controls what a given sender key may do on this
//! receiver: which absolute commands it may execute, which environment
//! keys it may forward, whether scripts under the sandbox root are
//! runnable, and whether write steps may set execute bits.
//!
//! The policy file is one line per key:
//!
//! ```text
//! k1 cmd=/usr/bin/git cmd=/usr/bin/make env=BUILD_MODE allow_root_scripts=0 allow_exec_writes=0
//! ```
//!
//! When a policy file is configured, a pack whose `key_id` has no line is
//! rejected outright. Without a policy file the receiver falls back to
//! [`builtin_allowed_cmds`] with root scripts allowed and executable
//! writes forbidden.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

/// Authorization record for one sender key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    /// Absolute command paths this key may execute.
    pub allowed_cmds: HashSet<String>,
    /// Environment keys this key may forward to exec steps.
    pub allowed_env: HashSet<String>,
    /// Allow executing regular executable files under the sandbox root
    /// (excluding files written by the current pack).
    pub allow_root_scripts: bool,
    /// Allow write steps to set execute bits.
    pub allow_exec_writes: bool,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            allowed_cmds: HashSet::new(),
            allowed_env: HashSet::new(),
            allow_root_scripts: true,
            allow_exec_writes: false,
        }
    }
}

/// `key_id` → policy.
pub type PolicyMap = HashMap<String, KeyPolicy>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unable to open policy file: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Command allowlist applied when no policy file is configured: a small
/// fixed set of common tool paths. Root scripts remain runnable and
/// executable writes stay forbidden in that mode.
pub fn builtin_allowed_cmds() -> &'static [&'static str] {
    &[
        "/usr/bin/git",
        "/usr/bin/make",
        "/bin/bash",
        "/bin/sh",
        "/usr/bin/python3",
        "/bin/pwd",
        "/bin/echo",
        "/bin/ls",
        "/bin/rm",
        "/bin/mkdir",
        "/usr/bin/uname",
        "/usr/bin/wc",
        "/usr/bin/sed",
        "/usr/bin/tee",
        "/usr/bin/env",
    ]
}

/// Fixed bare-name → absolute path table used when an exec step names a
/// tool without any `/`. Unmapped names are rejected by the executor.
pub fn resolve_bare_command(name: &str) -> Option<&'static str> {
    let mapped = match name {
        "git" => "/usr/bin/git",
        "make" => "/usr/bin/make",
        "pwd" => "/bin/pwd",
        "echo" => "/bin/echo",
        "ls" => "/bin/ls",
        "rm" => "/bin/rm",
        "mkdir" => "/bin/mkdir",
        "bash" => "/bin/bash",
        "sh" => "/bin/sh",
        "python3" => "/usr/bin/python3",
        "uname" => "/usr/bin/uname",
        "wc" => "/usr/bin/wc",
        "sed" => "/usr/bin/sed",
        "tee" => "/usr/bin/tee",
        _ => return None,
    };
    Some(mapped)
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

/// Loads the policy file at `path`.
///
/// # Errors
///
/// Fails only if the file cannot be read; malformed tokens are skipped.
pub fn load_policy(path: &Path) -> Result<PolicyMap, PolicyError> {
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_policy(&text))
}

fn parse_policy(text: &str) -> PolicyMap {
    let mut out = PolicyMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(key_id) = tokens.next() else {
            continue;
        };
        let mut policy = KeyPolicy::default();
        for token in tokens {
            let Some((k, v)) = token.split_once('=') else {
                continue;
            };
            if k.is_empty() {
                continue;
            }
            match k {
                "cmd" => {
                    if !v.is_empty() {
                        policy.allowed_cmds.insert(v.to_string());
                    }
                },
                "env" => {
                    if !v.is_empty() {
                        policy.allowed_env.insert(v.to_string());
                    }
                },
                "allow_root_scripts" => policy.allow_root_scripts = parse_bool(v),
                "allow_exec_writes" => policy.allow_exec_writes = parse_bool(v),
                _ => {},
            }
        }
        out.insert(key_id.to_string(), policy);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_line() {
        let map = parse_policy(
            "k1 cmd=/usr/bin/git cmd=/bin/echo env=BUILD_MODE allow_root_scripts=0 allow_exec_writes=1\n",
        );
        let p = map.get("k1").unwrap();
        assert!(p.allowed_cmds.contains("/usr/bin/git"));
        assert!(p.allowed_cmds.contains("/bin/echo"));
        assert!(p.allowed_env.contains("BUILD_MODE"));
        assert!(!p.allow_root_scripts);
        assert!(p.allow_exec_writes);
    }

    #[test]
    fn defaults_when_flags_absent() {
        let map = parse_policy("k1 cmd=/bin/echo\n");
        let p = map.get("k1").unwrap();
        assert!(p.allow_root_scripts);
        assert!(!p.allow_exec_writes);
        assert!(p.allowed_env.is_empty());
    }

    #[test]
    fn bool_tokens() {
        for (text, expect) in [
            ("1", true),
            ("true", true),
            ("yes", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("no", false),
            ("off", false),
            ("banana", false),
        ] {
            let map = parse_policy(&format!("k allow_exec_writes={text}\n"));
            assert_eq!(map.get("k").unwrap().allow_exec_writes, expect, "{text}");
        }
    }

    #[test]
    fn skips_comments_and_malformed_tokens() {
        let map = parse_policy("# comment\n\nk1 cmd=/bin/echo notatoken =orphan cmd=\n");
        let p = map.get("k1").unwrap();
        assert_eq!(p.allowed_cmds.len(), 1);
    }

    #[test]
    fn later_duplicate_key_wins() {
        let map = parse_policy("k1 cmd=/bin/echo\nk1 cmd=/bin/ls\n");
        let p = map.get("k1").unwrap();
        assert!(!p.allowed_cmds.contains("/bin/echo"));
        assert!(p.allowed_cmds.contains("/bin/ls"));
    }

    #[test]
    fn bare_command_table_round_trips_into_builtin_allowlist() {
        // Every mapped bare name must land on a path the default allowlist
        // accepts, otherwise bare names are useless without a policy.
        for name in ["git", "echo", "ls", "bash", "python3"] {
            let path = resolve_bare_command(name).unwrap();
            assert!(builtin_allowed_cmds().contains(&path), "{name} -> {path}");
        }
        assert_eq!(resolve_bare_command("curl"), None);
    }
}
