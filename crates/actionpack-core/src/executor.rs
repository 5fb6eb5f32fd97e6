//! Pack executor: verify → authorize → replay-check → interpret steps.
//!
//! One executor handles every connection of a receiver. Processing is a
//! straight-line pipeline over untrusted request bytes:
//!
//! ```text
//! envelope decode → payload decode → policy lookup → key lookup
//!   → signature verify → time bounds → replay check → steps
//! ```
//!
//! Any failure before the first step produces a single `ERR <detail>` line
//! and nothing runs. Step failures stop the loop at the failing step;
//! earlier steps' lines remain in the transcript. The replay record is
//! written *before* execution, so a crash mid-pack still burns the
//! `pack_id`.
//!
//! # Step authorization
//!
//! Exec commands resolve in one of three ways: absolute paths are taken
//! as-is, relative paths containing `/` are canonicalized under the cwd
//! and must stay inside the sandbox root, and bare names go through a
//! fixed tool table. The resulting path must be in the key's allowlist or
//! qualify as a root script: a regular, executable file under the root
//! that this pack did not itself write. The written-file exclusion closes
//! the drop-binary-then-exec hole inside a single pack.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::codec::{self, Envelope};
use crate::crypto;
use crate::keystore::PubkeyMap;
use crate::pack::{ExecStep, Pack, Step, WriteFileStep};
use crate::policy::{builtin_allowed_cmds, resolve_bare_command, KeyPolicy, PolicyMap};
use crate::replay::{ReplayCache, ReplayCheck};
use crate::runner;
use crate::sandbox::{self, SandboxRoot};
use crate::sink::{NullSink, PackEventSink};

/// Tolerated clock skew for the created/expires bounds.
const SKEW_MS: u64 = 30_000;

/// Fallback per-stream output cap when the configuration leaves it unset.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Current wall clock in epoch milliseconds.
#[must_use]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Environment keys that are never forwarded, regardless of policy:
/// loader-injection variables turn any allowed command into arbitrary
/// code.
fn is_denied_env_key(key: &str) -> bool {
    key.starts_with("DYLD_") || key.starts_with("LD_")
}

/// Tunables and ambient context for a [`PackExecutor`].
pub struct ExecutorOptions {
    /// Working directory for exec steps that do not set one; empty means
    /// the sandbox root.
    pub default_cwd: String,
    /// Per-stream captured output cap.
    pub max_output_bytes: usize,
    /// Home directory used by `~` / `$HOME` expansion; `None` disables
    /// expansion.
    pub home: Option<String>,
    /// Breadcrumb sink.
    pub sink: Arc<dyn PackEventSink>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            default_cwd: String::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            home: std::env::var("HOME").ok().filter(|h| !h.is_empty()),
            sink: Arc::new(NullSink),
        }
    }
}

/// Per-receiver pack executor. Key and policy tables are fixed at
/// construction; the replay cache is the only mutable state and sits
/// behind one mutex so the lookup-then-insert is a single critical
/// section.
pub struct PackExecutor {
    pubkeys: PubkeyMap,
    policy: Option<PolicyMap>,
    replay: Mutex<ReplayCache>,
    root: SandboxRoot,
    default_cwd: String,
    max_output_bytes: usize,
    home: Option<String>,
    sink: Arc<dyn PackEventSink>,
}

impl PackExecutor {
    /// Builds an executor over loaded key/policy tables, a replay cache,
    /// and a resolved sandbox root.
    #[must_use]
    pub fn new(
        pubkeys: PubkeyMap,
        policy: Option<PolicyMap>,
        replay: ReplayCache,
        root: SandboxRoot,
        options: ExecutorOptions,
    ) -> Self {
        let default_cwd = if options.default_cwd.is_empty() {
            root.canonical().to_string_lossy().into_owned()
        } else {
            options.default_cwd
        };
        Self {
            pubkeys,
            policy,
            replay: Mutex::new(replay),
            root,
            default_cwd,
            max_output_bytes: options.max_output_bytes.max(1),
            home: options.home,
            sink: options.sink,
        }
    }

    /// Processes one request (the raw bytes a connection delivered) and
    /// returns the complete transcript.
    pub async fn handle_request(&self, bytes: &[u8]) -> String {
        match codec::decode_envelope(bytes) {
            Ok(envelope) => self.handle_envelope(&envelope).await,
            Err(e) => format!("ERR bad envelope: {e}\n"),
        }
    }

    /// Processes a decoded envelope.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> String {
        let pack = match codec::decode_payload(&envelope.payload) {
            Ok(pack) => pack,
            Err(e) => return format!("ERR bad payload: {e}\n"),
        };
        let pack_hex = pack.pack_id.hex();

        let policy = match &self.policy {
            Some(map) => match map.get(&pack.key_id) {
                Some(policy) => Some(policy),
                None => return format!("ERR policy missing for key_id: {}\n", pack.key_id),
            },
            None => None,
        };

        let Some(pubkey) = self.pubkeys.get(&pack.key_id) else {
            return format!("ERR unknown key_id: {}\n", pack.key_id);
        };

        if let Err(e) = crypto::verify(pubkey, &envelope.payload, &envelope.signature) {
            self.sink.event("pack.verify.fail", &pack_hex);
            return format!("ERR signature invalid: {e}\n");
        }

        let now = now_epoch_ms();
        if pack.created_ms != 0 && pack.created_ms > now + SKEW_MS {
            return "ERR created_ms in future\n".to_string();
        }
        if pack.expires_ms != 0 && now > pack.expires_ms + SKEW_MS {
            return "ERR pack expired\n".to_string();
        }

        {
            let mut replay = self
                .replay
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if replay.check_and_record(&pack_hex, pack.expires_ms, now) == ReplayCheck::Replayed {
                return "ERR replay\n".to_string();
            }
        }

        self.run_steps(&pack, policy, &pack_hex).await
    }

    async fn run_steps(&self, pack: &Pack, policy: Option<&KeyPolicy>, pack_hex: &str) -> String {
        let mut resp = format!("OK pack_id={pack_hex} steps={}\n", pack.steps.len());

        let env_add = self.filtered_env(&pack.env, policy);
        let mut written: HashSet<String> = HashSet::new();

        for (i, step) in pack.steps.iter().enumerate() {
            let ok = match step {
                Step::WriteFile(w) => self.run_write_step(i, w, policy, &mut written, &mut resp),
                Step::Exec(e) => {
                    self.run_exec_step(i, e, policy, &env_add, &written, &mut resp)
                        .await
                },
            };
            if !ok {
                break;
            }
        }

        resp
    }

    /// Drops denied and (under a policy) unlisted environment keys.
    fn filtered_env(
        &self,
        env: &BTreeMap<String, String>,
        policy: Option<&KeyPolicy>,
    ) -> BTreeMap<String, String> {
        env.iter()
            .filter(|(k, _)| !is_denied_env_key(k))
            .filter(|(k, _)| policy.map_or(true, |p| p.allowed_env.contains(k.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn run_write_step(
        &self,
        i: usize,
        step: &WriteFileStep,
        policy: Option<&KeyPolicy>,
        written: &mut HashSet<String>,
        resp: &mut String,
    ) -> bool {
        let allow_exec_writes = policy.is_some_and(|p| p.allow_exec_writes);
        let path = self.expand_vars(&step.path);
        match sandbox::write_file(&self.root, allow_exec_writes, &path, &step.data, step.mode) {
            Ok(canon) => {
                written.insert(canon.to_string_lossy().into_owned());
                resp.push_str(&format!(
                    "STEP {i} write OK bytes={} path={path}\n",
                    step.data.len()
                ));
                true
            },
            Err(e) => {
                resp.push_str(&format!("STEP {i} write ERR {e}\n"));
                false
            },
        }
    }

    async fn run_exec_step(
        &self,
        i: usize,
        step: &ExecStep,
        policy: Option<&KeyPolicy>,
        env_add: &BTreeMap<String, String>,
        written: &HashSet<String>,
        resp: &mut String,
    ) -> bool {
        if step.argv.is_empty() {
            resp.push_str(&format!("STEP {i} ERR empty argv\n"));
            return false;
        }

        // Bare tool names map through the fixed table before expansion.
        let mut argv: Vec<String> = step.argv.clone();
        if !argv[0].contains('/') {
            if let Some(mapped) = resolve_bare_command(&argv[0]) {
                argv[0] = mapped.to_string();
            }
        }
        for arg in &mut argv {
            *arg = self.expand_vars(arg);
        }

        let cwd_req = if step.cwd.is_empty() {
            self.default_cwd.clone()
        } else {
            step.cwd.clone()
        };
        let cwd_req = self.expand_vars(&cwd_req);
        let cwd = match std::fs::canonicalize(&cwd_req) {
            Ok(rp) => rp.to_string_lossy().into_owned(),
            Err(_) => {
                resp.push_str(&format!("STEP {i} ERR bad_cwd\n"));
                return false;
            },
        };
        if !self.root.contains_str(&cwd) {
            resp.push_str(&format!("STEP {i} ERR cwd_outside_root\n"));
            return false;
        }

        // Resolve the command: absolute, relative-with-slash under the
        // root, or an already-mapped bare name.
        let cmd = argv[0].clone();
        let cmd = if cmd.starts_with('/') {
            cmd
        } else if cmd.contains('/') {
            let joined = format!("{cwd}/{cmd}");
            let rp = match std::fs::canonicalize(&joined) {
                Ok(rp) => rp.to_string_lossy().into_owned(),
                Err(_) => {
                    resp.push_str(&format!("STEP {i} ERR bad_cmd_path\n"));
                    return false;
                },
            };
            if !self.root.contains_str(&rp) {
                resp.push_str(&format!("STEP {i} ERR cmd_outside_root\n"));
                return false;
            }
            argv[0] = rp.clone();
            rp
        } else {
            resp.push_str(&format!("STEP {i} ERR cmd_not_allowed\n"));
            return false;
        };

        if !self.cmd_allowed(&cmd, policy, written) {
            resp.push_str(&format!("STEP {i} ERR cmd_not_allowed\n"));
            return false;
        }

        let start = Instant::now();
        let r = runner::run_capture(&argv, env_add, &cwd, step.timeout_ms, self.max_output_bytes)
            .await;
        let dur_ms = start.elapsed().as_millis();

        resp.push_str(&format!("STEP {i} exec exit={} dur_ms={dur_ms}", r.exit_code));
        if r.timed_out {
            resp.push_str(" timed_out=1");
        }
        if let Some(error) = &r.error {
            resp.push_str(&format!(" error={error}"));
        }
        resp.push('\n');
        for (label, bytes) in [("STDOUT", &r.stdout), ("STDERR", &r.stderr)] {
            if bytes.is_empty() {
                continue;
            }
            resp.push_str(&format!("--- {label} ({} bytes) ---\n", bytes.len()));
            resp.push_str(&String::from_utf8_lossy(bytes));
            if !resp.ends_with('\n') {
                resp.push('\n');
            }
        }

        r.ok
    }

    /// Command allowlist: the key's `cmd=` entries (or the built-in table
    /// without a policy), plus executable regular files under the root that
    /// this pack did not write.
    fn cmd_allowed(
        &self,
        cmd: &str,
        policy: Option<&KeyPolicy>,
        written: &HashSet<String>,
    ) -> bool {
        match policy {
            Some(p) => {
                if p.allowed_cmds.contains(cmd) {
                    return true;
                }
                p.allow_root_scripts && self.root_script_allowed(cmd, written)
            },
            None => {
                if builtin_allowed_cmds().contains(&cmd) {
                    return true;
                }
                self.root_script_allowed(cmd, written)
            },
        }
    }

    fn root_script_allowed(&self, cmd: &str, written: &HashSet<String>) -> bool {
        if written.contains(cmd) {
            return false;
        }
        if !self.root.contains_str(cmd) {
            return false;
        }
        match std::fs::metadata(cmd) {
            Ok(meta) => {
                use std::os::unix::fs::PermissionsExt;
                meta.is_file() && meta.permissions().mode() & 0o111 != 0
            },
            Err(_) => false,
        }
    }

    /// Minimal expansion: leading `~` / `~/`, plus `$HOME` and `${HOME}`.
    /// A no-op when the home directory is unknown.
    fn expand_vars(&self, s: &str) -> String {
        let Some(home) = &self.home else {
            return s.to_string();
        };
        let s = if s == "~" {
            home.clone()
        } else if let Some(rest) = s.strip_prefix("~/") {
            format!("{home}/{rest}")
        } else {
            s.to_string()
        };
        s.replace("${HOME}", home).replace("$HOME", home)
    }
}
