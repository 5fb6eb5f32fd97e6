//! Receiver-side installer: `receiver enable`.
//!
//! Run on the receiving machine, this trusts one sender key and writes the
//! three files the daemon reads at startup: the pubkeys table, a strict
//! default policy line for the key, and the receiver config. Existing
//! entries for the same key are replaced, other lines are preserved.

use actionpack_core::paths;
use anyhow::{Context, Result};

use crate::store;

/// Strict default policy for a newly trusted key: a short build-tool
/// allowlist, no root scripts, no executable writes. The receiver can
/// widen the line later by editing the policy file.
fn default_policy_line(key_id: &str) -> String {
    format!(
        "{key_id} cmd=/usr/bin/git cmd=/usr/bin/make cmd=/bin/rm cmd=/bin/mkdir \
         cmd=/bin/bash cmd=/bin/sh cmd=/usr/bin/python3 \
         allow_root_scripts=0 allow_exec_writes=0"
    )
}

/// `receiver enable --listen <ip:port> --trust <key_id> <pubkey> --root <path>`.
pub fn enable(listen: &str, key_id: &str, pubkey_b64: &str, root: &str) -> Result<()> {
    paths::ensure_data_dir().context("HOME unavailable; cannot persist receiver config")?;
    let pubkeys = paths::pubkeys_path().context("HOME unavailable")?;
    let policy = paths::policy_path().context("HOME unavailable")?;
    let conf = paths::receiver_conf_path().context("HOME unavailable")?;

    store::replace_or_append_line(&pubkeys, &format!("{key_id} "), &format!("{key_id} {pubkey_b64}"))
        .context("unable to write pubkeys")?;

    store::replace_or_append_line(&policy, &format!("{key_id} "), &default_policy_line(key_id))
        .context("unable to write policy")?;

    let mut cfg = String::with_capacity(512);
    cfg.push_str("# action pack receiver config\n");
    cfg.push_str(&format!("listen={listen}\n"));
    cfg.push_str(&format!("root={root}\n"));
    cfg.push_str(&format!("pubkeys={}\n", pubkeys.display()));
    cfg.push_str(&format!("policy={}\n", policy.display()));
    cfg.push_str("allow_local=1\n");
    cfg.push_str("allow_tailscale=1\n");
    cfg.push_str("max_conns=4\n");
    cfg.push_str("io_timeout_ms=5000\n");
    cfg.push_str("max_request=4194304\n");
    cfg.push_str("max_output=1048576\n");
    store::write_text_atomic(&conf, &cfg).context("unable to write receiver config")?;

    println!("OK");
    println!("Next: start (or restart) actionpackd on this machine.");
    Ok(())
}
