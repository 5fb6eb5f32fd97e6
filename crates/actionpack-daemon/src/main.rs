//! actionpackd: the action pack receiver daemon.
//!
//! Startup order matters for safety: the sandbox root must canonicalize
//! and the public key table must load before the listener binds, and the
//! daemon refuses to run without a root; there is no unsandboxed mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actionpack_core::executor::{ExecutorOptions, DEFAULT_MAX_OUTPUT_BYTES};
use actionpack_core::replay::ReplayCache;
use actionpack_core::sandbox::SandboxRoot;
use actionpack_core::{executor, keystore, paths, policy, PackExecutor};
use actionpack_daemon::events::TracingSink;
use actionpack_daemon::{parse_listen, PackServer, PeerFilter, ReceiverConfig, ServerLimits};
use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Action pack receiver daemon.
#[derive(Parser, Debug)]
#[command(name = "actionpackd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the receiver config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (host:port, IPv4); overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Sandbox root; overrides the config file.
    #[arg(long)]
    root: Option<String>,

    /// Public key table path; overrides the config file.
    #[arg(long)]
    pubkeys: Option<PathBuf>,

    /// Policy file path; overrides the config file.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Replay cache path.
    #[arg(long)]
    seen: Option<PathBuf>,

    /// Deny loopback peers.
    #[arg(long)]
    no_local: bool,

    /// Deny tailnet peers.
    #[arg(long)]
    no_tailscale: bool,
}

fn load_config(args: &Args) -> Result<ReceiverConfig> {
    let mut cfg = match &args.config {
        Some(path) => ReceiverConfig::load(path)?,
        None => match paths::receiver_conf_path() {
            Some(path) if path.exists() => ReceiverConfig::load(&path)?,
            _ => ReceiverConfig::default(),
        },
    };

    if let Some(listen) = &args.listen {
        cfg.listen = listen.clone();
    }
    if let Some(root) = &args.root {
        cfg.root = root.clone();
    }
    if let Some(pubkeys) = &args.pubkeys {
        cfg.pubkeys = Some(pubkeys.clone());
    }
    if let Some(policy) = &args.policy {
        cfg.policy = Some(policy.clone());
    }
    if args.no_local {
        cfg.allow_local = false;
    }
    if args.no_tailscale {
        cfg.allow_tailscale = false;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    if cfg.listen.is_empty() {
        bail!("no listen address configured (set listen= or pass --listen)");
    }
    if cfg.root.is_empty() {
        bail!("no sandbox root configured; refusing to run without one");
    }
    let root = SandboxRoot::resolve(&cfg.root)
        .with_context(|| format!("sandbox root {} did not resolve", cfg.root))?;

    let pubkeys_path = cfg
        .pubkeys
        .clone()
        .or_else(paths::pubkeys_path)
        .context("no pubkeys path (HOME unavailable?)")?;
    let pubkeys = keystore::load_pubkeys(&pubkeys_path)?;
    info!(path = %pubkeys_path.display(), keys = pubkeys.len(), "pubkeys loaded");

    let policy = match &cfg.policy {
        Some(path) => {
            let map = policy::load_policy(path)?;
            info!(path = %path.display(), entries = map.len(), "policy loaded");
            Some(map)
        },
        None => match paths::policy_path() {
            Some(path) if path.exists() => {
                let map = policy::load_policy(&path)?;
                info!(path = %path.display(), entries = map.len(), "policy loaded");
                Some(map)
            },
            _ => {
                info!("no policy file; using built-in default policy");
                None
            },
        },
    };

    let seen_path = args
        .seen
        .clone()
        .or_else(paths::seen_path)
        .context("no replay cache path (HOME unavailable?)")?;
    if let Some(parent) = seen_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let replay = ReplayCache::load(&seen_path, executor::now_epoch_ms());
    info!(path = %seen_path.display(), entries = replay.len(), "replay cache loaded");

    let executor = Arc::new(PackExecutor::new(
        pubkeys,
        policy,
        replay,
        root,
        ExecutorOptions {
            default_cwd: cfg.root.clone(),
            max_output_bytes: if cfg.max_output_bytes == 0 {
                DEFAULT_MAX_OUTPUT_BYTES
            } else {
                cfg.max_output_bytes
            },
            sink: Arc::new(TracingSink),
            ..ExecutorOptions::default()
        },
    ));

    let (ip, port) = parse_listen(&cfg.listen)
        .with_context(|| format!("bad listen address {:?}", cfg.listen))?;
    let listener = TcpListener::bind((ip, port))
        .await
        .with_context(|| format!("binding {ip}:{port}"))?;

    let server = PackServer::new(
        executor,
        PeerFilter {
            allow_local: cfg.allow_local,
            allow_tailscale: cfg.allow_tailscale,
        },
        ServerLimits {
            max_conns: cfg.max_conns,
            io_timeout: Duration::from_millis(cfg.io_timeout_ms),
            max_request_bytes: cfg.max_request_bytes,
        },
    );
    server.run(listener).await
}
