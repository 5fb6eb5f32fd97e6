//! Receiver configuration: the `action_pack_receiver.conf` key=value file
//! and the listen-address parser.
//!
//! The config format is one `key=value` per line with `#` comments.
//! Recognized keys: `listen`, `root`, `pubkeys`, `policy`, `allow_local`,
//! `allow_tailscale`, `max_conns`, `io_timeout_ms`, `max_request`,
//! `max_output`. Unknown keys and unparseable values are logged and
//! skipped so an edited config degrades to defaults instead of refusing
//! to start. The two keys that have no usable default, `listen` and
//! `root`, are validated by the daemon before serving.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// Default connection concurrency bound.
pub const DEFAULT_MAX_CONNS: usize = 4;
/// Default per-socket I/O timeout.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;
/// Default request size cap.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to open config file: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("expected host:port")]
    BadListen,
    #[error("invalid port")]
    BadPort,
    #[error("bad host ip")]
    BadHost,
}

/// Receiver daemon settings.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Listen address in `host:port` form; empty host means all
    /// interfaces.
    pub listen: String,
    /// Sandbox root; required before the server will start.
    pub root: String,
    /// Trusted public key table path.
    pub pubkeys: Option<PathBuf>,
    /// Policy file path; absent means the built-in default policy.
    pub policy: Option<PathBuf>,
    /// Admit loopback peers.
    pub allow_local: bool,
    /// Admit tailnet (100.64.0.0/10) peers.
    pub allow_tailscale: bool,
    /// Connection concurrency bound.
    pub max_conns: usize,
    /// Per-socket read/write timeout.
    pub io_timeout_ms: u64,
    /// Request size cap in bytes.
    pub max_request_bytes: usize,
    /// Per-stream captured output cap in bytes; 0 means the executor
    /// default.
    pub max_output_bytes: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            root: String::new(),
            pubkeys: None,
            policy: None,
            allow_local: true,
            allow_tailscale: true,
            max_conns: DEFAULT_MAX_CONNS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_output_bytes: 0,
        }
    }
}

impl ReceiverConfig {
    /// Loads settings from a config file.
    ///
    /// # Errors
    ///
    /// Fails only when the file itself cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut cfg = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "config line without '='");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "listen" => cfg.listen = value.to_string(),
                "root" => cfg.root = value.to_string(),
                "pubkeys" => cfg.pubkeys = Some(PathBuf::from(value)),
                "policy" => cfg.policy = Some(PathBuf::from(value)),
                "allow_local" => cfg.allow_local = parse_bool(value),
                "allow_tailscale" => cfg.allow_tailscale = parse_bool(value),
                "max_conns" => parse_into(key, value, &mut cfg.max_conns),
                "io_timeout_ms" => parse_into(key, value, &mut cfg.io_timeout_ms),
                "max_request" => parse_into(key, value, &mut cfg.max_request_bytes),
                "max_output" => parse_into(key, value, &mut cfg.max_output_bytes),
                _ => warn!(key, "unrecognized config key"),
            }
        }
        cfg
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value, "unparseable config value"),
    }
}

/// Parses the server bind address. IPv4 only: the receiver deliberately
/// does not accept bracketed IPv6 here even though the sender's address
/// parser does.
///
/// `":9917"` binds all interfaces.
///
/// # Errors
///
/// [`ConfigError::BadListen`], [`ConfigError::BadPort`], or
/// [`ConfigError::BadHost`] on malformed input.
pub fn parse_listen(s: &str) -> Result<(Ipv4Addr, u16), ConfigError> {
    let (host, port) = s.rsplit_once(':').ok_or(ConfigError::BadListen)?;
    if port.is_empty() {
        return Err(ConfigError::BadListen);
    }
    let port: u16 = port.parse().map_err(|_| ConfigError::BadPort)?;
    let host = host.trim();
    let ip = if host.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        host.parse().map_err(|_| ConfigError::BadHost)?
    };
    Ok((ip, port))
}
