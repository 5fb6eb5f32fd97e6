//! Sender transport: resolve a receiver, deliver one envelope, read the
//! transcript.
//!
//! The protocol is deliberately dumb: dial, write all the envelope bytes,
//! half-close the write side, read the response until EOF. The response
//! read is capped so a misbehaving receiver cannot balloon the sender.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::store;

/// Response size cap.
const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

/// Connect timeout per resolved address.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Splits `host:port` or `[ipv6]:port` into host and port.
///
/// # Errors
///
/// Fails on missing or empty parts and unparseable ports.
pub fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .context("expected [ipv6]:port")?;
        let port = rest
            .strip_prefix(':')
            .context("expected [ipv6]:port")?;
        (host.to_string(), port)
    } else {
        let (host, port) = s.rsplit_once(':').context("expected host:port")?;
        (host.to_string(), port)
    };
    if host.is_empty() || port.is_empty() {
        bail!("expected host:port");
    }
    let port: u16 = port.parse().context("invalid port")?;
    Ok((host, port))
}

/// Resolves a symbolic receiver name through the receiver directory;
/// anything containing a colon is taken as a literal address.
///
/// # Errors
///
/// Fails when the name is not in the directory.
pub fn resolve_receiver(to: &str) -> Result<String> {
    if to.contains(':') {
        return Ok(to.to_string());
    }
    store::load_receivers().remove(to).ok_or_else(|| {
        anyhow!("unknown receiver {to:?} (use: actionpack receivers | actionpack register <name> <addr>)")
    })
}

/// Sends envelope bytes to `to` (receiver name or address) and returns
/// the transcript.
///
/// # Errors
///
/// Fails on resolution, connect, write, or read errors, and on oversized
/// responses.
pub fn send_envelope(to: &str, bytes: &[u8]) -> Result<String> {
    let addr = resolve_receiver(to)?;
    let (host, port) = parse_host_port(&addr)?;

    let addrs: Vec<_> = (host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("resolve failed for {host}:{port}"))?
        .collect();
    let mut stream = None;
    for candidate in &addrs {
        if let Ok(s) = TcpStream::connect_timeout(candidate, CONNECT_TIMEOUT) {
            stream = Some(s);
            break;
        }
    }
    let mut stream = stream.with_context(|| format!("connect failed to {addr}"))?;
    debug!(%addr, bytes = bytes.len(), "envelope connected");

    stream.write_all(bytes).context("write failed")?;
    stream
        .shutdown(Shutdown::Write)
        .context("shutdown failed")?;

    let mut response = Vec::new();
    stream
        .take(MAX_RESPONSE_BYTES as u64 + 1)
        .read_to_end(&mut response)
        .context("read failed")?;
    if response.len() > MAX_RESPONSE_BYTES {
        bail!("response exceeds size cap");
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}
