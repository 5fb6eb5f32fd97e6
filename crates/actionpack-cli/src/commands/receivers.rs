//! Receiver directory management: `register`, `receivers`, `pair`.

use std::process::Command;

use anyhow::{bail, Context, Result};

use super::keys::open_keystore;
use crate::client::parse_host_port;
use crate::store;

/// `register <name> <ip:port>`: upsert a directory entry.
pub fn register(name: &str, addr: &str) -> Result<()> {
    let mut receivers = store::load_receivers();
    receivers.insert(name.to_string(), addr.to_string());
    store::save_receivers(&receivers)?;
    println!("OK");
    Ok(())
}

/// `receivers`: list the directory.
pub fn list() -> Result<()> {
    for (name, addr) in store::load_receivers() {
        println!("{name}\t{addr}");
    }
    Ok(())
}

/// `pair <name> <addr>`: ensure a key, register the receiver, and print
/// (optionally run over `tailscale ssh`) the receiver-side enablement
/// command.
pub fn pair(name: &str, addr: &str, key_id: &str, ssh_host: Option<&str>) -> Result<()> {
    let pubkey = open_keystore()?.generate(key_id)?;

    let mut receivers = store::load_receivers();
    receivers.insert(name.to_string(), addr.to_string());
    store::save_receivers(&receivers)?;

    // Bind all interfaces on the paired port; peer admission still gates
    // who may connect.
    let listen = match parse_host_port(addr) {
        Ok((_, port)) => format!(":{port}"),
        Err(_) => addr.to_string(),
    };
    let receiver_cmd =
        format!("actionpack receiver enable --listen {listen} --trust {key_id} {pubkey}");

    println!("Receiver command (run on the other machine):");
    println!("  {receiver_cmd}");

    if let Some(host) = ssh_host {
        println!();
        println!("Running via tailscale ssh...");
        let output = Command::new("tailscale")
            .args(["ssh", host, "--", "/bin/sh", "-lc", &receiver_cmd])
            .output()
            .context("failed to run tailscale ssh")?;
        print!("{}", String::from_utf8_lossy(&output.stdout));
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            bail!("tailscale ssh failed");
        }
    }

    Ok(())
}
