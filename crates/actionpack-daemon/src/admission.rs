//! Peer admission: which source addresses may talk to the receiver at all.
//!
//! The filter runs before any bytes are read, so a denied peer costs one
//! accept and one close. Only IPv4 is admitted; confidentiality and
//! reachability are the overlay network's job, this is just the cheap
//! outer gate.

use std::net::{IpAddr, SocketAddr};

/// IPv4 admission predicate: loopback and/or the tailnet CGNAT range
/// `100.64.0.0/10`.
#[derive(Debug, Clone, Copy)]
pub struct PeerFilter {
    /// Admit 127.0.0.0/8.
    pub allow_local: bool,
    /// Admit 100.64.0.0/10.
    pub allow_tailscale: bool,
}

impl PeerFilter {
    /// Whether a connection from `peer` is admitted.
    #[must_use]
    pub fn allows(&self, peer: &SocketAddr) -> bool {
        let IpAddr::V4(ip) = peer.ip() else {
            return false;
        };
        let [a, b, _, _] = ip.octets();
        if self.allow_local && a == 127 {
            return true;
        }
        if self.allow_tailscale && a == 100 && (64..=127).contains(&b) {
            return true;
        }
        false
    }
}
