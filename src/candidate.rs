//! Candidate and peer data model.
//!
//! A [`Candidate`] is an `(IP, port)` pair by which a peer might be reachable.
//! Candidates come from two sources: local interface enumeration (private
//! addresses, useful on the same LAN) and the reflexive probe (the public
//! mapping a NAT assigns, see [`crate::reflex`]). A [`PeerInfo`] bundles a
//! peer's id with its current candidate list and the wall-clock instant of
//! its most recent registration.
//!
//! List order is a preference hint: the connection establisher dials
//! candidates in the order they appear.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A NAT traversal candidate: an IPv4 address and UDP port.
///
/// Two candidates are equal iff both fields match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Textual IPv4 literal, e.g. `"203.0.113.7"`.
    pub ip: String,
    /// UDP port in `[1, 65535]`.
    pub port: u16,
}

impl Candidate {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Resolve this candidate to a concrete UDP endpoint.
    ///
    /// Only IPv4 literals are accepted; the traversal core does not punch
    /// IPv6 paths.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: Ipv4Addr = self
            .ip
            .parse()
            .with_context(|| format!("candidate has invalid IPv4 address: {}", self.ip))?;
        Ok(SocketAddr::new(IpAddr::V4(ip), self.port))
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A peer's registry record: id, candidate list, and registration instant.
///
/// The timestamp is advisory on the wire; clients must not assume clock
/// agreement with the registry. Liveness is the registry's concern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub candidates: Vec<Candidate>,
    pub timestamp: DateTime<Utc>,
}

/// Enumerate local candidates: one per non-loopback IPv4 interface address,
/// all carrying the given UDP port.
///
/// Order follows the OS interface enumeration; duplicate addresses are not
/// emitted. Enumeration failure yields an empty list rather than an error —
/// a host with no discoverable interfaces still has its reflexive candidate.
pub fn local_candidates(port: u16) -> Vec<Candidate> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(error = %e, "failed to enumerate network interfaces");
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ip) = interface.ip() {
            let candidate = Candidate::new(ip.to_string(), port);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}
