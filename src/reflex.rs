//! Reflexive address probe.
//!
//! A one-shot, STUN-style binding request to a public reflector. The reply
//! carries an XOR-mapped address attribute from which we recover the IPv4
//! address this host appears to have on the public Internet.
//!
//! Only the address half of the mapping is consumed. The probe runs on a
//! fresh ephemeral socket, so the port the reflector observes belongs to a
//! NAT mapping that is not the one used for hole-punching; the returned
//! [`Candidate`] instead carries the caller's production port. On NATs that
//! allocate ports per flow this makes the reflexive candidate approximate —
//! a documented limitation of the single-probe design.
//!
//! The probe is best-effort: timeouts and parse failures surface as errors
//! that the caller logs and ignores, continuing with local candidates only.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::candidate::Candidate;

/// Default public reflector. A configuration-time constant; there is no
/// reflector discovery mechanism.
pub const DEFAULT_REFLECTOR: &str = "stun.l.google.com:19302";

/// Deadline covering the single send/receive exchange.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Magic cookie fixed by the binding protocol, also the XOR key for
/// obfuscated addresses in replies.
pub const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xa4, 0x42];

/// Attribute type tag of the XOR-mapped address.
const XOR_MAPPED_ADDRESS: [u8; 2] = [0x00, 0x20];

/// Length of the fixed reply header preceding the attribute list.
const HEADER_LEN: usize = 20;

/// Encode a 20-byte binding request.
///
/// The transaction id is left zeroed: replies are matched by arrival on the
/// probing socket, not by id.
pub fn binding_request() -> [u8; 20] {
    let mut request = [0u8; 20];
    request[0] = 0x00; // binding request
    request[1] = 0x01;
    // bytes 2..4: zero payload length
    request[4..8].copy_from_slice(&MAGIC_COOKIE);
    // bytes 8..20: zero transaction id
    request
}

/// Scan a binding reply for the XOR-mapped address attribute and recover the
/// public IPv4 address. Returns a candidate carrying `local_port`, not the
/// reflected port.
pub fn parse_binding_response(reply: &[u8], local_port: u16) -> Option<Candidate> {
    if reply.len() <= HEADER_LEN {
        return None;
    }
    // Byte-wise scan for the attribute tag; the attribute's address bytes
    // sit 8 bytes past the tag (type:2, length:2, family+port:4).
    for i in HEADER_LEN..reply.len().saturating_sub(11) {
        if reply[i..i + 2] == XOR_MAPPED_ADDRESS {
            let ip = std::net::Ipv4Addr::new(
                reply[i + 8] ^ MAGIC_COOKIE[0],
                reply[i + 9] ^ MAGIC_COOKIE[1],
                reply[i + 10] ^ MAGIC_COOKIE[2],
                reply[i + 11] ^ MAGIC_COOKIE[3],
            );
            return Some(Candidate::new(ip.to_string(), local_port));
        }
    }
    None
}

/// Run the reflexive probe against `reflector`, reporting the discovered
/// public IP paired with `local_port`.
///
/// Binds a fresh ephemeral IPv4 socket, sends one binding request, and waits
/// at most [`PROBE_TIMEOUT`] for a parseable reply. No retries.
pub async fn discover(reflector: &str, local_port: u16) -> Result<Candidate> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind probe socket")?;

    let exchange = async {
        socket
            .send_to(&binding_request(), reflector)
            .await
            .with_context(|| format!("failed to send binding request to {reflector}"))?;

        let mut reply = [0u8; 1024];
        let (n, from) = socket
            .recv_from(&mut reply)
            .await
            .context("failed to receive binding reply")?;
        debug!(bytes = n, %from, "binding reply received");

        match parse_binding_response(&reply[..n], local_port) {
            Some(candidate) => Ok(candidate),
            None => bail!("binding reply carried no XOR-mapped address"),
        }
    };

    tokio::time::timeout(PROBE_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("reflexive probe timed out after {PROBE_TIMEOUT:?}"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal binding reply carrying an XOR-mapped address for `ip`.
    fn synthetic_reply(ip: [u8; 4], reflected_port: u16) -> Vec<u8> {
        let mut reply = vec![0u8; HEADER_LEN];
        reply[0] = 0x01; // binding success
        reply[1] = 0x01;
        reply[2] = 0x00;
        reply[3] = 0x0c; // one 12-byte attribute
        reply[4..8].copy_from_slice(&MAGIC_COOKIE);

        reply.extend_from_slice(&XOR_MAPPED_ADDRESS);
        reply.extend_from_slice(&[0x00, 0x08]); // attribute length
        reply.push(0x00);
        reply.push(0x01); // family: IPv4
        let xport = reflected_port ^ 0x2112;
        reply.extend_from_slice(&xport.to_be_bytes());
        for (i, byte) in ip.iter().enumerate() {
            reply.push(byte ^ MAGIC_COOKIE[i]);
        }
        reply
    }

    #[test]
    fn binding_request_wire_format() {
        let request = binding_request();
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE);
        assert!(request[8..20].iter().all(|&b| b == 0));
    }

    #[test]
    fn parse_recovers_xor_obfuscated_address() {
        let reply = synthetic_reply([192, 168, 1, 1], 31337);
        let candidate = parse_binding_response(&reply, 9000).expect("parse failed");
        assert_eq!(candidate.ip, "192.168.1.1");
        // The reflected port is present in the reply but intentionally
        // ignored; the caller's port wins.
        assert_eq!(candidate.port, 9000);
    }

    #[test]
    fn parse_round_trips_any_address() {
        for ip in [[0, 0, 0, 0], [10, 1, 2, 3], [203, 0, 113, 7], [255, 255, 255, 255]] {
            let reply = synthetic_reply(ip, 1);
            let candidate = parse_binding_response(&reply, 4000).expect("parse failed");
            let expected = std::net::Ipv4Addr::from(ip).to_string();
            assert_eq!(candidate.ip, expected);
        }
    }

    #[test]
    fn parse_rejects_truncated_and_garbage_replies() {
        assert!(parse_binding_response(&[], 9000).is_none());
        assert!(parse_binding_response(&[0u8; HEADER_LEN], 9000).is_none());
        assert!(parse_binding_response(&[0xffu8; 64], 9000).is_none());

        // Attribute tag truncated before the address bytes.
        let mut truncated = synthetic_reply([10, 0, 0, 1], 1);
        truncated.truncate(HEADER_LEN + 6);
        assert!(parse_binding_response(&truncated, 9000).is_none());
    }

    #[tokio::test]
    async fn probe_against_silent_reflector_times_out() {
        // A bound socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reflector = silent.local_addr().unwrap().to_string();

        let started = std::time::Instant::now();
        let result = discover(&reflector, 9000).await;
        assert!(result.is_err(), "silent reflector must not yield a candidate");
        assert!(
            started.elapsed() < PROBE_TIMEOUT + Duration::from_secs(1),
            "probe must respect its deadline"
        );
    }

    #[tokio::test]
    async fn probe_parses_reply_from_live_reflector() {
        let reflector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reflector_addr = reflector.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = reflector.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &binding_request());
            let reply = synthetic_reply([203, 0, 113, 7], 4444);
            reflector.send_to(&reply, from).await.unwrap();
        });

        let candidate = discover(&reflector_addr, 9000).await.expect("probe failed");
        assert_eq!(candidate.ip, "203.0.113.7");
        assert_eq!(candidate.port, 9000);
    }
}
