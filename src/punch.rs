//! UDP hole-punch engine.
//!
//! Hole-punching works because NATs admit inbound datagrams on mappings that
//! outbound traffic created. Both engines here only ever *write* to the
//! shared socket; the QUIC transport owns the read side and tolerates the
//! 5-byte `PUNCH` datagrams arriving before its handshake.
//!
//! Two modes:
//!
//! - **Burst** runs once before a dial: a short train of datagrams to every
//!   remote candidate, opening mappings for the handshake that follows.
//! - **Continuous** runs in the background on a listening peer: every tick it
//!   pulls the full registry listing and sends one datagram to every
//!   candidate of every other peer, keeping mappings fresh as peers come and
//!   go.
//!
//! Send failures are logged and skipped; one unreachable candidate never
//! aborts punching toward the rest.

use std::collections::HashSet;
use std::net::UdpSocket;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::candidate::Candidate;
use crate::signaling::Signaling;

/// Payload of every punch datagram.
pub const PUNCH_PAYLOAD: &[u8] = b"PUNCH";

/// Datagrams per candidate in a burst.
pub const BURST_PACKETS: usize = 5;

/// Gap between datagrams within a burst.
pub const BURST_INTERVAL: Duration = Duration::from_millis(100);

/// Settle time after a burst before the transport handshake starts, giving
/// NAT mappings on both sides time to exist.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Tick period of continuous punching.
pub const CONTINUOUS_INTERVAL: Duration = Duration::from_secs(5);

/// Burst-punch every candidate in `candidates`, in order.
///
/// Sends [`BURST_PACKETS`] datagrams [`BURST_INTERVAL`] apart to each
/// candidate. The socket is the peer's production socket, so the mappings
/// created here are exactly the ones the transport will use.
pub async fn burst(socket: &UdpSocket, candidates: &[Candidate]) {
    for candidate in candidates {
        let addr = match candidate.socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(candidate = %candidate, error = %e, "skipping unresolvable candidate");
                continue;
            }
        };

        for _ in 0..BURST_PACKETS {
            match socket.send_to(PUNCH_PAYLOAD, addr) {
                Ok(_) => trace!(target_addr = %addr, "sent punch packet"),
                Err(e) => debug!(target_addr = %addr, error = %e, "punch send failed"),
            }
            tokio::time::sleep(BURST_INTERVAL).await;
        }
    }
}

/// Continuously punch toward every registered peer until cancelled.
///
/// Every [`CONTINUOUS_INTERVAL`]: fetch the registry listing, skip our own
/// id, and send one datagram to each candidate of every remaining peer. The
/// punching itself is stateless; the set of previously seen peer ids exists
/// only to announce newcomers once.
///
/// Cancellation interrupts the wait between ticks without waiting for the
/// next one, and is not an error.
pub async fn continuous(
    socket: &UdpSocket,
    signaling: &dyn Signaling,
    self_id: &str,
    cancel: CancellationToken,
) {
    let mut known_peers: HashSet<String> = HashSet::new();
    let mut tick = tokio::time::interval(CONTINUOUS_INTERVAL);
    tick.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("continuous punching cancelled");
                return;
            }
            _ = tick.tick() => {}
        }

        let peers = match signaling.peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "failed to fetch peer listing");
                continue;
            }
        };

        for peer in peers {
            if peer.id == self_id {
                continue;
            }

            if known_peers.insert(peer.id.clone()) {
                info!(
                    peer = %peer.id,
                    candidates = peer.candidates.len(),
                    "discovered new peer"
                );
            }

            for candidate in &peer.candidates {
                let addr = match candidate.socket_addr() {
                    Ok(addr) => addr,
                    Err(_) => continue,
                };
                if let Err(e) = socket.send_to(PUNCH_PAYLOAD, addr) {
                    trace!(target_addr = %addr, error = %e, "punch send failed");
                }
            }
        }
    }
}
