//! Integration tests for the hole-punch engines, driven through the peer
//! controller's public API against loopback UDP listeners.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test punch_engine -- --nocapture

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyhole::{
    Candidate, CancellationToken, ConnectOptions, LocalSignaling, Peer, PeerConfig, Registry,
    BURST_PACKETS, CONTINUOUS_INTERVAL, PUNCH_PAYLOAD,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_peer(id: &str, registry: &Registry) -> Arc<Peer> {
    let signaling = Arc::new(LocalSignaling::new(registry.clone()));
    let config = PeerConfig::new(id).local_port(next_port());
    Arc::new(Peer::with_signaling(config, signaling).expect("peer construction failed"))
}

/// Connecting to a candidate list of length N issues exactly 5·N punch
/// datagrams before the transport dial begins. The first non-PUNCH datagram
/// observed by the target is the QUIC Initial.
#[tokio::test]
async fn connect_bursts_five_packets_per_candidate() {
    let registry = Registry::new();
    let peer = test_peer("burster", &registry);

    // Two plain UDP listeners stand in for the remote's candidates.
    let target_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let candidates = vec![
        Candidate::new("127.0.0.1", target_a.local_addr().unwrap().port()),
        Candidate::new("127.0.0.1", target_b.local_addr().unwrap().port()),
    ];

    let cancel = CancellationToken::new();
    let count_punches = |socket: UdpSocket, cancel: CancellationToken| async move {
        let mut punches = 0usize;
        let mut buf = [0u8; 2048];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    // Count anything already buffered before stopping.
                    while let Ok((n, _)) = socket.try_recv_from(&mut buf) {
                        if &buf[..n] == PUNCH_PAYLOAD {
                            punches += 1;
                        }
                    }
                    break;
                }
                received = timeout(Duration::from_secs(20), socket.recv_from(&mut buf)) => received,
            };
            let Ok(Ok((n, _))) = received else { break };
            if &buf[..n] == PUNCH_PAYLOAD {
                punches += 1;
            } else {
                // Transport dial has begun; no punches may follow it.
                cancel.cancel();
                break;
            }
        }
        punches
    };

    let counter_a = tokio::spawn(count_punches(target_a, cancel.clone()));
    let counter_b = tokio::spawn(count_punches(target_b, cancel.clone()));

    // The dial itself can never succeed; cancellation fires once the first
    // QUIC datagram lands.
    let outcome = peer
        .connect(
            "nobody",
            ConnectOptions::new().with_candidates(candidates),
            cancel.clone(),
        )
        .await
        .expect("connect must not error before cancellation");
    assert!(outcome.is_none(), "cancelled connect must yield None");

    cancel.cancel();
    let punches_a = counter_a.await.unwrap();
    let punches_b = counter_b.await.unwrap();

    assert_eq!(punches_a, BURST_PACKETS, "first candidate punch count");
    assert_eq!(punches_b, BURST_PACKETS, "second candidate punch count");

    registry.close();
}

/// An unresolvable candidate must not suppress bursts to the candidates
/// after it.
#[tokio::test]
async fn burst_survives_bad_candidates() {
    let registry = Registry::new();
    let peer = test_peer("resilient", &registry);

    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let candidates = vec![
        Candidate::new("not-an-address", 9000),
        Candidate::new("127.0.0.1", target.local_addr().unwrap().port()),
    ];

    let cancel = CancellationToken::new();
    let counter = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut punches = 0usize;
            let mut buf = [0u8; 2048];
            loop {
                let Ok(Ok((n, _))) =
                    timeout(Duration::from_secs(20), target.recv_from(&mut buf)).await
                else {
                    break;
                };
                if &buf[..n] == PUNCH_PAYLOAD {
                    punches += 1;
                } else {
                    cancel.cancel();
                    break;
                }
            }
            punches
        })
    };

    let outcome = peer
        .connect(
            "nobody",
            ConnectOptions::new().with_candidates(candidates),
            cancel.clone(),
        )
        .await
        .expect("connect must not error before cancellation");
    assert!(outcome.is_none());

    cancel.cancel();
    assert_eq!(counter.await.unwrap(), BURST_PACKETS);

    registry.close();
}

/// Continuous punching pulls the listing every tick and sends one datagram
/// per candidate of every peer that is not us.
#[tokio::test]
async fn continuous_punch_reaches_registered_peers() {
    let registry = Registry::new();
    let peer = test_peer("puncher", &registry);
    peer.listen().await.expect("listen failed");

    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();

    // Another peer's registration, plus our own (which must be skipped).
    registry
        .register("other", vec![Candidate::new("127.0.0.1", target_port)])
        .await;
    registry
        .register("puncher", vec![Candidate::new("127.0.0.1", 1)])
        .await;

    let cancel = CancellationToken::new();
    let punch_task = {
        let peer = peer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { peer.continuous_punch(cancel).await })
    };

    // The first tick lands one interval in; allow two.
    let mut buf = [0u8; 2048];
    let (n, _) = timeout(
        CONTINUOUS_INTERVAL * 2 + Duration::from_secs(1),
        target.recv_from(&mut buf),
    )
    .await
    .expect("no punch datagram arrived")
    .expect("recv failed");
    assert_eq!(&buf[..n], PUNCH_PAYLOAD);

    cancel.cancel();
    punch_task
        .await
        .expect("task panicked")
        .expect("continuous punch failed");

    peer.close().await;
    registry.close();
}

/// Cancelling continuous punching during its sleep returns promptly, well
/// within one tick period.
#[tokio::test]
async fn continuous_punch_cancellation_is_prompt() {
    let registry = Registry::new();
    let peer = test_peer("cancelled", &registry);
    peer.listen().await.expect("listen failed");

    let cancel = CancellationToken::new();
    let punch_task = {
        let peer = peer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { peer.continuous_punch(cancel).await })
    };

    // Let the engine settle into its first sleep, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let started = std::time::Instant::now();
    timeout(Duration::from_secs(1), punch_task)
        .await
        .expect("cancellation was not prompt")
        .expect("task panicked")
        .expect("continuous punch failed");
    assert!(started.elapsed() < Duration::from_secs(1));

    peer.close().await;
    registry.close();
}
