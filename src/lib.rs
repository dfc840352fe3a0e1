//! # Keyhole - P2P QUIC Through NAT
//!
//! Keyhole establishes direct, encrypted, peer-to-peer QUIC sessions between
//! endpoints that both sit behind NATs. Neither side has a reachable
//! listening address, so the crate's job is to manufacture one:
//!
//! - **Candidate discovery**: enumerate the `(IP, port)` pairs a peer might
//!   be reachable by — local interface addresses plus a public mapping
//!   learned from a reflexive (STUN-style) probe
//! - **Rendezvous registry**: a small TTL-bounded store that exchanges
//!   candidate lists between peers, exposed over HTTP+JSON
//! - **Hole-punching**: UDP choreography that opens NAT mappings on both
//!   sides before the handshake, with a continuous background mode
//! - **Connection establishment**: dial each remote candidate over the
//!   already-punched socket and hand back the first session that completes
//!
//! ## Quick Start
//!
//! ```ignore
//! // Listening side
//! let peer = Peer::new(PeerConfig::new("server").enable_reflex(true))?;
//! peer.discover().await?;
//! peer.register().await?;
//! peer.listen().await?;
//! while let Some(conn) = peer.accept(cancel.clone()).await? {
//!     // handle session
//! }
//!
//! // Dialing side
//! let peer = Peer::new(PeerConfig::new("client").local_port(9001))?;
//! peer.discover().await?;
//! peer.register().await?;
//! let conn = peer
//!     .connect("server", ConnectOptions::new(), cancel)
//!     .await?;
//! ```
//!
//! ## Design Notes
//!
//! The peer owns exactly one UDP socket: punch datagrams and the QUIC
//! session share it, so the NAT mapping the punches open is the one the
//! handshake then uses. The transport tolerates the stray `PUNCH` datagrams
//! that arrive before a handshake.
//!
//! Trust is out of scope: peer ids are opaque strings the registry does not
//! authenticate, and transport certificates are ephemeral and unverified.
//! Replace the certificate and verifier to bolt identity on.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `peer` | Peer controller: discover, register, listen, punch, connect |
//! | `candidate` | Candidate/PeerInfo data model, local enumeration |
//! | `reflex` | Reflexive address probe against a public reflector |
//! | `registry` | In-memory rendezvous store with TTL eviction |
//! | `api` | HTTP+JSON skin over the registry |
//! | `signaling` | Registry client trait, HTTP and in-process impls |
//! | `punch` | Burst and continuous UDP hole-punch engines |
//! | `crypto` | Ephemeral TLS material and QUIC session parameters |

mod api;
mod candidate;
mod crypto;
mod peer;
mod punch;
mod reflex;
mod registry;
mod signaling;

pub use candidate::{local_candidates, Candidate, PeerInfo};
pub use crypto::{ALPN, IDLE_TIMEOUT, KEEPALIVE_INTERVAL};
pub use peer::{
    ConnectOptions, Peer, PeerConfig, DEFAULT_LOCAL_PORT, DEFAULT_REGISTRY_URL, DIAL_TIMEOUT,
};
pub use punch::{BURST_PACKETS, CONTINUOUS_INTERVAL, PUNCH_PAYLOAD, SETTLE_DELAY};
pub use reflex::DEFAULT_REFLECTOR;
pub use registry::{Registry, REGISTRATION_TTL, SWEEP_INTERVAL};
pub use signaling::{HttpSignaling, LocalSignaling, Registration, Signaling};

pub use api::{router as registry_router, serve as serve_registry};

// Callers hold sessions and cancellation tokens from these crates directly.
pub use quinn;
pub use tokio_util::sync::CancellationToken;
