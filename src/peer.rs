//! Peer controller.
//!
//! A [`Peer`] owns the one UDP socket everything rides on: hole-punch
//! datagrams go out on it, and the QUIC endpoint reads and writes it. Sharing
//! one socket is what makes traversal work — the NAT mapping the punches
//! create is exactly the mapping the transport handshake then traverses.
//!
//! The controller orchestrates the full sequence:
//!
//! ```text
//! Created ──discover──► Discovered ──register──► Registered
//!    │                       │                       │
//!    │                       └──listen──► Listening ─┤
//!    │                                               │
//!    └───────────── connect (lazy socket) ───────────┴──► session returned
//! ```
//!
//! `connect` may run from any state that is not closed; `close` is terminal
//! and idempotent. The socket is created lazily on first `listen` or
//! `connect` and closed exactly once.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use quinn::{Connection, Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::{self, Candidate};
use crate::crypto;
use crate::punch;
use crate::reflex;
use crate::signaling::{HttpSignaling, Signaling};

/// Default UDP bind port. Both sides of a punch need a stable, known port:
/// the reflexive probe, the punch datagrams, and the QUIC session must all
/// share one mapping.
pub const DEFAULT_LOCAL_PORT: u16 = 9000;

/// Default rendezvous registry URL.
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8080";

/// Per-candidate QUIC dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer configuration. Construct with [`PeerConfig::new`] and chain setters
/// for anything beyond the defaults.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Opaque identifier this peer registers under. Must be non-empty.
    pub peer_id: String,
    /// UDP bind port. Zero selects [`DEFAULT_LOCAL_PORT`].
    pub local_port: u16,
    /// Base URL of the rendezvous registry.
    pub registry_url: String,
    /// Whether discovery runs the reflexive probe.
    pub enable_reflex: bool,
    /// Reflector endpoint for the probe. A configuration-time constant;
    /// there is no reflector discovery.
    pub reflector: String,
}

impl PeerConfig {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            local_port: DEFAULT_LOCAL_PORT,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            enable_reflex: false,
            reflector: reflex::DEFAULT_REFLECTOR.to_string(),
        }
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    pub fn enable_reflex(mut self, enable: bool) -> Self {
        self.enable_reflex = enable;
        self
    }

    pub fn reflector(mut self, reflector: impl Into<String>) -> Self {
        self.reflector = reflector.into();
        self
    }
}

/// Options for [`Peer::connect`].
///
/// By default the remote candidate list is fetched from the registry;
/// [`ConnectOptions::with_candidates`] supplies it directly and bypasses the
/// lookup.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    candidates: Option<Vec<Candidate>>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial these candidates instead of consulting the registry.
    pub fn with_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.candidates = Some(candidates);
        self
    }
}

/// The lazily-created socket pair: a QUIC endpoint and the punch-side clone
/// of its UDP socket. Cheap to clone.
#[derive(Clone)]
struct Transport {
    endpoint: Endpoint,
    punch_socket: Arc<std::net::UdpSocket>,
}

/// A P2P QUIC peer.
///
/// All methods take `&self`; wrap the peer in an [`Arc`] to run `accept` and
/// `continuous_punch` from separate tasks.
pub struct Peer {
    config: PeerConfig,
    signaling: std::sync::RwLock<Arc<dyn Signaling>>,
    server_config: quinn::ServerConfig,
    client_config: quinn::ClientConfig,
    transport: tokio::sync::Mutex<Option<Transport>>,
    candidates: std::sync::Mutex<Vec<Candidate>>,
    /// Actual bound port once the socket exists; zero while unbound.
    bound_port: AtomicU16,
    listening: AtomicBool,
    closed: AtomicBool,
}

impl Peer {
    /// Create a peer from `config`. Validates the peer id, fills defaults,
    /// and generates the ephemeral transport certificate. No I/O happens
    /// here; the socket is bound on first `listen` or `connect`.
    pub fn new(config: PeerConfig) -> Result<Self> {
        let url = if config.registry_url.is_empty() {
            DEFAULT_REGISTRY_URL.to_string()
        } else {
            config.registry_url.clone()
        };
        Self::with_signaling(config, Arc::new(HttpSignaling::new(url)))
    }

    /// Create a peer with a custom signaling client. This is how tests and
    /// single-process deployments substitute [`crate::LocalSignaling`] for
    /// the HTTP transport.
    pub fn with_signaling(mut config: PeerConfig, signaling: Arc<dyn Signaling>) -> Result<Self> {
        if config.peer_id.is_empty() {
            bail!("peer id is required");
        }
        if config.local_port == 0 {
            config.local_port = DEFAULT_LOCAL_PORT;
        }
        if config.registry_url.is_empty() {
            config.registry_url = DEFAULT_REGISTRY_URL.to_string();
        }
        if config.reflector.is_empty() {
            config.reflector = reflex::DEFAULT_REFLECTOR.to_string();
        }

        let (certs, key) = crypto::generate_identity()?;
        let server_config = crypto::server_config(certs, key)?;
        let client_config = crypto::client_config()?;

        Ok(Self {
            config,
            signaling: std::sync::RwLock::new(signaling),
            server_config,
            client_config,
            transport: tokio::sync::Mutex::new(None),
            candidates: std::sync::Mutex::new(Vec::new()),
            bound_port: AtomicU16::new(0),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// The socket's real port once bound, else the configured port.
    pub fn actual_port(&self) -> u16 {
        match self.bound_port.load(Ordering::SeqCst) {
            0 => self.config.local_port,
            port => port,
        }
    }

    /// Candidates from the most recent [`Peer::discover`] call.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates
            .lock()
            .map(|candidates| candidates.clone())
            .unwrap_or_default()
    }

    /// Point the peer at a different registry. Takes effect on the next
    /// signaling operation.
    pub fn set_registry_url(&self, url: impl Into<String>) {
        let url = url.into();
        if let Ok(mut guard) = self.signaling.write() {
            *guard = Arc::new(HttpSignaling::new(url.clone()));
        }
        info!(%url, "signaling client updated");
    }

    /// The punch-side handle of the shared UDP socket, for manual punching.
    /// `None` until the socket exists.
    pub async fn udp_socket(&self) -> Option<Arc<std::net::UdpSocket>> {
        self.transport
            .lock()
            .await
            .as_ref()
            .map(|transport| transport.punch_socket.clone())
    }

    /// Enumerate this peer's candidates: the reflexive candidate first (when
    /// the probe is enabled and succeeds), then every non-loopback local
    /// IPv4 address. Repeated calls recompute.
    ///
    /// A failing probe is never fatal; the peer proceeds with local
    /// candidates only.
    pub async fn discover(&self) -> Result<Vec<Candidate>> {
        let port = self.actual_port();
        let mut candidates = Vec::new();

        if self.config.enable_reflex {
            debug!(reflector = %self.config.reflector, "running reflexive probe");
            match reflex::discover(&self.config.reflector, port).await {
                Ok(candidate) => {
                    info!(%candidate, "reflexive candidate discovered");
                    candidates.push(candidate);
                }
                Err(e) => {
                    warn!(error = %e, "reflexive probe failed, continuing with local candidates");
                }
            }
        }

        candidates.extend(candidate::local_candidates(port));
        debug!(count = candidates.len(), "candidates discovered");

        if let Ok(mut guard) = self.candidates.lock() {
            *guard = candidates.clone();
        }
        Ok(candidates)
    }

    /// Push this peer's discovered candidates to the registry.
    pub async fn register(&self) -> Result<()> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            bail!("no candidates to register; call discover first");
        }
        self.signaling()
            .register(&self.config.peer_id, &candidates)
            .await
    }

    /// Bind the UDP socket (if not already bound) and start accepting
    /// transport handshakes on it.
    pub async fn listen(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_transport().await?;
        self.listening.store(true, Ordering::SeqCst);
        info!(port = self.actual_port(), "QUIC listener started");
        Ok(())
    }

    /// Accept one incoming transport session.
    ///
    /// Returns `Ok(None)` when `cancel` fires or the peer is closed —
    /// cancellation is an outcome, not an error.
    pub async fn accept(&self, cancel: CancellationToken) -> Result<Option<Connection>> {
        self.ensure_open()?;
        if !self.listening.load(Ordering::SeqCst) {
            bail!("peer is not listening; call listen first");
        }

        let endpoint = match &*self.transport.lock().await {
            Some(transport) => transport.endpoint.clone(),
            None => bail!("peer is not listening; call listen first"),
        };

        let accept_one = async {
            match endpoint.accept().await {
                Some(incoming) => {
                    let connection = incoming
                        .await
                        .context("failed to accept incoming connection")?;
                    debug!(remote = %connection.remote_address(), "accepted connection");
                    Ok(Some(connection))
                }
                // The endpoint was closed out from under us.
                None => Ok(None),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = accept_one => result,
        }
    }

    /// Connect to a remote peer: obtain its candidates (from `options` or
    /// the registry), punch holes toward all of them, wait for the mappings
    /// to settle, then dial candidates in order and return the first session
    /// that completes.
    ///
    /// Returns `Ok(None)` if `cancel` fires first.
    pub async fn connect(
        &self,
        remote_peer_id: &str,
        options: ConnectOptions,
        cancel: CancellationToken,
    ) -> Result<Option<Connection>> {
        self.ensure_open()?;

        let connect = async {
            let candidates = match options.candidates {
                Some(candidates) if !candidates.is_empty() => {
                    debug!(count = candidates.len(), "using provided candidates");
                    candidates
                }
                _ => {
                    let info = self
                        .signaling()
                        .peer(remote_peer_id)
                        .await
                        .context("failed to get remote peer info")?
                        .with_context(|| format!("remote peer {remote_peer_id} not found"))?;
                    debug!(count = info.candidates.len(), "fetched remote candidates");
                    info.candidates
                }
            };

            let transport = self.ensure_transport().await?;

            info!(remote = %remote_peer_id, "performing UDP hole-punch");
            punch::burst(&transport.punch_socket, &candidates).await;

            // Give both NATs time to install their mappings.
            tokio::time::sleep(punch::SETTLE_DELAY).await;

            info!(remote = %remote_peer_id, "attempting QUIC connection");
            establish(&transport.endpoint, &self.client_config, &candidates).await
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = connect => result.map(Some),
        }
    }

    /// Run continuous hole-punching toward every registered peer until
    /// `cancel` fires. Requires the socket to exist.
    pub async fn continuous_punch(&self, cancel: CancellationToken) -> Result<()> {
        self.ensure_open()?;
        let punch_socket = match &*self.transport.lock().await {
            Some(transport) => transport.punch_socket.clone(),
            None => bail!("UDP socket not initialized; call listen or connect first"),
        };

        let signaling = self.signaling();
        punch::continuous(
            &punch_socket,
            signaling.as_ref(),
            &self.config.peer_id,
            cancel,
        )
        .await;
        Ok(())
    }

    /// Close the peer: stop the listener, then the socket. Idempotent and
    /// safe from any state; the peer accepts no further operations.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);

        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            // Listener first, then the socket (dropped with the transport).
            transport.endpoint.close(0u32.into(), b"peer closed");
            info!("peer closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("peer is closed");
        }
        Ok(())
    }

    fn signaling(&self) -> Arc<dyn Signaling> {
        match self.signaling.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Bind the shared UDP socket and build the QUIC endpoint over it,
    /// once. The punch engine holds a cloned handle to the same file
    /// descriptor; only the endpoint ever reads.
    async fn ensure_transport(&self) -> Result<Transport> {
        let mut guard = self.transport.lock().await;
        if let Some(transport) = guard.as_ref() {
            return Ok(transport.clone());
        }

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.local_port));
        let socket = std::net::UdpSocket::bind(bind_addr)
            .with_context(|| format!("failed to bind UDP socket on {bind_addr}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to set UDP socket non-blocking")?;
        let punch_socket = Arc::new(
            socket
                .try_clone()
                .context("failed to clone UDP socket for punching")?,
        );

        let endpoint = Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(self.server_config.clone()),
            socket,
            Arc::new(quinn::TokioRuntime),
        )
        .context("failed to create QUIC endpoint")?;

        let local_addr = endpoint
            .local_addr()
            .context("failed to read bound address")?;
        self.bound_port.store(local_addr.port(), Ordering::SeqCst);
        debug!(%local_addr, "UDP socket bound");

        let transport = Transport {
            endpoint,
            punch_socket,
        };
        *guard = Some(transport.clone());
        Ok(transport)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.config.peer_id)
            .field("local_port", &self.config.local_port)
            .finish_non_exhaustive()
    }
}

/// Dial `candidates` in list order over the shared endpoint; return the
/// first session whose handshake completes within [`DIAL_TIMEOUT`].
///
/// Per-candidate failures (resolve, dial, handshake, timeout) are logged and
/// skipped; a candidate is never retried within one call. Only when every
/// candidate fails does a single aggregated error surface.
async fn establish(
    endpoint: &Endpoint,
    client_config: &quinn::ClientConfig,
    candidates: &[Candidate],
) -> Result<Connection> {
    for candidate in candidates {
        let addr = match candidate.socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(candidate = %candidate, error = %e, "skipping unresolvable candidate");
                continue;
            }
        };

        debug!(%addr, "attempting QUIC connection");
        let connecting = match endpoint.connect_with(client_config.clone(), addr, crypto::SERVER_NAME)
        {
            Ok(connecting) => connecting,
            Err(e) => {
                debug!(%addr, error = %e, "failed to initiate connection");
                continue;
            }
        };

        match tokio::time::timeout(DIAL_TIMEOUT, connecting).await {
            Ok(Ok(connection)) => {
                info!(%addr, "QUIC connection established");
                return Ok(connection);
            }
            Ok(Err(e)) => debug!(%addr, error = %e, "QUIC handshake failed"),
            Err(_) => debug!(%addr, "QUIC dial timed out"),
        }
    }

    bail!("failed to connect to any of {} candidates", candidates.len())
}
