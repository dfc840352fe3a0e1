use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use keyhole::{Candidate, ConnectOptions, Peer, PeerConfig, Registry};

/// `IP:PORT` argument that becomes a dial candidate.
#[derive(Clone, Debug)]
struct CandidateArg(Candidate);

impl FromStr for CandidateArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddr = s.parse().context("candidate must be IP:PORT")?;
        if !addr.is_ipv4() {
            anyhow::bail!("candidate must be an IPv4 address");
        }
        Ok(CandidateArg(Candidate::new(addr.ip().to_string(), addr.port())))
    }
}

#[derive(Parser, Debug)]
#[command(name = "keyhole")]
#[command(author, version, about = "P2P QUIC sessions through NAT", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous registry server.
    Registry {
        /// HTTP listen port.
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Register, listen for incoming sessions, and punch continuously.
    Listen {
        /// This peer's id.
        #[arg(short, long, default_value = "server")]
        id: String,
        /// Local UDP port. Punch packets, the reflexive probe, and QUIC
        /// must share it, or the NAT mappings will not match.
        #[arg(short, long, default_value = "9000")]
        port: u16,
        /// Rendezvous registry URL.
        #[arg(short, long, default_value = "http://localhost:8080")]
        registry: String,
        /// Run the reflexive probe during discovery.
        #[arg(long)]
        reflex: bool,
    },
    /// Connect to a remote peer and exchange greetings.
    Connect {
        /// This peer's id.
        #[arg(short, long, default_value = "client")]
        id: String,
        /// Remote peer id to connect to.
        #[arg(long)]
        remote: String,
        /// Local UDP port.
        #[arg(short, long, default_value = "9000")]
        port: u16,
        /// Rendezvous registry URL.
        #[arg(short, long, default_value = "http://localhost:8080")]
        registry: String,
        /// Run the reflexive probe during discovery.
        #[arg(long)]
        reflex: bool,
        /// Dial these candidates directly instead of asking the registry.
        #[arg(long = "candidate", value_name = "IP:PORT")]
        candidates: Vec<CandidateArg>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Registry { port } => run_registry(port).await,
        Command::Listen {
            id,
            port,
            registry,
            reflex,
        } => {
            let peer = build_peer(id, port, registry, reflex)?;
            run_listener(peer).await
        }
        Command::Connect {
            id,
            remote,
            port,
            registry,
            reflex,
            candidates,
        } => {
            let peer = build_peer(id, port, registry, reflex)?;
            let candidates: Vec<Candidate> = candidates.into_iter().map(|c| c.0).collect();
            run_client(peer, &remote, candidates).await
        }
    }
}

async fn run_registry(port: u16) -> Result<()> {
    let registry = Registry::new();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tokio::select! {
        result = keyhole::serve_registry(registry.clone(), addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down registry");
            registry.close();
            Ok(())
        }
    }
}

fn build_peer(id: String, port: u16, registry: String, reflex: bool) -> Result<Arc<Peer>> {
    let config = PeerConfig::new(id)
        .local_port(port)
        .registry_url(registry)
        .enable_reflex(reflex);
    Ok(Arc::new(Peer::new(config)?))
}

async fn discover_and_register(peer: &Peer) -> Result<()> {
    let candidates = peer.discover().await?;
    info!(count = candidates.len(), "candidates discovered");
    for candidate in &candidates {
        info!("  - {candidate}");
    }
    peer.register().await?;
    info!("registered with rendezvous");
    Ok(())
}

async fn run_listener(peer: Arc<Peer>) -> Result<()> {
    discover_and_register(&peer).await?;
    peer.listen().await?;

    let cancel = CancellationToken::new();

    // Keep punching toward every other registered peer so inbound
    // handshakes find an open mapping.
    let puncher = {
        let peer = peer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.continuous_punch(cancel).await {
                warn!(error = %e, "continuous punching stopped");
            }
        })
    };

    // Registrations expire after one TTL; refresh at half that period.
    let reregister = {
        let peer = peer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(15));
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = peer.register().await {
                            warn!(error = %e, "re-registration failed");
                        }
                    }
                }
            }
        })
    };

    info!("waiting for incoming connections");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            accepted = peer.accept(cancel.clone()) => {
                match accepted {
                    Ok(Some(connection)) => {
                        info!(remote = %connection.remote_address(), "accepted connection");
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(connection).await {
                                warn!(error = %e, "connection handler ended");
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = puncher.await;
    let _ = reregister.await;
    peer.close().await;
    Ok(())
}

async fn handle_connection(connection: quinn::Connection) -> Result<()> {
    let (mut send, mut recv) = connection
        .accept_bi()
        .await
        .context("failed to accept stream")?;

    let mut buf = [0u8; 1024];
    while let Some(n) = recv.read(&mut buf).await.context("stream read failed")? {
        info!(
            remote = %connection.remote_address(),
            message = %String::from_utf8_lossy(&buf[..n]),
            "received"
        );
        send.write_all(b"Hello from server!")
            .await
            .context("stream write failed")?;
    }
    Ok(())
}

async fn run_client(peer: Arc<Peer>, remote: &str, candidates: Vec<Candidate>) -> Result<()> {
    discover_and_register(&peer).await?;

    let mut options = ConnectOptions::new();
    if !candidates.is_empty() {
        options = options.with_candidates(candidates);
    }

    let cancel = CancellationToken::new();
    let connection = peer
        .connect(remote, options, cancel.clone())
        .await?
        .context("connect was cancelled")?;
    info!(remote_addr = %connection.remote_address(), "QUIC connection established");

    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .context("failed to open stream")?;

    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            result = exchange(&mut send, &mut recv, &mut buf) => {
                if let Err(e) = result {
                    warn!(error = %e, "exchange ended");
                    break;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    connection.close(0u32.into(), b"done");
    peer.close().await;
    Ok(())
}

async fn exchange(
    send: &mut quinn::SendStream,
    recv: &mut quinn::RecvStream,
    buf: &mut [u8],
) -> Result<()> {
    send.write_all(b"Hello from client!")
        .await
        .context("stream write failed")?;
    let n = recv
        .read(buf)
        .await
        .context("stream read failed")?
        .context("stream closed by remote")?;
    info!(message = %String::from_utf8_lossy(&buf[..n]), "received");
    Ok(())
}
