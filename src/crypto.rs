//! Transport security material.
//!
//! The traversal core does not authenticate peers — identity is a non-goal,
//! bolted on by replacing the certificate and verifier. What it does need is
//! a TLS handshake quinn will complete: each peer generates an ephemeral
//! self-signed certificate (RSA-2048, serial 1, 24-hour validity) at
//! construction, servers present it, and clients skip verification entirely.
//!
//! Both directions pin the `p2pquic` ALPN and run with a long idle timeout
//! plus keepalives, so punched NAT mappings outlive quiet periods.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// ALPN protocol identifier; prevents accidental cross-protocol sessions.
pub const ALPN: &[u8] = b"p2pquic";

/// Sessions survive this long without traffic.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Keepalive ping period; well under the idle timeout and short enough to
/// hold typical NAT UDP mappings open.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SNI sent on dial. Arbitrary, since verification is disabled.
pub const SERVER_NAME: &str = "keyhole";

/// Certificate validity window.
const CERT_VALIDITY: time::Duration = time::Duration::hours(24);

/// Lazily-initialized crypto provider for rustls, backed by ring.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Generate an ephemeral self-signed certificate and its private key.
///
/// RSA-2048 with serial number 1, valid for 24 hours from now. rcgen cannot
/// generate RSA keys itself, so the key comes from the `rsa` crate and is
/// handed to rcgen as PKCS#8.
pub fn generate_identity() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut rng = rand::thread_rng();
    let private_key =
        rsa::RsaPrivateKey::new(&mut rng, 2048).context("failed to generate RSA key")?;
    let pkcs8 = private_key
        .to_pkcs8_der()
        .context("failed to encode RSA key as PKCS#8")?;

    let key_pair = rcgen::KeyPair::try_from(pkcs8.as_bytes())
        .context("failed to load RSA key pair for certificate signing")?;

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.serial_number = Some(rcgen::SerialNumber::from(vec![0x01u8]));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + CERT_VALIDITY;

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec()));
    Ok((vec![cert_der], key_der))
}

/// Session parameters shared by both directions of the handshake.
fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .expect("5 minutes is a valid QUIC idle timeout"),
    ));
    transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
    Arc::new(transport)
}

/// Build the quinn server config presenting the given certificate. No client
/// authentication is requested.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(server_crypto).context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(transport_config());
    Ok(server_config)
}

/// Build the quinn client config. Server certificates are accepted without
/// verification; see the module docs for why that is the intended posture.
pub fn client_config() -> Result<quinn::ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(client_crypto).context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(transport_config());
    Ok(client_config)
}

/// Certificate verifier that accepts any server certificate.
///
/// Signature checks still delegate to the real provider so a garbled
/// handshake fails; only the trust decision is skipped.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}
