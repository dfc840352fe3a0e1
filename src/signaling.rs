//! Signaling clients for the rendezvous registry.
//!
//! The traversal core talks to the registry through the [`Signaling`] trait
//! so the transport can be swapped: [`HttpSignaling`] is the production
//! HTTP+JSON client, [`LocalSignaling`] short-circuits to an in-process
//! [`Registry`] for tests and single-process deployments.
//!
//! Registry failures are surfaced unchanged — a peer that cannot reach its
//! rendezvous has nothing useful to fall back on. A peer that is absent or
//! expired is a structural `None`, not an error.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, PeerInfo};
use crate::registry::Registry;

/// Request body for peer registration. The registry stamps the timestamp on
/// receipt; clients never supply one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub candidates: Vec<Candidate>,
}

/// Rendezvous operations as seen from a peer.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Upsert this peer's candidate list under its id.
    async fn register(&self, peer_id: &str, candidates: &[Candidate]) -> Result<()>;

    /// Fetch one peer's record. `None` when absent or expired.
    async fn peer(&self, peer_id: &str) -> Result<Option<PeerInfo>>;

    /// Fetch every live registration.
    async fn peers(&self) -> Result<Vec<PeerInfo>>;
}

/// HTTP+JSON signaling client for a remote registry server.
pub struct HttpSignaling {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSignaling {
    /// Create a client for the registry at `base_url`
    /// (e.g. `http://localhost:8080`). Trailing slashes are tolerated.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn register(&self, peer_id: &str, candidates: &[Candidate]) -> Result<()> {
        let body = Registration {
            id: peer_id.to_string(),
            candidates: candidates.to_vec(),
        };

        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach registry at {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("registration failed: {status} {detail}");
        }
        Ok(())
    }

    async fn peer(&self, peer_id: &str) -> Result<Option<PeerInfo>> {
        let response = self
            .client
            .get(format!("{}/peer", self.base_url))
            .query(&[("id", peer_id)])
            .send()
            .await
            .with_context(|| format!("failed to reach registry at {}", self.base_url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("peer lookup failed: {}", response.status());
        }

        let info = response
            .json::<PeerInfo>()
            .await
            .context("failed to decode peer record")?;
        Ok(Some(info))
    }

    async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let response = self
            .client
            .get(format!("{}/peers", self.base_url))
            .send()
            .await
            .with_context(|| format!("failed to reach registry at {}", self.base_url))?;

        if !response.status().is_success() {
            bail!("peer listing failed: {}", response.status());
        }

        response
            .json::<Vec<PeerInfo>>()
            .await
            .context("failed to decode peer listing")
    }
}

/// In-process signaling against a shared [`Registry`]. Used by tests and by
/// deployments that embed the registry in the same process as a peer.
#[derive(Clone)]
pub struct LocalSignaling {
    registry: Registry,
}

impl LocalSignaling {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Signaling for LocalSignaling {
    async fn register(&self, peer_id: &str, candidates: &[Candidate]) -> Result<()> {
        self.registry.register(peer_id, candidates.to_vec()).await;
        Ok(())
    }

    async fn peer(&self, peer_id: &str) -> Result<Option<PeerInfo>> {
        Ok(self.registry.get(peer_id).await)
    }

    async fn peers(&self) -> Result<Vec<PeerInfo>> {
        Ok(self.registry.list().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_signaling_round_trip() {
        let registry = Registry::new();
        let signaling = LocalSignaling::new(registry.clone());

        let candidates = vec![Candidate::new("10.0.0.1", 9000)];
        signaling.register("A", &candidates).await.unwrap();

        let info = signaling.peer("A").await.unwrap().expect("peer missing");
        assert_eq!(info.candidates, candidates);

        assert!(signaling.peer("absent").await.unwrap().is_none());
        assert_eq!(signaling.peers().await.unwrap().len(), 1);

        registry.close();
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpSignaling::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
