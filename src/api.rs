//! HTTP skin over the rendezvous registry.
//!
//! A thin request/response adapter; every decision about records lives in
//! [`Registry`]. Bodies are UTF-8 JSON.
//!
//! | Route | Method | Body | Success | Failure |
//! |---|---|---|---|---|
//! | `/register` | POST | `{"id", "candidates"}` | `{"status":"registered"}` | 400 malformed, 405 wrong method |
//! | `/peer?id=…` | GET | — | `PeerInfo` | 400 missing id, 404 absent/expired |
//! | `/peers` | GET | — | `[PeerInfo, …]` | — |
//!
//! Wrong-method 405s come from the router; malformed-body 400s from the
//! `Json` extractor.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::candidate::PeerInfo;
use crate::registry::Registry;
use crate::signaling::Registration;

/// Build the registry router. Exposed separately from [`serve`] so tests can
/// bind it to an ephemeral port.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/register", post(handle_register))
        .route("/peer", get(handle_get_peer))
        .route("/peers", get(handle_list_peers))
        .with_state(registry)
}

/// Serve the registry over HTTP until the process exits.
pub async fn serve(registry: Registry, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind registry listener on {addr}"))?;
    info!(%addr, "registry listening");
    axum::serve(listener, router(registry))
        .await
        .context("registry server failed")?;
    Ok(())
}

async fn handle_register(
    State(registry): State<Registry>,
    Json(registration): Json<Registration>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if registration.id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "peer id must be non-empty".into()));
    }

    let candidate_count = registration.candidates.len();
    registry
        .register(registration.id.clone(), registration.candidates)
        .await;
    info!(
        peer = %registration.id,
        candidates = candidate_count,
        "peer registered over HTTP"
    );

    Ok(Json(serde_json::json!({"status": "registered"})))
}

#[derive(Deserialize)]
struct PeerQuery {
    id: String,
}

async fn handle_get_peer(
    State(registry): State<Registry>,
    Query(query): Query<PeerQuery>,
) -> Result<Json<PeerInfo>, (StatusCode, String)> {
    if query.id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing peer id".into()));
    }

    match registry.get(&query.id).await {
        Some(info) => Ok(Json(info)),
        None => Err((StatusCode::NOT_FOUND, "peer not found".into())),
    }
}

async fn handle_list_peers(State(registry): State<Registry>) -> Json<Vec<PeerInfo>> {
    Json(registry.list().await)
}
