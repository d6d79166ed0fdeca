//! Defines routes for the preservation API.
//!
//! ## Structure
//! - **Ingestion**
//!   - `POST /artifacts?filename=...` — ingest a byte stream
//!
//! - **Per-artifact queries and actions**
//!   - `GET  /artifacts/{id}` — lifecycle status
//!   - `GET  /artifacts/{id}/content` — stream the hot copy
//!   - `GET  /artifacts/{id}/locations` — physical copies + re-checks
//!   - `GET  /artifacts/{id}/events` — ordered audit history
//!   - `POST /artifacts/{id}/replicate` — request archive replication
//!   - `POST /artifacts/{id}/scrub` — re-verify stored copies
//!
//! The concrete transport stops here: handlers translate to and from the
//! core's plain data structures and never leak axum types inward.

use crate::handlers::{
    AppState,
    artifact_handlers::{
        get_content, get_status, ingest_artifact, list_events, list_locations, scrub_artifact,
        trigger_replication,
    },
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for the preservation API.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // ingestion
        .route("/artifacts", post(ingest_artifact))
        // per-artifact routes
        .route("/artifacts/{id}", get(get_status))
        .route("/artifacts/{id}/content", get(get_content))
        .route("/artifacts/{id}/locations", get(list_locations))
        .route("/artifacts/{id}/events", get(list_events))
        .route("/artifacts/{id}/replicate", post(trigger_replication))
        .route("/artifacts/{id}/scrub", post(scrub_artifact))
}
