//! HTTP handlers for artifact ingestion and preservation queries.
//! Streams request bodies straight into the core to avoid buffering in
//! memory and delegates all preservation concerns to `PreservationService`.

use crate::{
    errors::AppError,
    fixity::DeclaredChecksums,
    handlers::AppState,
    models::location::StorageTier,
    services::preservation_service::{IngestRequest, ReplicationTicket},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Query params accepted by `POST /artifacts`.
#[derive(Debug, Deserialize)]
pub struct IngestQuery {
    pub filename: String,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `POST /artifacts?filename=...` — ingest a new artifact.
///
/// The request body is the raw byte stream. Optional `x-declared-md5` /
/// `x-declared-sha256` headers carry caller-declared checksums; the
/// `content-length` header, when present, is recorded as the declared size.
pub async fn ingest_artifact(
    State(state): State<AppState>,
    Query(query): Query<IngestQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let declared_size = header_value(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<i64>().ok());
    let request = IngestRequest {
        filename: query.filename,
        content_type: header_value(&headers, header::CONTENT_TYPE.as_str()),
        declared_size,
        declared: DeclaredChecksums {
            md5: header_value(&headers, "x-declared-md5"),
            sha256: header_value(&headers, "x-declared-sha256"),
        },
    };

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let receipt = state.service.ingest(request, Box::pin(stream)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /artifacts/{id}` — current status and last-updated timestamp.
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let artifact = state.service.get_status(id).await?;
    Ok(Json(json!({
        "artifact_id": artifact.id,
        "status": artifact.status,
        "last_updated": artifact.updated_at,
    })))
}

/// `GET /artifacts/{id}/content` — stream the verified hot copy.
pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (artifact, reader) = state.service.open_content(id).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    let content_type = artifact
        .content_type
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&artifact.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    Ok(response)
}

/// `GET /artifacts/{id}/locations` — every physical copy and re-check.
pub async fn list_locations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let locations = state.service.list_locations(id).await?;
    let hot_copies = state
        .service
        .locations()
        .verified_count(id, StorageTier::Hot)
        .await?;
    let archive_copies = state
        .service
        .locations()
        .verified_count(id, StorageTier::Archive)
        .await?;
    Ok(Json(json!({
        "artifact_id": id,
        "total_copies": locations.len(),
        "verified_copies": {
            "hot": hot_copies,
            "archive": archive_copies,
        },
        "locations": locations,
    })))
}

/// `GET /artifacts/{id}/events` — full ordered audit history.
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let events = state.service.list_events(id).await?;
    Ok(Json(json!({
        "artifact_id": id,
        "events": events,
    })))
}

/// `POST /artifacts/{id}/replicate` — request archive replication.
pub async fn trigger_replication(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let ticket = state.service.trigger_replication(id).await?;
    let status = match ticket {
        ReplicationTicket::Accepted => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((
        status,
        Json(json!({
            "artifact_id": id,
            "replication": ticket,
        })),
    ))
}

/// `POST /artifacts/{id}/scrub` — re-verify every stored copy.
pub async fn scrub_artifact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.service.scrub(id).await?;
    Ok(Json(report))
}
