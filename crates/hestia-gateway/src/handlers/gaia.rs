use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hestia_core::{HestiaError, ReadResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::Hestia;
use crate::error::{ApiError, Result};
use crate::gaia::HubInfoResponse;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Success payload of a write, degraded when some connections failed.
#[derive(Serialize)]
struct WriteResponse {
    #[serde(rename = "publicURL", skip_serializing_if = "Option::is_none")]
    public_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

fn partial(ok: StatusCode, public_url: Option<String>, errors: &[HestiaError]) -> Response {
    let status = if errors.is_empty() {
        ok
    } else {
        StatusCode::MULTI_STATUS
    };
    let body = WriteResponse {
        public_url,
        errors: errors.iter().map(HestiaError::class).collect(),
    };
    (status, Json(body)).into_response()
}

/// GET /gaia/hub_info
pub async fn hub_info_handler(State(app): State<Arc<Hestia>>) -> Json<HubInfoResponse> {
    Json(app.gaia.hub_info(&app.settings.origin, &app.settings.server_name))
}

/// POST /gaia/store/{bucket}/{*path}
pub async fn store_handler(
    State(app): State<Arc<Hestia>>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let mut user = app.authorize(&bucket, &headers, Some(&path)).await?;
    let errors = app
        .gaia
        .store(&mut user, &bucket, &path, body, &content_type)
        .await?;

    debug!("Stored {}/{} ({} connection errors)", bucket, path, errors.len());
    Ok(partial(StatusCode::OK, Some(app.public_url(&bucket, &path)), &errors))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    metadata: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataResponse {
    content_type: String,
    size: u64,
    hash: String,
}

/// GET /gaia/read/{bucket}/{*path}
pub async fn read_handler(
    State(app): State<Arc<Hestia>>,
    Path((bucket, path)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> Result<Response> {
    if query.metadata.as_deref() == Some("true") {
        let view = app.gaia.metadata(&bucket, &path).await?;
        return Ok(Json(MetadataResponse {
            content_type: view.content_type,
            size: view.size,
            hash: view.hash,
        })
        .into_response());
    }

    match app.gaia.read(&bucket, &path).await?.0 {
        ReadResult::Content { content_type, data } => Ok((
            [(header::CONTENT_TYPE, content_type)],
            Body::from(data),
        )
            .into_response()),
        ReadResult::Redirect { url } => {
            Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
        }
    }
}

/// DELETE /gaia/delete/{bucket}/{*path}
pub async fn delete_handler(
    State(app): State<Arc<Hestia>>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let user = app.authorize(&bucket, &headers, None).await?;
    let errors = app.gaia.delete(&user, &bucket, &path).await?;
    if errors.is_empty() {
        return Ok(StatusCode::ACCEPTED.into_response());
    }
    Ok(partial(StatusCode::ACCEPTED, None, &errors))
}

#[derive(Debug, Default, Deserialize)]
struct ListFilesBody {
    /// Continuation token: a number, or a number as a string
    #[serde(default)]
    page: Option<serde_json::Value>,
    #[serde(default)]
    state: Option<bool>,
}

#[derive(Serialize)]
struct ListFilesReply {
    entries: Vec<hestia_core::ListEntry>,
    page: Option<String>,
}

fn parse_page(page: Option<&serde_json::Value>) -> Result<usize> {
    let invalid = || ApiError::from(HestiaError::malformed("Invalid page"));
    match page {
        None | Some(serde_json::Value::Null) => Ok(0),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(invalid),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(0),
        Some(serde_json::Value::String(s)) => s.parse().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

/// POST /gaia/list-files/{bucket}
pub async fn list_files_handler(
    State(app): State<Arc<Hestia>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let body: ListFilesBody = if body.is_empty() {
        ListFilesBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let page = parse_page(body.page.as_ref())?;

    app.authorize(&bucket, &headers, None).await?;
    let listing = app
        .gaia
        .list_files(&bucket, page, body.state.unwrap_or(false))
        .await?;

    let reply = ListFilesReply {
        entries: listing.entries,
        page: listing.next_page.map(|p| p.to_string()),
    };
    Ok((StatusCode::ACCEPTED, Json(reply)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeBody {
    oldest_valid_timestamp: Option<f64>,
}

#[derive(Serialize)]
struct StatusReply {
    status: &'static str,
}

/// POST /gaia/revoke-all/{bucket}
pub async fn revoke_all_handler(
    State(app): State<Arc<Hestia>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let body: RevokeBody =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let seconds = body
        .oldest_valid_timestamp
        .filter(|t| t.is_finite() && *t > 0.0)
        .ok_or_else(|| {
            ApiError::from(HestiaError::malformed(
                "oldestValidTimestamp must be a positive number",
            ))
        })?;

    let mut user = app.authorize(&bucket, &headers, None).await?;
    let errors = app
        .gaia
        .set_auth_timestamp(&mut user, &bucket, seconds.floor() as i64)
        .await?;
    info!("Revoked tokens of {} issued before {}", bucket, seconds);

    if !errors.is_empty() {
        return Ok(partial(StatusCode::ACCEPTED, None, &errors));
    }
    Ok((StatusCode::ACCEPTED, Json(StatusReply { status: "success" })).into_response())
}
