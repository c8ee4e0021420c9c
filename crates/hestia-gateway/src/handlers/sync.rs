use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::app::Hestia;
use crate::error::Result;

/// POST /plugins/sync/{address}/start
pub async fn start_handler(
    State(app): State<Arc<Hestia>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    app.authenticate_address(&address, &headers).await?;
    app.sync.start(&address, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /plugins/sync/{address}/start/{conn}
pub async fn start_connection_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, conn)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    app.authenticate_address(&address, &headers).await?;
    app.sync.start(&address, Some(conn)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /plugins/sync/{address}/working
pub async fn working_handler(
    State(app): State<Arc<Hestia>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<bool>> {
    app.authenticate_address(&address, &headers).await?;
    Ok(Json(app.sync.is_working(&address)))
}
