//! HTTP handlers.
//!
//! Implements:
//! - /gaia/* - the Gaia hub protocol over the fan-out service
//! - /api/user/* - connection management
//! - /plugins/sync/* - on-demand read-repair
//! - GET /health - Health check endpoint

mod gaia;
mod sync;
mod user;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::Hestia;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub drivers: usize,
}

/// GET /health - Health check endpoint.
pub async fn health_handler(State(app): State<Arc<Hestia>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        drivers: app.drivers.len(),
    })
}

pub fn router(app: Arc<Hestia>) -> Router {
    let body_limit = match app.settings.max_blob_size {
        0 => DefaultBodyLimit::disable(),
        // room for the limit check to reject oversized blobs itself
        n => DefaultBodyLimit::max(usize::try_from(n).unwrap_or(usize::MAX).saturating_add(1)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/gaia/hub_info", get(gaia::hub_info_handler))
        .route("/gaia/store/{bucket}/{*path}", post(gaia::store_handler))
        .route("/gaia/read/{bucket}/{*path}", get(gaia::read_handler))
        .route("/gaia/delete/{bucket}/{*path}", delete(gaia::delete_handler))
        .route("/gaia/list-files/{bucket}", post(gaia::list_files_handler))
        .route("/gaia/revoke-all/{bucket}", post(gaia::revoke_all_handler))
        .route(
            "/api/user/{address}",
            get(user::get_user_handler).delete(user::unregister_user_handler),
        )
        .route(
            "/api/user/{address}/connections/{conn}",
            delete(user::delete_connection_handler),
        )
        .route("/api/user/{address}/connections/{conn}/info", get(user::info_handler))
        .route("/api/user/{address}/connections/{conn}/files", get(user::files_handler))
        .route(
            "/api/user/{address}/connections/{conn}/default",
            post(user::set_default_handler),
        )
        .route(
            "/api/user/{address}/connections/{conn}/buckets",
            post(user::set_buckets_handler),
        )
        .route("/api/user/{address}/login", post(user::login_handler))
        .route("/api/user/{address}/register/{driver}", post(user::register_handler))
        .route("/plugins/sync/{address}/start", post(sync::start_handler))
        .route("/plugins/sync/{address}/start/{conn}", post(sync::start_connection_handler))
        .route("/plugins/sync/{address}/working", get(sync::working_handler))
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
