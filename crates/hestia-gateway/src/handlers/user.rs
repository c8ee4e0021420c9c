use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hestia_core::{DriverInfo, DriverSpaceInfo, PageResult, RegisterRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::Hestia;
use crate::connections::Registration;
use crate::error::Result;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    id: String,
    name: String,
    driver: String,
    buckets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_info: Option<DriverInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    address: String,
    default_connection: String,
    buckets: Vec<String>,
    connections: Vec<ConnectionView>,
}

/// GET /api/user/{address}
pub async fn get_user_handler(
    State(app): State<Arc<Hestia>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<UserView>> {
    let user = app.authorize_user(&address, &headers).await?;

    let connections = user
        .connections
        .iter()
        .map(|(id, c)| ConnectionView {
            id: id.clone(),
            name: c.name.clone(),
            driver: c.driver.clone(),
            buckets: c.buckets.clone(),
            driver_info: app.drivers.info(&c.driver).ok().cloned(),
        })
        .collect();

    Ok(Json(UserView {
        buckets: user.buckets(),
        address: user.address,
        default_connection: user.default_connection,
        connections,
    }))
}

/// POST /api/user/{address}/login
pub async fn login_handler(
    State(app): State<Arc<Hestia>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    app.login(&address, &headers).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/user/{address}
pub async fn unregister_user_handler(
    State(app): State<Arc<Hestia>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let user = app.authorize_user(&address, &headers).await?;
    app.connections.unregister_user(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/user/{address}/connections/{conn}/info
pub async fn info_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, conn)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DriverSpaceInfo>> {
    let user = app.authorize_user(&address, &headers).await?;
    Ok(Json(app.connections.get_info(&user, &conn).await?))
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    page: Option<usize>,
}

/// GET /api/user/{address}/connections/{conn}/files
pub async fn files_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, conn)): Path<(String, String)>,
    Query(query): Query<FilesQuery>,
    headers: HeaderMap,
) -> Result<Json<PageResult<String>>> {
    let user = app.authorize_user(&address, &headers).await?;
    let listing = app
        .connections
        .list_files(
            &user,
            &conn,
            query.bucket.as_deref().filter(|b| !b.is_empty()),
            query.page.unwrap_or(0),
        )
        .await?;
    Ok(Json(listing))
}

/// POST /api/user/{address}/connections/{conn}/default
pub async fn set_default_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, conn)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let mut user = app.authorize_user(&address, &headers).await?;
    app.connections.set_default(&mut user, &conn).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/user/{address}/connections/{conn}/buckets
///
/// Newly mapped buckets are filled by an on-demand sync of the connection.
pub async fn set_buckets_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, conn)): Path<(String, String)>,
    headers: HeaderMap,
    Json(buckets): Json<Vec<String>>,
) -> Result<StatusCode> {
    let mut user = app.authorize_user(&address, &headers).await?;
    app.connections.set_buckets(&mut user, &conn, buckets).await?;

    if let Err(e) = app.sync.start(&address, Some(conn.clone())).await {
        warn!("Could not start sync of {} after bucket change: {}", conn, e);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/user/{address}/connections/{conn}
pub async fn delete_connection_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, conn)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let mut user = app.authorize_user(&address, &headers).await?;
    app.connections.delete_connection(&mut user, &conn).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "status")]
pub enum RegisterReply {
    Redirect {
        uri: String,
        headers: BTreeMap<String, String>,
    },
    Connected {
        address: String,
        connection_id: String,
    },
}

/// POST /api/user/{address}/register/{driver}
///
/// The query string is handed to the driver as registration context.
pub async fn register_handler(
    State(app): State<Arc<Hestia>>,
    Path((address, driver)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<RegisterReply>> {
    app.authenticate_address(&address, &headers).await?;

    let redirect_uri = query.get("redirect_uri").cloned();
    let req = RegisterRequest {
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        query,
    };

    let reply = match app
        .connections
        .register_connection(Some(&address), &driver, redirect_uri.as_deref(), Some(&req))
        .await?
    {
        Registration::Redirect { uri, headers } => RegisterReply::Redirect { uri, headers },
        Registration::Connected {
            address,
            connection_id,
        } => {
            info!("Registered {} with driver {}", address, driver);
            RegisterReply::Connected {
                address,
                connection_id,
            }
        }
    };
    Ok(Json(reply))
}
