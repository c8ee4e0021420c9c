//! Gaia fan-out service: every bucket operation is applied to all of the
//! connections mapped to the bucket.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hestia_core::{
    hash_content, paginate, HestiaError, ListEntry, ListFilesResponse, ReadRequest, ReadResult,
    ReconciledView, Result, User,
};
use hestia_hub::HubClient;
use moka::future::Cache;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::connections::ConnectionService;
use crate::drivers::DriverRegistry;
use crate::index::{key, MetadataIndex};
use crate::store::Store;

/// Well-known file holding a bucket's revocation watermark.
pub const AUTH_TIMESTAMP_FILE: &str = "authTimestamp";

const AUTH_TIMESTAMP_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct HubInfoResponse {
    pub challenge_text: String,
    pub latest_auth_version: String,
    pub read_url_prefix: String,
}

/// Raise when nothing succeeded: the lone error as-is, otherwise an aggregate.
fn escalate(attempted: usize, mut errors: Vec<HestiaError>, message: &str) -> Result<Vec<HestiaError>> {
    if attempted == 0 || errors.len() < attempted {
        return Ok(errors);
    }
    if errors.len() == 1 {
        return Err(errors.remove(0));
    }
    Err(HestiaError::Multi {
        message: message.to_string(),
        errors,
    })
}

pub struct GaiaService {
    store: Arc<dyn Store>,
    index: MetadataIndex,
    drivers: Arc<DriverRegistry>,
    connections: Arc<ConnectionService>,
    auth_timestamps: Cache<String, DateTime<Utc>>,
    hub_client: HubClient,
    page_size: usize,
    /// Zero means unlimited
    max_blob_size: u64,
}

impl GaiaService {
    pub fn new(
        store: Arc<dyn Store>,
        index: MetadataIndex,
        drivers: Arc<DriverRegistry>,
        connections: Arc<ConnectionService>,
        page_size: usize,
        max_blob_size: u64,
    ) -> Self {
        Self {
            store,
            index,
            drivers,
            connections,
            auth_timestamps: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(AUTH_TIMESTAMP_TTL)
                .build(),
            hub_client: HubClient::new(),
            page_size: page_size.max(1),
            max_blob_size,
        }
    }

    /// Write to every connection mapped to `bucket`.
    ///
    /// Returns the per-connection failures when at least one write succeeded.
    #[instrument(skip(self, user, content), level = "debug", fields(address = %user.address, data_len = content.len()))]
    pub async fn store(
        &self,
        user: &mut User,
        bucket: &str,
        path: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<Vec<HestiaError>> {
        if self.max_blob_size > 0 && content.len() as u64 > self.max_blob_size {
            return Err(HestiaError::malformed(format!(
                "Blob of {} bytes exceeds the {} byte limit",
                content.len(),
                self.max_blob_size
            )));
        }

        let targets = user.connections_for(bucket);
        if targets.is_empty() {
            return Err(HestiaError::not_found(format!("No connection mapped to {}", bucket)));
        }
        let hash = hash_content(&content);

        let results = {
            let shared: &User = user;
            join_all(targets.iter().map(|conn| {
                self.connections.write_one(
                    shared,
                    conn,
                    bucket,
                    path,
                    content.clone(),
                    content_type,
                    &hash,
                )
            }))
            .await
        };

        let mut errors = Vec::new();
        let mut appended = Vec::new();
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(true) => appended.push(conn.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to write {}/{} to connection {}: {}", bucket, path, conn, e);
                    errors.push(e);
                }
            }
        }

        let mut errors = escalate(targets.len(), errors, "All connections failed to write!")?;

        if !appended.is_empty() {
            if let Err(e) = self.connections.append_bucket(user, &appended, bucket).await {
                warn!("Failed to persist bucket mapping for {}: {}", user.address, e);
                errors.push(e);
            }
        }

        debug!(
            "Stored {}/{} on {} of {} connections",
            bucket,
            path,
            targets.len() - errors.len().min(targets.len()),
            targets.len()
        );
        Ok(errors)
    }

    /// Serve the canonical content of a path from a random connection holding it.
    #[instrument(skip(self), level = "debug")]
    pub async fn read(&self, bucket: &str, path: &str) -> Result<(ReadResult, ReconciledView)> {
        let view = self.index.get_for_path(&key(bucket, path)).await?;
        let user = self.store.get_user_from_bucket(bucket).await?;

        let holders: Vec<&String> = view
            .conn_ids
            .iter()
            .filter(|c| {
                user.connections
                    .get(c.as_str())
                    .is_some_and(|conn| self.drivers.get(&conn.driver).is_ok())
            })
            .collect();
        let conn = holders
            .choose(&mut rand::rng())
            .copied()
            .ok_or_else(|| HestiaError::not_found(format!("No connection holds {}/{}", bucket, path)))?;

        let driver = self.drivers.get(&user.connection(conn)?.driver)?;
        let ctx = user.context_for(conn)?;
        let result = driver
            .perform_read(ReadRequest {
                path,
                bucket,
                ctx: &ctx,
            })
            .await?;

        let result = match result {
            ReadResult::Content { content_type, data } => ReadResult::Content {
                content_type: if view.content_type.is_empty() {
                    content_type
                } else {
                    view.content_type.clone()
                },
                data,
            },
            redirect => redirect,
        };
        Ok((result, view))
    }

    /// Canonical metadata of a live path.
    pub async fn metadata(&self, bucket: &str, path: &str) -> Result<ReconciledView> {
        self.index.get_for_path(&key(bucket, path)).await
    }

    /// Delete from every connection mapped to `bucket`. A connection reporting
    /// the file missing counts as deleted.
    #[instrument(skip(self, user), level = "debug", fields(address = %user.address))]
    pub async fn delete(&self, user: &User, bucket: &str, path: &str) -> Result<Vec<HestiaError>> {
        let full = key(bucket, path);
        self.index.get_for_path(&full).await?;

        let targets = user.connections_for(bucket);
        let full_ref = full.as_str();
        let results = join_all(targets.iter().map(|conn| async move {
            match self.connections.delete(user, conn, bucket, path).await {
                Err(e) if e.is_not_found() => self.index.tombstone(full_ref, conn, Utc::now()).await,
                other => other,
            }
        }))
        .await;

        let errors: Vec<HestiaError> = targets
            .iter()
            .zip(results)
            .filter_map(|(conn, r)| {
                r.err().inspect(|e| {
                    warn!("Failed to delete {} from connection {}: {}", full, conn, e);
                })
            })
            .collect();

        escalate(targets.len(), errors, "All connections failed to delete!")
    }

    /// Page through the canonical listing of a bucket. Names are relative to the bucket.
    pub async fn list_files(&self, bucket: &str, page: usize, extended: bool) -> Result<ListFilesResponse> {
        let prefix = format!("{}/", bucket);
        let entries: Vec<ListEntry> = self
            .index
            .get_for_bucket(bucket)
            .await?
            .into_values()
            .filter(|v| !v.tombstoned)
            .map(|v| {
                let name = v.path.strip_prefix(&prefix).unwrap_or(&v.path).to_string();
                if extended {
                    ListEntry::extended(name, v.size, Some(v.last_modified))
                } else {
                    ListEntry::Name(name)
                }
            })
            .collect();

        Ok(paginate(entries, page, self.page_size))
    }

    /// Revocation watermark of `bucket`: tokens issued before it are rejected.
    /// Anything unreadable yields the Unix epoch.
    pub async fn get_auth_timestamp(&self, bucket: &str) -> DateTime<Utc> {
        if let Some(at) = self.auth_timestamps.get(bucket).await {
            return at;
        }

        let at = match self.read_auth_timestamp(bucket).await {
            Ok(at) => at,
            Err(e) => {
                if !e.is_not_found() {
                    debug!("Unreadable auth timestamp for {}: {}", bucket, e);
                }
                DateTime::UNIX_EPOCH
            }
        };
        self.auth_timestamps.insert(bucket.to_string(), at).await;
        at
    }

    async fn read_auth_timestamp(&self, bucket: &str) -> Result<DateTime<Utc>> {
        let data = match self.read(bucket, AUTH_TIMESTAMP_FILE).await?.0 {
            ReadResult::Content { data, .. } => data,
            ReadResult::Redirect { url } => self.hub_client.fetch(&url).await?.1,
        };
        let text = std::str::from_utf8(&data)
            .map_err(|e| HestiaError::malformed(format!("Auth timestamp is not UTF-8: {}", e)))?;
        let secs: f64 = text
            .trim()
            .parse()
            .map_err(|_| HestiaError::malformed(format!("Invalid auth timestamp \"{}\"", text.trim())))?;
        DateTime::from_timestamp(secs.floor() as i64, 0)
            .ok_or_else(|| HestiaError::malformed(format!("Auth timestamp out of range: {}", secs)))
    }

    /// Write a new revocation watermark through every mapped connection.
    pub async fn set_auth_timestamp(
        &self,
        user: &mut User,
        bucket: &str,
        seconds: i64,
    ) -> Result<Vec<HestiaError>> {
        let at = DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| HestiaError::malformed(format!("Timestamp out of range: {}", seconds)))?;
        let errors = self
            .store(
                user,
                bucket,
                AUTH_TIMESTAMP_FILE,
                Bytes::from(seconds.to_string()),
                "text/plain; charset=UTF-8",
            )
            .await?;
        self.auth_timestamps.insert(bucket.to_string(), at).await;
        Ok(errors)
    }

    pub fn hub_info(&self, origin: &str, server_name: &str) -> HubInfoResponse {
        let challenge = serde_json::json!(["hestia", "0", server_name, "blockstack_storage_please_sign"]);
        HubInfoResponse {
            challenge_text: challenge.to_string(),
            latest_auth_version: "v1".to_string(),
            read_url_prefix: format!("{}/gaia/read/", origin.trim_end_matches('/')),
        }
    }
}
