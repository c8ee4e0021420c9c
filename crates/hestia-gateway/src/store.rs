//! Persistence collaborator: users, metadata rows and driver key-value tables.
//!
//! `MemoryStore` keeps everything in concurrent maps. When opened with a
//! snapshot path it loads the snapshot on startup and `flush` rewrites it
//! atomically whenever something changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use hestia_core::{HestiaError, KeyValueStore, MetadataEntry, Result, User};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, instrument};

/// Users, metadata rows and namespaced key-value tables.
///
/// Metadata rows are keyed by full path (`bucket/remainder`) and, within one
/// path, returned in the order they were last written.
#[async_trait]
pub trait Store: KeyValueStore {
    async fn get_user(&self, address: &str) -> Result<User>;

    /// User owning `bucket`: by address, internal bucket, then mirrored buckets.
    async fn get_user_from_bucket(&self, bucket: &str) -> Result<User>;

    async fn get_all_users(&self) -> Result<Vec<User>>;

    /// Fails with `NotAllowed` if the address is taken.
    async fn register_user(&self, user: &User) -> Result<()>;

    async fn update_user(&self, user: &User) -> Result<()>;

    async fn delete_user(&self, address: &str) -> Result<()>;

    /// Replace a connection's bucket set and drop its rows outside those buckets.
    async fn update_connection_buckets(
        &self,
        address: &str,
        connection_id: &str,
        buckets: &[String],
    ) -> Result<()>;

    async fn rows_for_path(&self, path: &str) -> Result<Vec<MetadataEntry>>;

    async fn rows_with_prefix(&self, prefix: &str) -> Result<Vec<(String, MetadataEntry)>>;

    async fn rows_for_connection(
        &self,
        connection_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, MetadataEntry)>>;

    /// Insert or replace the row for `(path, entry.connection_id)`.
    async fn upsert_row(&self, path: &str, entry: MetadataEntry) -> Result<()>;

    async fn delete_rows_for_connection(&self, connection_id: &str) -> Result<usize>;

    /// Drop every path whose rows are all tombstones. Returns the number of paths dropped.
    async fn compact_tombstones(&self) -> Result<usize>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    users: BTreeMap<String, User>,
    #[serde(default)]
    metadata: BTreeMap<String, Vec<MetadataEntry>>,
    #[serde(default)]
    kv: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    /// path -> rows in last-write order
    metadata: DashMap<String, Vec<MetadataEntry>>,
    /// (namespace, key) -> value
    kv: DashMap<(String, String), serde_json::Value>,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a JSON snapshot, loading it if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            snapshot_path: Some(path.clone()),
            ..Self::default()
        };

        match fs::read(&path).await {
            Ok(raw) => {
                let snapshot: Snapshot = serde_json::from_slice(&raw)?;
                info!(
                    "Loaded snapshot {} ({} users, {} paths)",
                    path.display(),
                    snapshot.users.len(),
                    snapshot.metadata.len()
                );
                for (address, user) in snapshot.users {
                    store.users.insert(address, user);
                }
                for (p, rows) in snapshot.metadata {
                    store.metadata.insert(p, rows);
                }
                for (ns, table) in snapshot.kv {
                    for (k, v) in table {
                        store.kv.insert((ns.clone(), k), v);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
            }
            Err(e) => {
                return Err(HestiaError::Io(format!(
                    "Failed to read snapshot {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        Ok(store)
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> Snapshot {
        let mut snap = Snapshot::default();
        for e in self.users.iter() {
            snap.users.insert(e.key().clone(), e.value().clone());
        }
        for e in self.metadata.iter() {
            snap.metadata.insert(e.key().clone(), e.value().clone());
        }
        for e in self.kv.iter() {
            let (ns, k) = e.key();
            snap.kv
                .entry(ns.clone())
                .or_default()
                .insert(k.clone(), e.value().clone());
        }
        snap
    }

    /// Write the snapshot if anything changed since the last flush.
    /// Returns whether a write happened.
    #[instrument(skip(self), level = "debug")]
    pub async fn flush(&self) -> Result<bool> {
        let Some(path) = &self.snapshot_path else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let data = match serde_json::to_vec(&self.snapshot()) {
            Ok(d) => d,
            Err(e) => {
                self.touch();
                return Err(e.into());
            }
        };

        if let Err(e) = write_atomic(path, &data).await {
            self.touch();
            return Err(e);
        }

        debug!("Flushed snapshot ({} bytes) to {}", data.len(), path.display());
        Ok(true)
    }
}

async fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = target.with_extension("json.tmp");
    fs::write(&temp_path, data).await.map_err(|e| {
        HestiaError::Io(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    fs::rename(&temp_path, target).await.map_err(|e| {
        HestiaError::Io(format!(
            "Failed to rename temp file to {}: {}",
            target.display(),
            e
        ))
    })
}

fn user_not_found(what: &str) -> HestiaError {
    HestiaError::not_found(format!("No user found for \"{}\"", what))
}

fn in_buckets(path: &str, buckets: &[String]) -> bool {
    buckets.iter().any(|b| {
        path.strip_prefix(b.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn kv_get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .kv
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn kv_set(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.kv
            .insert((namespace.to_string(), key.to_string()), value);
        self.touch();
        Ok(())
    }

    async fn kv_delete(&self, namespace: &str, key: &str) -> Result<()> {
        if self
            .kv
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some()
        {
            self.touch();
        }
        Ok(())
    }

    async fn kv_get_all(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let mut out: Vec<(String, serde_json::Value)> = self
            .kv
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, address: &str) -> Result<User> {
        self.users
            .get(address)
            .map(|u| u.value().clone())
            .ok_or_else(|| user_not_found(address))
    }

    async fn get_user_from_bucket(&self, bucket: &str) -> Result<User> {
        if let Some(u) = self.users.get(bucket) {
            return Ok(u.value().clone());
        }
        if let Some(u) = self
            .users
            .iter()
            .find(|u| u.internal_bucket_address.as_deref() == Some(bucket))
        {
            return Ok(u.value().clone());
        }
        self.users
            .iter()
            .find(|u| {
                u.connections
                    .values()
                    .any(|c| c.buckets.iter().any(|b| b == bucket))
            })
            .map(|u| u.value().clone())
            .ok_or_else(|| user_not_found(bucket))
    }

    async fn get_all_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(users)
    }

    async fn register_user(&self, user: &User) -> Result<()> {
        match self.users.entry(user.address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HestiaError::not_allowed(format!(
                "User {} is already registered",
                user.address
            ))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(user.clone());
                self.touch();
                Ok(())
            }
        }
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        match self.users.get_mut(&user.address) {
            Some(mut existing) => {
                *existing = user.clone();
                self.touch();
                Ok(())
            }
            None => Err(user_not_found(&user.address)),
        }
    }

    async fn delete_user(&self, address: &str) -> Result<()> {
        self.users
            .remove(address)
            .ok_or_else(|| user_not_found(address))?;
        self.touch();
        Ok(())
    }

    async fn update_connection_buckets(
        &self,
        address: &str,
        connection_id: &str,
        buckets: &[String],
    ) -> Result<()> {
        {
            let mut user = self
                .users
                .get_mut(address)
                .ok_or_else(|| user_not_found(address))?;
            user.connection_mut(connection_id)?.buckets = buckets.to_vec();
        }

        let mut pruned = 0;
        self.metadata.retain(|path, rows| {
            if !in_buckets(path, buckets) {
                let before = rows.len();
                rows.retain(|r| r.connection_id != connection_id);
                pruned += before - rows.len();
            }
            !rows.is_empty()
        });
        self.touch();

        debug!(
            "Connection {} now mirrors {:?} ({} rows pruned)",
            connection_id, buckets, pruned
        );
        Ok(())
    }

    async fn rows_for_path(&self, path: &str) -> Result<Vec<MetadataEntry>> {
        Ok(self
            .metadata
            .get(path)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }

    async fn rows_with_prefix(&self, prefix: &str) -> Result<Vec<(String, MetadataEntry)>> {
        let mut out = Vec::new();
        for e in self.metadata.iter().filter(|e| e.key().starts_with(prefix)) {
            for row in e.value() {
                out.push((e.key().clone(), row.clone()));
            }
        }
        Ok(out)
    }

    async fn rows_for_connection(
        &self,
        connection_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, MetadataEntry)>> {
        let prefix = prefix.unwrap_or("");
        let mut out = Vec::new();
        for e in self.metadata.iter().filter(|e| e.key().starts_with(prefix)) {
            if let Some(row) = e.value().iter().find(|r| r.connection_id == connection_id) {
                out.push((e.key().clone(), row.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn upsert_row(&self, path: &str, entry: MetadataEntry) -> Result<()> {
        let mut rows = self.metadata.entry(path.to_string()).or_default();
        rows.retain(|r| r.connection_id != entry.connection_id);
        rows.push(entry);
        drop(rows);
        self.touch();
        Ok(())
    }

    async fn delete_rows_for_connection(&self, connection_id: &str) -> Result<usize> {
        let mut removed = 0;
        self.metadata.retain(|_, rows| {
            let before = rows.len();
            rows.retain(|r| r.connection_id != connection_id);
            removed += before - rows.len();
            !rows.is_empty()
        });
        if removed > 0 {
            self.touch();
        }
        Ok(removed)
    }

    async fn compact_tombstones(&self) -> Result<usize> {
        let mut dropped = 0;
        self.metadata.retain(|_, rows| {
            let dead = rows.iter().all(|r| r.is_tombstone());
            if dead {
                dropped += 1;
            }
            !dead
        });
        if dropped > 0 {
            self.touch();
        }
        Ok(dropped)
    }
}
