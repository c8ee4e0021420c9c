//! Read-repair: copy canonical content to connections that lag behind it and
//! propagate deletions to connections that still hold a deleted path.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashSet;
use hestia_core::{HestiaError, ReadResult, Result, User};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::connections::ConnectionService;
use crate::index::MetadataIndex;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Lagging copies rewritten with the canonical content
    pub repaired: usize,
    /// Deletions propagated
    pub deleted: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for SyncReport {
    fn add_assign(&mut self, other: Self) {
        self.repaired += other.repaired;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Marks an address as being synced for as long as it lives.
struct WorkingGuard {
    set: Arc<DashSet<String>>,
    address: String,
}

impl WorkingGuard {
    fn acquire(set: &Arc<DashSet<String>>, address: &str) -> Option<Self> {
        set.insert(address.to_string()).then(|| Self {
            set: set.clone(),
            address: address.to_string(),
        })
    }
}

impl Drop for WorkingGuard {
    fn drop(&mut self) {
        self.set.remove(&self.address);
    }
}

pub struct SyncService {
    store: Arc<dyn Store>,
    index: MetadataIndex,
    connections: Arc<ConnectionService>,
    working: Arc<DashSet<String>>,
    /// Addresses fully synced on demand since the last sweep
    worked: DashSet<String>,
}

impl SyncService {
    pub fn new(store: Arc<dyn Store>, index: MetadataIndex, connections: Arc<ConnectionService>) -> Self {
        Self {
            store,
            index,
            connections,
            working: Arc::new(DashSet::new()),
            worked: DashSet::new(),
        }
    }

    pub fn is_working(&self, address: &str) -> bool {
        self.working.contains(address)
    }

    /// Bring every lagging connection of `user` (or only `only`) up to date.
    #[instrument(skip(self, user), fields(address = %user.address))]
    pub async fn work(&self, mut user: User, only: Option<&str>) -> SyncReport {
        let mut report = SyncReport::default();

        for bucket in user.buckets() {
            let mapped: Vec<String> = user
                .connections_for(&bucket)
                .into_iter()
                .filter(|c| only.is_none_or(|o| o == c.as_str()))
                .collect();
            if mapped.is_empty() {
                continue;
            }

            let (views, expanded) = match tokio::try_join!(
                self.index.get_for_bucket(&bucket),
                self.index.get_expanded_for_bucket(&bucket)
            ) {
                Ok(v) => v,
                Err(e) => {
                    error!("Cannot load index of bucket {}: {}", bucket, e);
                    report.failed += 1;
                    continue;
                }
            };

            let prefix = format!("{}/", bucket);
            for (full, view) in views {
                let Some(path) = full.strip_prefix(&prefix) else {
                    continue;
                };
                let lagging: Vec<&String> = mapped.iter().filter(|c| !view.holds(c)).collect();
                if lagging.is_empty() {
                    continue;
                }

                if view.tombstoned {
                    let rows = expanded.get(&full);
                    for conn in lagging {
                        let live = rows
                            .and_then(|r| r.get(conn.as_str()))
                            .is_some_and(|e| !e.is_tombstone());
                        if !live {
                            continue;
                        }
                        match self.propagate_delete(&user, conn, &bucket, path, &full).await {
                            Ok(()) => report.deleted += 1,
                            Err(e) => {
                                warn!("Failed to delete {} from connection {}: {}", full, conn, e);
                                report.failed += 1;
                            }
                        }
                    }
                    continue;
                }

                let Some(content) = self.fetch(&user, &view.conn_ids, &bucket, path).await else {
                    warn!("No connection could serve {} for repair", full);
                    report.failed += lagging.len();
                    continue;
                };

                for conn in lagging {
                    match self
                        .connections
                        .store(&mut user, conn, &bucket, path, content.clone(), &view.content_type)
                        .await
                    {
                        Ok(()) => {
                            debug!("Repaired {} on connection {}", full, conn);
                            report.repaired += 1;
                        }
                        Err(e) => {
                            warn!("Failed to repair {} on connection {}: {}", full, conn, e);
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            "Sync of {} done: {} repaired, {} deleted, {} failed",
            user.address, report.repaired, report.deleted, report.failed
        );
        report
    }

    async fn propagate_delete(
        &self,
        user: &User,
        conn: &str,
        bucket: &str,
        path: &str,
        full: &str,
    ) -> Result<()> {
        match self.connections.delete(user, conn, bucket, path).await {
            Err(e) if e.is_not_found() => self.index.tombstone(full, conn, Utc::now()).await,
            other => other,
        }
    }

    /// Content of a path from the first holder that streams it back.
    async fn fetch(&self, user: &User, holders: &[String], bucket: &str, path: &str) -> Option<Bytes> {
        for holder in holders {
            match self.connections.read(user, holder, bucket, path).await {
                Ok((ReadResult::Content { data, .. }, _)) => return Some(data),
                Ok((ReadResult::Redirect { .. }, _)) => {
                    debug!("Connection {} redirects reads, trying next holder", holder);
                }
                Err(e) => warn!("Failed to read {}/{} from {}: {}", bucket, path, holder, e),
            }
        }
        None
    }

    /// Start a background sync of one user, optionally restricted to one connection.
    ///
    /// A full sync lets the next sweep skip the user.
    pub async fn start(self: &Arc<Self>, address: &str, connection_id: Option<String>) -> Result<()> {
        let user = self.store.get_user(address).await?;
        if let Some(conn) = &connection_id {
            user.connection(conn)?;
        }
        let guard = WorkingGuard::acquire(&self.working, address)
            .ok_or_else(|| HestiaError::not_allowed(format!("Already syncing {}", address)))?;

        if connection_id.is_none() {
            self.worked.insert(address.to_string());
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.work(user, connection_id.as_deref()).await;
        });
        Ok(())
    }

    /// Sync every user not fully synced on demand since the last sweep nor
    /// currently syncing, then compact the index.
    pub async fn sweep(&self) -> Result<SyncReport> {
        let users: Vec<User> = self
            .store
            .get_all_users()
            .await?
            .into_iter()
            .filter(|u| !self.worked.contains(&u.address) && !self.is_working(&u.address))
            .collect();
        self.worked.clear();

        let mut total = SyncReport::default();
        for user in users {
            let Some(_guard) = WorkingGuard::acquire(&self.working, &user.address) else {
                continue;
            };
            total += self.work(user, None).await;
        }

        if let Err(e) = self.index.compact().await {
            error!("Index compaction failed: {}", e);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hestia_core::{Connection, DriverApi};

    use crate::drivers::{DriverConfig, DriverRegistry, MemoryDriver};
    use crate::index::key;
    use crate::store::MemoryStore;

    struct Fixture {
        sync: Arc<SyncService>,
        connections: Arc<ConnectionService>,
        index: MetadataIndex,
        store: Arc<MemoryStore>,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut registry = DriverRegistry::new();
        for id in ["m1", "m2"] {
            registry
                .register_driver(
                    id,
                    &DriverConfig::new("memory"),
                    Box::new(MemoryDriver::new()),
                    DriverApi::new(id, "http://localhost", store.clone()),
                )
                .await
                .unwrap();
        }
        let index = MetadataIndex::new(store.clone());
        let connections = Arc::new(ConnectionService::new(
            store.clone(),
            index.clone(),
            Arc::new(registry),
            50,
        ));
        let sync = Arc::new(SyncService::new(store.clone(), index.clone(), connections.clone()));

        let mut user = User::new("alice");
        user.connections.insert("A".into(), Connection::new("m1", "A", "alice"));
        user.connections.insert("B".into(), Connection::new("m2", "B", "alice"));
        user.default_connection = "A".into();
        store.register_user(&user).await.unwrap();

        Fixture { sync, connections, index, store }
    }

    #[tokio::test]
    async fn test_repair_copies_to_lagging_connection() {
        let fx = setup().await;
        let mut user = fx.store.get_user("alice").await.unwrap();
        fx.connections
            .store(&mut user, "A", "alice", "f", Bytes::from_static(b"data"), "text/plain")
            .await
            .unwrap();

        let report = fx.sync.work(user.clone(), None).await;
        assert_eq!(report, SyncReport { repaired: 1, deleted: 0, failed: 0 });

        let view = fx.index.get_for_path(&key("alice", "f")).await.unwrap();
        assert_eq!(view.conn_ids, vec!["A", "B"]);

        let (result, _) = fx.connections.read(&user, "B", "alice", "f").await.unwrap();
        assert!(matches!(result, ReadResult::Content { data, .. } if data == Bytes::from_static(b"data")));

        // converged: nothing left to do
        assert_eq!(fx.sync.work(user, None).await, SyncReport::default());
    }

    #[tokio::test]
    async fn test_tombstone_propagates() {
        let fx = setup().await;
        let mut user = fx.store.get_user("alice").await.unwrap();
        for conn in ["A", "B"] {
            fx.connections
                .store(&mut user, conn, "alice", "f", Bytes::from_static(b"x"), "text/plain")
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.connections.delete(&user, "A", "alice", "f").await.unwrap();

        let report = fx.sync.work(user.clone(), None).await;
        assert_eq!(report.deleted, 1);
        assert!(fx.index.get_for_path_on("alice/f", "B").await.unwrap().is_tombstone());
        assert!(fx.connections.read(&user, "B", "alice", "f").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_restricted_to_one_connection() {
        let fx = setup().await;
        let mut user = fx.store.get_user("alice").await.unwrap();
        fx.connections
            .store(&mut user, "A", "alice", "f", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();

        assert_eq!(fx.sync.work(user.clone(), Some("A")).await, SyncReport::default());
        assert_eq!(fx.sync.work(user, Some("B")).await.repaired, 1);
    }

    #[tokio::test]
    async fn test_start_is_single_flight() {
        let fx = setup().await;
        assert!(fx
            .sync
            .start("alice", Some("nope".into()))
            .await
            .unwrap_err()
            .is_not_found());

        let guard = WorkingGuard::acquire(&fx.sync.working, "alice").unwrap();
        assert!(fx.sync.is_working("alice"));
        let err = fx.sync.start("alice", None).await.unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));
        drop(guard);

        fx.sync.start("alice", None).await.unwrap();
        for _ in 0..50 {
            if !fx.sync.is_working("alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.sync.is_working("alice"));
    }

    #[tokio::test]
    async fn test_sweep_repairs_and_compacts() {
        let fx = setup().await;
        let mut user = fx.store.get_user("alice").await.unwrap();
        fx.connections
            .store(&mut user, "A", "alice", "f", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        fx.index.tombstone("alice/gone", "A", Utc::now()).await.unwrap();

        let report = fx.sync.sweep().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert!(fx.index.get_expanded_for_bucket("alice").await.unwrap().get("alice/gone").is_none());
    }

    #[tokio::test]
    async fn test_consecutive_sweeps_each_repair() {
        let fx = setup().await;
        let mut user = fx.store.get_user("alice").await.unwrap();
        fx.connections
            .store(&mut user, "A", "alice", "f1", Bytes::from_static(b"one"), "text/plain")
            .await
            .unwrap();
        assert_eq!(fx.sync.sweep().await.unwrap().repaired, 1);

        fx.connections
            .store(&mut user, "A", "alice", "f2", Bytes::from_static(b"two"), "text/plain")
            .await
            .unwrap();
        assert_eq!(fx.sync.sweep().await.unwrap().repaired, 1);
        assert_eq!(
            fx.index.get_for_path(&key("alice", "f2")).await.unwrap().conn_ids,
            vec!["A", "B"]
        );
    }

    #[tokio::test]
    async fn test_sweep_skips_user_synced_on_demand_once() {
        let fx = setup().await;
        fx.sync.start("alice", None).await.unwrap();
        for _ in 0..50 {
            if !fx.sync.is_working("alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.sync.is_working("alice"));

        let mut user = fx.store.get_user("alice").await.unwrap();
        fx.connections
            .store(&mut user, "A", "alice", "f", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();

        assert_eq!(fx.sync.sweep().await.unwrap(), SyncReport::default());
        assert_eq!(fx.sync.sweep().await.unwrap().repaired, 1);
    }

    #[tokio::test]
    async fn test_restricted_start_does_not_skip_sweep() {
        let fx = setup().await;
        let mut user = fx.store.get_user("alice").await.unwrap();
        fx.sync.start("alice", Some("A".into())).await.unwrap();
        for _ in 0..50 {
            if !fx.sync.is_working("alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fx.connections
            .store(&mut user, "A", "alice", "f", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();

        assert_eq!(fx.sync.sweep().await.unwrap().repaired, 1);
    }
}
