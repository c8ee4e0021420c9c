//! Single-connection operations: read, write, delete and list through one
//! driver, plus management of a user's connection registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use hestia_core::{
    hash_content, paginate, ConnectionContext, DeleteRequest, Driver, DriverSpaceInfo, HestiaError,
    MetadataEntry, PageResult, ReadRequest, ReadResult, RegisterOutcome, RegisterRequest, Result,
    User, WriteRequest,
};
use tracing::{debug, info, instrument, warn};

use crate::drivers::DriverRegistry;
use crate::index::{key, MetadataIndex};
use crate::store::Store;

/// Outcome of a connection registration request.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// The driver needs the user to visit `uri` first
    Redirect {
        uri: String,
        headers: BTreeMap<String, String>,
    },
    Connected {
        address: String,
        connection_id: String,
    },
}

pub struct ConnectionService {
    store: Arc<dyn Store>,
    index: MetadataIndex,
    drivers: Arc<DriverRegistry>,
    page_size: usize,
}

impl ConnectionService {
    pub fn new(
        store: Arc<dyn Store>,
        index: MetadataIndex,
        drivers: Arc<DriverRegistry>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            index,
            drivers,
            page_size: page_size.max(1),
        }
    }

    fn resolve(&self, user: &User, connection_id: &str) -> Result<(Arc<dyn Driver>, ConnectionContext)> {
        let conn = user.connection(connection_id)?;
        let driver = self.drivers.get(&conn.driver)?;
        Ok((driver, user.context_for(connection_id)?))
    }

    /// Write already-hashed content to one connection and record it in the
    /// index. Returns true when the connection does not list `bucket` yet.
    #[instrument(skip(self, user, content), level = "debug", fields(data_len = content.len()))]
    pub(crate) async fn write_one(
        &self,
        user: &User,
        connection_id: &str,
        bucket: &str,
        path: &str,
        content: Bytes,
        content_type: &str,
        hash: &str,
    ) -> Result<bool> {
        let conn = user.connection(connection_id)?;
        if bucket != user.address && self.drivers.is_root_only(&conn.driver) {
            return Err(HestiaError::not_allowed(format!(
                "Connection {} only mirrors the root bucket",
                connection_id
            )));
        }

        let (driver, ctx) = self.resolve(user, connection_id)?;
        let size = content.len() as u64;
        driver
            .perform_write(WriteRequest {
                path,
                bucket,
                content_type,
                content,
                ctx: &ctx,
            })
            .await?;

        self.index
            .update(&key(bucket, path), connection_id, content_type, size, hash, Utc::now())
            .await?;

        Ok(!conn.buckets.iter().any(|b| b == bucket))
    }

    /// Read straight from one connection, without checking that it holds the
    /// canonical content.
    pub async fn read(
        &self,
        user: &User,
        connection_id: &str,
        bucket: &str,
        path: &str,
    ) -> Result<(ReadResult, Option<MetadataEntry>)> {
        let (driver, ctx) = self.resolve(user, connection_id)?;
        let result = driver
            .perform_read(ReadRequest {
                path,
                bucket,
                ctx: &ctx,
            })
            .await?;
        let entry = match self.index.get_for_path_on(&key(bucket, path), connection_id).await {
            Ok(e) => Some(e),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Ok((result, entry))
    }

    #[instrument(skip(self, user, content), level = "debug", fields(address = %user.address, data_len = content.len()))]
    pub async fn store(
        &self,
        user: &mut User,
        connection_id: &str,
        bucket: &str,
        path: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<()> {
        let hash = hash_content(&content);
        let append = self
            .write_one(user, connection_id, bucket, path, content, content_type, &hash)
            .await?;

        if append {
            self.append_bucket(user, &[connection_id.to_string()], bucket)
                .await?;
        }
        Ok(())
    }

    /// Map `bucket` onto `connection_ids` in the latest stored copy of the
    /// user, then refresh `user` from it.
    pub async fn append_bucket(
        &self,
        user: &mut User,
        connection_ids: &[String],
        bucket: &str,
    ) -> Result<()> {
        let mut latest = self.store.get_user(&user.address).await?;
        let mut changed = false;
        for id in connection_ids {
            if let Ok(conn) = latest.connection_mut(id) {
                if conn.add_bucket(bucket) {
                    info!("Connection {} now mirrors bucket {}", id, bucket);
                    changed = true;
                }
            }
        }
        if changed {
            self.store.update_user(&latest).await?;
        }
        *user = latest;
        Ok(())
    }

    #[instrument(skip(self, user), level = "debug", fields(address = %user.address))]
    pub async fn delete(&self, user: &User, connection_id: &str, bucket: &str, path: &str) -> Result<()> {
        let (driver, ctx) = self.resolve(user, connection_id)?;
        driver
            .perform_delete(DeleteRequest {
                path,
                bucket,
                ctx: &ctx,
            })
            .await?;
        self.index
            .tombstone(&key(bucket, path), connection_id, Utc::now())
            .await
    }

    /// Page through the index rows of one connection. Names are relative to
    /// `bucket` when one is given, full paths otherwise.
    pub async fn list_files(
        &self,
        user: &User,
        connection_id: &str,
        bucket: Option<&str>,
        page: usize,
    ) -> Result<PageResult<String>> {
        user.connection(connection_id)?;
        let rows = self.index.get_for_connection(connection_id, bucket).await?;
        let strip = bucket.map(|b| format!("{}/", b)).unwrap_or_default();

        let names: Vec<String> = rows
            .into_iter()
            .filter(|(_, e)| !e.is_tombstone())
            .map(|(p, _)| p.strip_prefix(&strip).unwrap_or(&p).to_string())
            .collect();

        Ok(paginate(names, page, self.page_size))
    }

    pub async fn get_info(&self, user: &User, connection_id: &str) -> Result<DriverSpaceInfo> {
        let (driver, ctx) = self.resolve(user, connection_id)?;
        driver.get_info(&ctx).await
    }

    /// Remove a connection. Refuses to remove the last connection, or the last
    /// one that is not root-only when it is not root-only itself.
    #[instrument(skip(self, user), fields(address = %user.address))]
    pub async fn delete_connection(&self, user: &mut User, connection_id: &str) -> Result<()> {
        let removed_root_only = self.drivers.is_root_only(&user.connection(connection_id)?.driver);
        if user.connections.len() <= 1 {
            return Err(HestiaError::not_allowed("Cannot remove the last connection"));
        }

        let others: Vec<(&String, bool)> = user
            .connections
            .iter()
            .filter(|(id, _)| id.as_str() != connection_id)
            .map(|(id, c)| (id, self.drivers.is_root_only(&c.driver)))
            .collect();
        let replacement = match others.iter().find(|(_, root_only)| !root_only) {
            Some((id, _)) => (*id).clone(),
            None if removed_root_only => match others.first() {
                Some((id, _)) => (*id).clone(),
                None => return Err(HestiaError::not_allowed("Cannot remove the last connection")),
            },
            None => {
                return Err(HestiaError::not_allowed(
                    "Cannot remove the last non-root-only connection",
                ))
            }
        };

        match self.resolve(user, connection_id) {
            Ok((driver, ctx)) => {
                if let Err(e) = driver.unregister(&ctx).await {
                    warn!("Error unregistering connection {}: {}", connection_id, e);
                }
            }
            Err(e) => warn!("Cannot unregister connection {}: {}", connection_id, e),
        }

        user.connections.remove(connection_id);
        if user.default_connection == connection_id {
            user.default_connection = replacement;
        }

        self.index.delete_all_for_connection(connection_id).await?;
        self.store.update_user(user).await?;

        info!("Removed connection {} from {}", connection_id, user.address);
        Ok(())
    }

    pub async fn set_default(&self, user: &mut User, connection_id: &str) -> Result<()> {
        let conn = user.connection(connection_id)?;
        self.drivers.info(&conn.driver).map_err(|_| {
            HestiaError::not_allowed(format!("Driver \"{}\" is not loaded", conn.driver))
        })?;
        if self.drivers.is_root_only(&conn.driver) {
            return Err(HestiaError::not_allowed(
                "A root-only connection cannot be the default",
            ));
        }

        user.default_connection = connection_id.to_string();
        self.store.update_user(user).await
    }

    /// Replace the buckets a connection mirrors. The user's own address is
    /// always kept, first.
    pub async fn set_buckets(
        &self,
        user: &mut User,
        connection_id: &str,
        addresses: Vec<String>,
    ) -> Result<()> {
        let conn = user.connection(connection_id)?;
        if self.drivers.is_root_only(&conn.driver) {
            return Err(HestiaError::not_allowed(
                "Cannot edit the buckets of a root-only connection",
            ));
        }

        let mut buckets = vec![user.address.clone()];
        for a in addresses {
            if !a.is_empty() && !buckets.contains(&a) {
                buckets.push(a);
            }
        }

        self.store
            .update_connection_buckets(&user.address, connection_id, &buckets)
            .await?;
        user.connection_mut(connection_id)?.buckets = buckets;
        debug!("Connection {} buckets updated", connection_id);
        Ok(())
    }

    /// Attach a finished registration to `user` and persist it, creating the
    /// user record on first registration.
    pub async fn add_connection(
        &self,
        user: &mut User,
        driver_id: &str,
        userdata: serde_json::Value,
    ) -> Result<String> {
        let id = self.drivers.attach(user, driver_id, userdata).await?;
        match self.store.update_user(user).await {
            Err(e) if e.is_not_found() => self.store.register_user(user).await?,
            other => other?,
        }
        info!("Added connection {} ({}) for {}", id, driver_id, user.address);
        Ok(id)
    }

    /// Drive one step of a driver's registration flow.
    pub async fn register_connection(
        &self,
        address: Option<&str>,
        driver_id: &str,
        redirect_uri: Option<&str>,
        req: Option<&RegisterRequest>,
    ) -> Result<Registration> {
        let driver = self.drivers.get(driver_id)?;

        let existing = match address {
            Some(a) => match self.store.get_user(a).await {
                Ok(u) => Some(u),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        let ctx = match (&existing, address) {
            (Some(u), _) => Some(ConnectionContext {
                internal_bucket_address: u.internal_bucket_address.clone(),
                ..ConnectionContext::unconnected(&u.address)
            }),
            (None, Some(a)) => Some(ConnectionContext::unconnected(a)),
            (None, None) => None,
        };

        match driver.register(ctx.as_ref(), redirect_uri, req).await? {
            RegisterOutcome::Redirect { uri, headers } => Ok(Registration::Redirect { uri, headers }),
            RegisterOutcome::Finish { address, userdata } => {
                let mut user = match existing.filter(|u| u.address == address) {
                    Some(u) => u,
                    None => match self.store.get_user(&address).await {
                        Ok(u) => u,
                        Err(e) if e.is_not_found() => User::new(address.as_str()),
                        Err(e) => return Err(e),
                    },
                };
                let connection_id = self.add_connection(&mut user, driver_id, userdata).await?;
                Ok(Registration::Connected {
                    address,
                    connection_id,
                })
            }
        }
    }

    /// Unregister every connection from its driver, drop their metadata and
    /// delete the user.
    #[instrument(skip(self, user), fields(address = %user.address))]
    pub async fn unregister_user(&self, user: &User) -> Result<()> {
        for id in user.connections.keys() {
            match self.resolve(user, id) {
                Ok((driver, ctx)) => {
                    if let Err(e) = driver.unregister(&ctx).await {
                        warn!("Error unregistering connection {}: {}", id, e);
                    }
                }
                Err(e) => warn!("Cannot unregister connection {}: {}", id, e),
            }
            self.index.delete_all_for_connection(id).await?;
        }

        self.store.delete_user(&user.address).await?;
        info!("Unregistered user {}", user.address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hestia_core::{Connection, DriverApi};

    use crate::drivers::{DriverConfig, MemoryDriver};
    use crate::store::MemoryStore;

    struct Fixture {
        service: ConnectionService,
        store: Arc<MemoryStore>,
        index: MetadataIndex,
    }

    /// Registry with a plain memory driver `mem` and root-only ones `root` and `root2`.
    async fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut registry = DriverRegistry::new();
        for (id, root_only) in [("mem", false), ("root", true), ("root2", true)] {
            let cfg = DriverConfig {
                root_only,
                ..DriverConfig::new("memory")
            };
            let api = DriverApi::new(id, "http://localhost", store.clone());
            registry
                .register_driver(id, &cfg, Box::new(MemoryDriver::new()), api)
                .await
                .unwrap();
        }

        let index = MetadataIndex::new(store.clone());
        let service = ConnectionService::new(store.clone(), index.clone(), Arc::new(registry), 50);
        Fixture { service, store, index }
    }

    async fn user(fx: &Fixture, conns: &[(&str, &str)]) -> User {
        let mut user = User::new("alice");
        for (id, driver) in conns {
            user.connections
                .insert(id.to_string(), Connection::new(*driver, *id, "alice"));
        }
        user.default_connection = conns[0].0.to_string();
        fx.store.register_user(&user).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_store_read_round_trip() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem")]).await;

        fx.service
            .store(&mut u, "c1", "alice", "notes/a.txt", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();

        let (result, entry) = fx.service.read(&u, "c1", "alice", "notes/a.txt").await.unwrap();
        assert_eq!(
            result,
            ReadResult::Content {
                content_type: "text/plain".into(),
                data: Bytes::from_static(b"hello")
            }
        );
        let entry = entry.unwrap();
        assert_eq!(entry.hash(), hash_content(b"hello"));
        assert_eq!(entry.size(), 5);
    }

    #[tokio::test]
    async fn test_first_write_to_bucket_appends_it() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem")]).await;

        fx.service
            .store(&mut u, "c1", "app1", "x", Bytes::from_static(b"1"), "text/plain")
            .await
            .unwrap();

        assert_eq!(u.connections["c1"].buckets, vec!["alice", "app1"]);
        let saved = fx.store.get_user("alice").await.unwrap();
        assert_eq!(saved.connections["c1"].buckets, vec!["alice", "app1"]);
    }

    #[tokio::test]
    async fn test_root_only_rejects_app_bucket() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem"), ("r", "root")]).await;

        let err = fx
            .service
            .store(&mut u, "r", "app1", "x", Bytes::from_static(b"1"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem")]).await;
        fx.service
            .store(&mut u, "c1", "alice", "f", Bytes::from_static(b"1"), "text/plain")
            .await
            .unwrap();

        fx.service.delete(&u, "c1", "alice", "f").await.unwrap();
        assert!(fx.index.get_for_path("alice/f").await.unwrap_err().is_not_found());
        assert!(fx.index.get_for_path_on("alice/f", "c1").await.unwrap().is_tombstone());

        let listing = fx.service.list_files(&u, "c1", Some("alice"), 0).await.unwrap();
        assert!(listing.entries.is_empty());
    }

    #[tokio::test]
    async fn test_list_files_relative_names() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem")]).await;
        for p in ["b", "a/c"] {
            fx.service
                .store(&mut u, "c1", "alice", p, Bytes::from_static(b"1"), "text/plain")
                .await
                .unwrap();
        }

        let scoped = fx.service.list_files(&u, "c1", Some("alice"), 0).await.unwrap();
        assert_eq!(scoped.entries, vec!["a/c", "b"]);
        let all = fx.service.list_files(&u, "c1", None, 0).await.unwrap();
        assert_eq!(all.entries, vec!["alice/a/c", "alice/b"]);
        assert!(fx.service.list_files(&u, "zz", None, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_connection_guards() {
        let fx = setup().await;

        let mut only = user(&fx, &[("c1", "mem")]).await;
        let err = fx.service.delete_connection(&mut only, "c1").await.unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));

        let mut u = User::new("bob");
        u.connections.insert("c1".into(), Connection::new("mem", "c1", "bob"));
        u.connections.insert("r".into(), Connection::new("root", "r", "bob"));
        u.default_connection = "c1".into();
        fx.store.register_user(&u).await.unwrap();

        let err = fx.service.delete_connection(&mut u, "c1").await.unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));
        assert!(fx
            .service
            .delete_connection(&mut u, "missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_root_only_connection() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem"), ("r", "root")]).await;

        fx.service.delete_connection(&mut u, "r").await.unwrap();
        assert_eq!(u.default_connection, "c1");
        let saved = fx.store.get_user("alice").await.unwrap();
        assert_eq!(saved.connections.keys().collect::<Vec<_>>(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_delete_connection_of_root_only_user() {
        let fx = setup().await;
        let mut u = user(&fx, &[("r1", "root"), ("r2", "root2")]).await;

        fx.service.delete_connection(&mut u, "r1").await.unwrap();
        assert_eq!(u.default_connection, "r2");
        let saved = fx.store.get_user("alice").await.unwrap();
        assert_eq!(saved.default_connection, "r2");

        let err = fx.service.delete_connection(&mut u, "r2").await.unwrap_err();
        assert!(matches!(err, HestiaError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_bucket_append_keeps_concurrent_user_changes() {
        let fx = setup().await;
        let mut stale = user(&fx, &[("c1", "mem"), ("c2", "mem")]).await;
        let mut fresh = stale.clone();
        fx.service.set_default(&mut fresh, "c2").await.unwrap();

        fx.service
            .store(&mut stale, "c1", "app1", "x", Bytes::from_static(b"1"), "text/plain")
            .await
            .unwrap();

        let saved = fx.store.get_user("alice").await.unwrap();
        assert_eq!(saved.default_connection, "c2");
        assert_eq!(saved.connections["c1"].buckets, vec!["alice", "app1"]);
        assert_eq!(stale.default_connection, "c2");
    }

    #[tokio::test]
    async fn test_delete_connection_reassigns_default_and_drops_rows() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem"), ("c2", "mem")]).await;
        fx.service
            .store(&mut u, "c1", "alice", "f", Bytes::from_static(b"1"), "text/plain")
            .await
            .unwrap();

        fx.service.delete_connection(&mut u, "c1").await.unwrap();

        assert_eq!(u.default_connection, "c2");
        assert!(fx.index.get_for_connection("c1", None).await.unwrap().is_empty());
        let saved = fx.store.get_user("alice").await.unwrap();
        assert!(!saved.connections.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_set_default_and_buckets_guards() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem"), ("r", "root")]).await;

        assert!(matches!(
            fx.service.set_default(&mut u, "r").await.unwrap_err(),
            HestiaError::NotAllowed(_)
        ));
        assert!(matches!(
            fx.service.set_buckets(&mut u, "r", vec!["app".into()]).await.unwrap_err(),
            HestiaError::NotAllowed(_)
        ));

        fx.service
            .set_buckets(&mut u, "c1", vec!["app".into(), "alice".into()])
            .await
            .unwrap();
        assert_eq!(u.connections["c1"].buckets, vec!["alice", "app"]);
        let saved = fx.store.get_user("alice").await.unwrap();
        assert_eq!(saved.connections["c1"].buckets, vec!["alice", "app"]);
    }

    #[tokio::test]
    async fn test_register_creates_user() {
        let fx = setup().await;

        let outcome = fx
            .service
            .register_connection(Some("carol"), "mem", None, None)
            .await
            .unwrap();
        let Registration::Connected { address, connection_id } = outcome else {
            panic!("expected a finished registration");
        };
        assert_eq!(address, "carol");

        let saved = fx.store.get_user("carol").await.unwrap();
        assert_eq!(saved.default_connection, connection_id);
        assert_eq!(saved.connections[&connection_id].name, "Memory");
    }

    #[tokio::test]
    async fn test_unregister_user() {
        let fx = setup().await;
        let mut u = user(&fx, &[("c1", "mem")]).await;
        fx.service
            .store(&mut u, "c1", "alice", "f", Bytes::from_static(b"1"), "text/plain")
            .await
            .unwrap();

        fx.service.unregister_user(&u).await.unwrap();
        assert!(fx.store.get_user("alice").await.unwrap_err().is_not_found());
        assert!(fx.index.get_for_connection("c1", None).await.unwrap().is_empty());
    }
}
