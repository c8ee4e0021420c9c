//! Metadata index: per-(path, connection) rows and the canonical views folded
//! from them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hestia_core::{reconcile, reconcile_rows, HestiaError, MetadataEntry, ReconciledView, Result, User};
use tracing::{debug, instrument};

use crate::store::Store;

/// Full index key of a bucket-relative path.
pub fn key(bucket: &str, path: &str) -> String {
    format!("{}/{}", bucket, path)
}

fn bucket_prefix(bucket: &str) -> String {
    format!("{}/", bucket)
}

#[derive(Clone)]
pub struct MetadataIndex {
    store: Arc<dyn Store>,
}

impl MetadataIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Canonical view of a live path. Tombstones are ignored, so a path whose
    /// rows are all tombstones is `NotFound`.
    pub async fn get_for_path(&self, path: &str) -> Result<ReconciledView> {
        let rows = self.store.rows_for_path(path).await?;
        reconcile(path, rows.iter().filter(|r| !r.is_tombstone()))
            .ok_or_else(|| HestiaError::not_found(format!("No file at \"{}\"", path)))
    }

    /// The raw row one connection holds for `path`, tombstone or not.
    pub async fn get_for_path_on(&self, path: &str, connection_id: &str) -> Result<MetadataEntry> {
        self.store
            .rows_for_path(path)
            .await?
            .into_iter()
            .find(|r| r.connection_id == connection_id)
            .ok_or_else(|| {
                HestiaError::not_found(format!(
                    "No entry for \"{}\" on connection {}",
                    path, connection_id
                ))
            })
    }

    /// Every row a connection holds, optionally scoped to one bucket.
    pub async fn get_for_connection(
        &self,
        connection_id: &str,
        bucket: Option<&str>,
    ) -> Result<BTreeMap<String, MetadataEntry>> {
        let prefix = bucket.map(bucket_prefix);
        Ok(self
            .store
            .rows_for_connection(connection_id, prefix.as_deref())
            .await?
            .into_iter()
            .collect())
    }

    /// Canonical views of every path in `bucket`, tombstoned canonicals included.
    pub async fn get_for_bucket(&self, bucket: &str) -> Result<BTreeMap<String, ReconciledView>> {
        let rows = self.store.rows_with_prefix(&bucket_prefix(bucket)).await?;
        Ok(reconcile_rows(rows))
    }

    /// `path -> connection -> row` for `bucket`, tombstones included.
    pub async fn get_expanded_for_bucket(
        &self,
        bucket: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, MetadataEntry>>> {
        let mut out: BTreeMap<String, BTreeMap<String, MetadataEntry>> = BTreeMap::new();
        for (path, row) in self.store.rows_with_prefix(&bucket_prefix(bucket)).await? {
            out.entry(path)
                .or_default()
                .insert(row.connection_id.clone(), row);
        }
        Ok(out)
    }

    /// Union of the canonical views of every bucket the user routes.
    pub async fn get_for_user(&self, user: &User) -> Result<BTreeMap<String, ReconciledView>> {
        let mut out = BTreeMap::new();
        for bucket in user.buckets() {
            out.extend(self.get_for_bucket(&bucket).await?);
        }
        Ok(out)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn update(
        &self,
        path: &str,
        connection_id: &str,
        content_type: &str,
        size: u64,
        hash: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .upsert_row(
                path,
                MetadataEntry::present(connection_id, content_type, size, hash, last_modified),
            )
            .await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn tombstone(&self, path: &str, connection_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.store
            .upsert_row(path, MetadataEntry::tombstone(connection_id, at))
            .await
    }

    pub async fn delete_all_for_connection(&self, connection_id: &str) -> Result<usize> {
        let n = self.store.delete_rows_for_connection(connection_id).await?;
        debug!("Dropped {} index rows of connection {}", n, connection_id);
        Ok(n)
    }

    /// Drop paths whose every row is a tombstone.
    pub async fn compact(&self) -> Result<usize> {
        let n = self.store.compact_tombstones().await?;
        if n > 0 {
            debug!("Compacted {} fully deleted paths", n);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn setup() -> MetadataIndex {
        MetadataIndex::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_write_order_drives_the_fold() {
        let index = setup();
        index.update("alice/f", "A", "text/plain", 2, "H1", at(10)).await.unwrap();
        index.update("alice/f", "B", "text/plain", 2, "H2", at(20)).await.unwrap();
        index.update("alice/f", "A", "text/plain", 2, "H2", at(30)).await.unwrap();

        let view = index.get_for_path("alice/f").await.unwrap();
        assert_eq!(view.hash, "H2");
        assert_eq!(view.conn_ids, vec!["B", "A"]);
        assert_eq!(view.last_modified, at(20));
    }

    #[tokio::test]
    async fn test_tombstone_hides_path_but_keeps_row() {
        let index = setup();
        index.update("alice/f", "A", "text/plain", 3, "H", at(1)).await.unwrap();
        index.tombstone("alice/f", "A", at(2)).await.unwrap();

        assert!(index.get_for_path("alice/f").await.unwrap_err().is_not_found());
        let row = index.get_for_path_on("alice/f", "A").await.unwrap();
        assert_eq!(row.size(), 0);
        assert_eq!(row.hash(), "");

        let bucket = index.get_for_bucket("alice").await.unwrap();
        assert!(bucket["alice/f"].tombstoned);
    }

    #[tokio::test]
    async fn test_bucket_scoping_is_by_segment() {
        let index = setup();
        index.update("app/a", "A", "text/plain", 1, "X", at(1)).await.unwrap();
        index.update("app2/b", "A", "text/plain", 1, "Y", at(1)).await.unwrap();

        let views = index.get_for_bucket("app").await.unwrap();
        assert_eq!(views.keys().collect::<Vec<_>>(), vec!["app/a"]);

        let rows = index.get_for_connection("A", Some("app2")).await.unwrap();
        assert_eq!(rows.keys().collect::<Vec<_>>(), vec!["app2/b"]);
        assert_eq!(index.get_for_connection("A", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expanded_view() {
        let index = setup();
        index.update("alice/f", "A", "text/plain", 1, "X", at(1)).await.unwrap();
        index.tombstone("alice/f", "B", at(2)).await.unwrap();

        let expanded = index.get_expanded_for_bucket("alice").await.unwrap();
        assert_eq!(expanded["alice/f"].len(), 2);
        assert!(expanded["alice/f"]["B"].is_tombstone());
    }

    #[tokio::test]
    async fn test_delete_all_and_compact() {
        let index = setup();
        index.update("alice/a", "A", "text/plain", 1, "X", at(1)).await.unwrap();
        index.update("alice/a", "B", "text/plain", 1, "X", at(1)).await.unwrap();
        index.tombstone("alice/b", "B", at(1)).await.unwrap();

        assert_eq!(index.delete_all_for_connection("B").await.unwrap(), 2);
        assert_eq!(index.get_for_path("alice/a").await.unwrap().conn_ids, vec!["A"]);

        index.tombstone("alice/c", "A", at(3)).await.unwrap();
        assert_eq!(index.compact().await.unwrap(), 1);
        assert!(index.get_expanded_for_bucket("alice").await.unwrap().get("alice/c").is_none());
    }
}
