//! Per-(path, connection) metadata entries and the reconciliation fold that
//! derives one canonical view per path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a content buffer.
pub fn hash_content(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// State of one path as observed on one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    Present {
        content_type: String,
        size: u64,
        hash: String,
        last_modified: DateTime<Utc>,
    },
    /// The path was deleted from this connection at `at`.
    Tombstoned { at: DateTime<Utc> },
}

/// A metadata row. The path is the row's key and is held by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub connection_id: String,
    #[serde(flatten)]
    pub state: EntryState,
}

impl MetadataEntry {
    pub fn present(
        connection_id: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            state: EntryState::Present {
                content_type: content_type.into(),
                size,
                hash: hash.into(),
                last_modified,
            },
        }
    }

    pub fn tombstone(connection_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            connection_id: connection_id.into(),
            state: EntryState::Tombstoned { at },
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.state, EntryState::Tombstoned { .. })
    }

    /// Content hash; empty for tombstones.
    pub fn hash(&self) -> &str {
        match &self.state {
            EntryState::Present { hash, .. } => hash,
            EntryState::Tombstoned { .. } => "",
        }
    }

    pub fn size(&self) -> u64 {
        match &self.state {
            EntryState::Present { size, .. } => *size,
            EntryState::Tombstoned { .. } => 0,
        }
    }

    pub fn content_type(&self) -> &str {
        match &self.state {
            EntryState::Present { content_type, .. } => content_type,
            EntryState::Tombstoned { .. } => "",
        }
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        match &self.state {
            EntryState::Present { last_modified, .. } => *last_modified,
            EntryState::Tombstoned { at } => *at,
        }
    }
}

/// Canonical version of a path plus the connections currently holding it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledView {
    pub path: String,
    pub content_type: String,
    pub size: u64,
    pub hash: String,
    /// Earliest observation of the winning content
    pub last_modified: DateTime<Utc>,
    pub conn_ids: Vec<String>,
    /// True when the canonical observation is a deletion
    pub tombstoned: bool,
}

impl ReconciledView {
    fn start(path: &str, e: &MetadataEntry) -> Self {
        Self {
            path: path.to_string(),
            content_type: e.content_type().to_string(),
            size: e.size(),
            hash: e.hash().to_string(),
            last_modified: e.last_modified(),
            conn_ids: vec![e.connection_id.clone()],
            tombstoned: e.is_tombstone(),
        }
    }

    pub fn holds(&self, connection_id: &str) -> bool {
        self.conn_ids.iter().any(|c| c == connection_id)
    }
}

/// Fold the entries of one path, in retrieval order, into its canonical view.
///
/// This is a left fold, not a commutative merge: an entry that shares the
/// eventual winning hash but is visited before the entry that establishes
/// that hash is never added to `conn_ids`.
pub fn reconcile<'a, I>(path: &str, entries: I) -> Option<ReconciledView>
where
    I: IntoIterator<Item = &'a MetadataEntry>,
{
    let mut canonical: Option<ReconciledView> = None;
    let mut oldest_seen = DateTime::<Utc>::MIN_UTC;
    let mut latest_seen = DateTime::<Utc>::MIN_UTC;

    for e in entries {
        let lm = e.last_modified();
        match canonical.as_mut() {
            None => {
                canonical = Some(ReconciledView::start(path, e));
                oldest_seen = lm;
                latest_seen = lm;
            }
            Some(view) if view.hash == e.hash() => {
                if !view.holds(&e.connection_id) {
                    view.conn_ids.push(e.connection_id.clone());
                }
                if lm > latest_seen {
                    latest_seen = lm;
                } else if lm < oldest_seen {
                    oldest_seen = lm;
                    view.last_modified = lm;
                }
            }
            Some(view) if lm > latest_seen => {
                *view = ReconciledView::start(path, e);
                oldest_seen = lm;
                latest_seen = lm;
            }
            Some(_) => {}
        }
    }

    canonical
}

/// Group `(path, entry)` rows by path, keeping per-path retrieval order, and
/// fold each group.
pub fn reconcile_rows<I>(rows: I) -> BTreeMap<String, ReconciledView>
where
    I: IntoIterator<Item = (String, MetadataEntry)>,
{
    let mut grouped: BTreeMap<String, Vec<MetadataEntry>> = BTreeMap::new();
    for (path, entry) in rows {
        grouped.entry(path).or_default().push(entry);
    }

    grouped
        .into_iter()
        .filter_map(|(path, entries)| reconcile(&path, &entries).map(|v| (path, v)))
        .collect()
}
