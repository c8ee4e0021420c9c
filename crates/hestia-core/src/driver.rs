use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::DriverApi;
use crate::page::PageResult;
use crate::user::{ConnectionContext, User};

/// What a driver reports about itself from `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInit {
    pub name: String,
    /// Global capability identity
    pub long_id: String,
    pub icon: Option<String>,
    /// Whether several configured instances may share `long_id`
    pub multi_instance: bool,
    /// Whether one user may hold several connections to it
    pub multi_user: bool,
    pub auto_registerable: bool,
}

/// Registry-side descriptor of a configured driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    pub id: String,
    pub long_id: String,
    pub name: String,
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Vec<String>>,
    pub multi_instance: bool,
    pub multi_user: bool,
    pub auto_register: bool,
    /// May only mirror a user's own root bucket
    pub root_only: bool,
}

impl DriverInfo {
    pub fn allows(&self, address: &str) -> bool {
        match &self.whitelist {
            Some(list) => list.iter().any(|a| a == address),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    /// Path relative to the bucket
    pub path: &'a str,
    pub bucket: &'a str,
    pub ctx: &'a ConnectionContext,
}

#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    pub path: &'a str,
    pub bucket: &'a str,
    pub content_type: &'a str,
    /// Fully buffered content; clones share the same allocation
    pub content: Bytes,
    pub ctx: &'a ConnectionContext,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteRequest<'a> {
    pub path: &'a str,
    pub bucket: &'a str,
    pub ctx: &'a ConnectionContext,
}

/// Outcome of a driver read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    Content { content_type: String, data: Bytes },
    /// The content is publicly reachable elsewhere
    Redirect { url: String },
}

/// One entry of a driver or gateway listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListEntry {
    Name(String),
    #[serde(rename_all = "camelCase")]
    Extended {
        name: String,
        content_length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        /// Milliseconds since the Unix epoch
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_modified_date: Option<i64>,
    },
}

impl ListEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::Extended { name, .. } => name,
        }
    }

    pub fn extended(name: String, size: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self::Extended {
            name,
            content_length: size,
            content_type: None,
            last_modified_date: last_modified.map(|t| t.timestamp_millis()),
        }
    }
}

pub type ListFilesResponse = PageResult<ListEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpaceInfo {
    /// Bytes used, or -1 when the backend cannot tell
    pub space_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_available: Option<u64>,
}

/// HTTP context of a registration request (OAuth callbacks, tokens in query).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterRequest {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

/// Result of one registration step.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// Send the user elsewhere (OAuth consent) and come back later
    Redirect {
        uri: String,
        headers: BTreeMap<String, String>,
    },
    /// Registration is complete for `address`
    Finish {
        address: String,
        userdata: serde_json::Value,
    },
}

/// A pluggable storage backend.
///
/// Paths handed to drivers are relative to `bucket`; drivers decide their own
/// physical layout.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Configure the driver. Called once, before it is shared.
    async fn init(
        &mut self,
        id: &str,
        options: &serde_json::Value,
        api: DriverApi,
    ) -> Result<DriverInit>;

    async fn perform_read(&self, req: ReadRequest<'_>) -> Result<ReadResult>;

    async fn perform_write(&self, req: WriteRequest<'_>) -> Result<()>;

    async fn perform_delete(&self, req: DeleteRequest<'_>) -> Result<()>;

    /// List what the backend physically holds under `prefix`.
    async fn list_files(
        &self,
        prefix: &str,
        page: usize,
        extended: bool,
        ctx: &ConnectionContext,
    ) -> Result<ListFilesResponse>;

    async fn get_info(&self, ctx: &ConnectionContext) -> Result<DriverSpaceInfo>;

    /// Direct or two-phase registration.
    ///
    /// With a user, starts (or completes) registration for them; without one,
    /// handles the callback leg of an OAuth-style flow.
    async fn register(
        &self,
        user: Option<&ConnectionContext>,
        redirect_uri: Option<&str>,
        req: Option<&RegisterRequest>,
    ) -> Result<RegisterOutcome>;

    async fn auto_register(&self, user: &ConnectionContext) -> Result<RegisterOutcome> {
        self.register(Some(user), None, None).await
    }

    /// Veto a just-registered connection (e.g. the same account twice).
    async fn post_register_check(&self, _user: &User, _userdata: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Periodic maintenance.
    async fn tick(&self) -> Result<()> {
        Ok(())
    }

    async fn unregister(&self, ctx: &ConnectionContext) -> Result<()>;
}
