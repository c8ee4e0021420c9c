use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hestia_core::{
    paginate, ConnectionContext, DeleteRequest, Driver, DriverApi, DriverInit, DriverSpaceInfo,
    HestiaError, ListEntry, ListFilesResponse, ReadRequest, ReadResult, RegisterOutcome,
    RegisterRequest, Result, WriteRequest,
};
use serde::Deserialize;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
struct MemoryOptions {
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone)]
struct Blob {
    content_type: String,
    data: Bytes,
    modified: DateTime<Utc>,
}

/// Volatile driver keeping content in process memory.
#[derive(Debug)]
pub struct MemoryDriver {
    id: String,
    page_size: usize,
    /// `{address}/{bucket}/{path}` -> blob
    blobs: DashMap<String, Blob>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            page_size: default_page_size(),
            blobs: DashMap::new(),
        }
    }

    fn key(ctx: &ConnectionContext, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", ctx.address, bucket, path)
    }

    fn user_prefix(ctx: &ConnectionContext) -> String {
        format!("{}/", ctx.address)
    }

    /// Number of blobs held, across users.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn init(
        &mut self,
        id: &str,
        options: &serde_json::Value,
        _api: DriverApi,
    ) -> Result<DriverInit> {
        let options: MemoryOptions = if options.is_null() {
            MemoryOptions {
                page_size: default_page_size(),
            }
        } else {
            serde_json::from_value(options.clone())?
        };
        self.id = id.to_string();
        self.page_size = options.page_size.max(1);

        Ok(DriverInit {
            name: "Memory".to_string(),
            long_id: "hestia.driver.memory".to_string(),
            icon: None,
            multi_instance: true,
            multi_user: false,
            auto_registerable: true,
        })
    }

    async fn perform_read(&self, req: ReadRequest<'_>) -> Result<ReadResult> {
        let blob = self
            .blobs
            .get(&Self::key(req.ctx, req.bucket, req.path))
            .map(|b| b.value().clone())
            .ok_or_else(|| HestiaError::not_found(format!("{}/{}", req.bucket, req.path)))?;
        Ok(ReadResult::Content {
            content_type: blob.content_type,
            data: blob.data,
        })
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, data_len = req.content.len()))]
    async fn perform_write(&self, req: WriteRequest<'_>) -> Result<()> {
        self.blobs.insert(
            Self::key(req.ctx, req.bucket, req.path),
            Blob {
                content_type: req.content_type.to_string(),
                data: req.content.clone(),
                modified: Utc::now(),
            },
        );
        debug!("Stored {}/{}", req.bucket, req.path);
        Ok(())
    }

    async fn perform_delete(&self, req: DeleteRequest<'_>) -> Result<()> {
        self.blobs
            .remove(&Self::key(req.ctx, req.bucket, req.path))
            .map(|_| ())
            .ok_or_else(|| HestiaError::not_found(format!("{}/{}", req.bucket, req.path)))
    }

    async fn list_files(
        &self,
        prefix: &str,
        page: usize,
        extended: bool,
        ctx: &ConnectionContext,
    ) -> Result<ListFilesResponse> {
        let user_prefix = Self::user_prefix(ctx);
        let mut matching: Vec<ListEntry> = self
            .blobs
            .iter()
            .filter_map(|e| {
                let name = e.key().strip_prefix(&user_prefix)?;
                if !name.starts_with(prefix) {
                    return None;
                }
                Some(if extended {
                    ListEntry::Extended {
                        name: name.to_string(),
                        content_length: e.data.len() as u64,
                        content_type: Some(e.content_type.clone()),
                        last_modified_date: Some(e.modified.timestamp_millis()),
                    }
                } else {
                    ListEntry::Name(name.to_string())
                })
            })
            .collect();
        matching.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(paginate(matching, page, self.page_size))
    }

    async fn get_info(&self, ctx: &ConnectionContext) -> Result<DriverSpaceInfo> {
        let user_prefix = Self::user_prefix(ctx);
        let used: usize = self
            .blobs
            .iter()
            .filter(|e| e.key().starts_with(&user_prefix))
            .map(|e| e.data.len())
            .sum();
        Ok(DriverSpaceInfo {
            space_used: used as i64,
            space_available: None,
        })
    }

    async fn register(
        &self,
        user: Option<&ConnectionContext>,
        _redirect_uri: Option<&str>,
        _req: Option<&RegisterRequest>,
    ) -> Result<RegisterOutcome> {
        let user = user.ok_or_else(|| HestiaError::malformed("Must have user object to register."))?;
        Ok(RegisterOutcome::Finish {
            address: user.address.clone(),
            userdata: serde_json::Value::Null,
        })
    }

    async fn unregister(&self, ctx: &ConnectionContext) -> Result<()> {
        let user_prefix = Self::user_prefix(ctx);
        self.blobs.retain(|k, _| !k.starts_with(&user_prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::MemoryStore;

    async fn setup() -> MemoryDriver {
        let mut driver = MemoryDriver::new();
        let api = DriverApi::new("mem", "http://localhost:4010", Arc::new(MemoryStore::new()));
        driver
            .init("mem", &serde_json::json!({ "page_size": 2 }), api)
            .await
            .unwrap();
        driver
    }

    fn write<'a>(ctx: &'a ConnectionContext, path: &'a str, data: &'static [u8]) -> WriteRequest<'a> {
        WriteRequest {
            path,
            bucket: "alice",
            content_type: "text/plain",
            content: Bytes::from_static(data),
            ctx,
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_delete() {
        let driver = setup().await;
        let ctx = ConnectionContext::unconnected("alice");

        driver.perform_write(write(&ctx, "a.txt", b"hi")).await.unwrap();
        let read = driver
            .perform_read(ReadRequest { path: "a.txt", bucket: "alice", ctx: &ctx })
            .await
            .unwrap();
        assert_eq!(
            read,
            ReadResult::Content {
                content_type: "text/plain".into(),
                data: Bytes::from_static(b"hi")
            }
        );

        let del = DeleteRequest { path: "a.txt", bucket: "alice", ctx: &ctx };
        driver.perform_delete(del).await.unwrap();
        assert!(driver.perform_delete(del).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_is_per_user_and_paginated() {
        let driver = setup().await;
        let alice = ConnectionContext::unconnected("alice");
        let bob = ConnectionContext::unconnected("bob");

        for p in ["c", "a", "b"] {
            driver.perform_write(write(&alice, p, b"x")).await.unwrap();
        }
        driver.perform_write(write(&bob, "z", b"x")).await.unwrap();

        let first = driver.list_files("alice/", 0, false, &alice).await.unwrap();
        let names: Vec<&str> = first.entries.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["alice/a", "alice/b"]);
        assert_eq!(first.next_page, Some(1));

        assert_eq!(driver.get_info(&alice).await.unwrap().space_used, 3);
        driver.unregister(&alice).await.unwrap();
        assert_eq!(driver.len(), 1);
    }
}
