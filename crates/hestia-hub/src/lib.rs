//! Passthrough driver to a remote Gaia hub.
//!
//! Two modes:
//! - hub mode (`token` configured): every user shares one bucket on the remote
//!   hub, namespaced by address. Auto-registerable.
//! - user mode (no token): each connection brings its own hub, bucket and
//!   token at registration time. The token is kept in the driver's key-value
//!   table, never in the user record.

mod client;

use async_trait::async_trait;
use hestia_core::{
    paginate, ConnectionContext, DeleteRequest, Driver, DriverApi, DriverInit, DriverSpaceInfo,
    HestiaError, ListEntry, ListFilesResponse, ReadRequest, ReadResult, RegisterOutcome,
    RegisterRequest, Result, WriteRequest,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

pub use client::{urljoin, HubClient, HubInfo};

#[derive(Debug, Default, Deserialize)]
struct HubOptions {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    hub_url: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page_size() -> usize {
    50
}

/// Hub endpoint shared by all users (hub mode).
#[derive(Debug, Clone)]
struct SharedHub {
    hub_url: String,
    read_url: String,
    bucket: String,
    token: String,
}

/// What a user-mode connection keeps in its driver config.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserHub {
    hub_url: String,
    read_url: String,
    bucket: String,
}

/// Resolved target for one call.
struct Target {
    hub_url: String,
    read_url: String,
    bucket: String,
    token: String,
    /// Prefix inside the remote bucket under which this user's files live
    root: String,
}

pub struct HubDriver {
    id: String,
    page_size: usize,
    client: HubClient,
    shared: Option<SharedHub>,
    api: Option<DriverApi>,
}

impl Default for HubDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HubDriver {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            page_size: default_page_size(),
            client: HubClient::new(),
            shared: None,
            api: None,
        }
    }

    fn api(&self) -> Result<&DriverApi> {
        self.api
            .as_ref()
            .ok_or_else(|| HestiaError::Driver("Hub driver used before init".to_string()))
    }

    fn token_key(address: &str, hub: &UserHub) -> String {
        format!("{}|{}|{}", address, hub.hub_url, hub.bucket)
    }

    async fn target(&self, ctx: &ConnectionContext) -> Result<Target> {
        if let Some(shared) = &self.shared {
            return Ok(Target {
                hub_url: shared.hub_url.clone(),
                read_url: shared.read_url.clone(),
                bucket: shared.bucket.clone(),
                token: shared.token.clone(),
                root: ctx.address.clone(),
            });
        }

        let hub: UserHub = serde_json::from_value(ctx.driver_config.clone()).map_err(|e| {
            HestiaError::malformed(format!("Connection has no hub configuration: {}", e))
        })?;
        let token: String = self
            .api()?
            .get(&Self::token_key(&ctx.address, &hub))
            .await?
            .ok_or_else(|| HestiaError::not_found("No token stored for this connection"))?;

        Ok(Target {
            hub_url: hub.hub_url,
            read_url: hub.read_url,
            bucket: hub.bucket,
            token,
            root: String::new(),
        })
    }
}

#[async_trait]
impl Driver for HubDriver {
    async fn init(
        &mut self,
        id: &str,
        options: &serde_json::Value,
        api: DriverApi,
    ) -> Result<DriverInit> {
        let options: HubOptions = if options.is_null() {
            HubOptions {
                page_size: default_page_size(),
                ..Default::default()
            }
        } else {
            serde_json::from_value(options.clone())?
        };

        self.id = id.to_string();
        self.page_size = options.page_size.max(1);

        let hub_mode = options.token.is_some();
        if let Some(token) = options.token {
            let hub_url = options
                .hub_url
                .ok_or_else(|| HestiaError::malformed("Hub mode requires hub_url"))?;
            let bucket = options
                .bucket
                .ok_or_else(|| HestiaError::malformed("Hub mode requires bucket"))?;
            if hub_url.trim_end_matches('/') == api.origin().trim_end_matches('/') {
                return Err(HestiaError::malformed(
                    "Cannot use a token to the same hub that this is running on!",
                ));
            }

            let info = self.client.hub_info(&hub_url).await?;
            info!("Hub driver \"{}\" forwarding to {} (bucket {})", id, hub_url, bucket);

            self.shared = Some(SharedHub {
                hub_url,
                read_url: info.read_url_prefix,
                bucket,
                token,
            });
        } else {
            info!("Hub driver \"{}\" in per-user mode", id);
        }
        self.api = Some(api);

        Ok(DriverInit {
            name: if hub_mode { "Gaia Hub" } else { "Gaia Hub (User)" }.to_string(),
            long_id: if hub_mode {
                "hestia.driver.gaia-hub"
            } else {
                "hestia.driver.gaia-hub-user"
            }
            .to_string(),
            icon: None,
            multi_instance: hub_mode,
            multi_user: !hub_mode,
            auto_registerable: hub_mode,
        })
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, bucket = req.bucket, path = req.path))]
    async fn perform_read(&self, req: ReadRequest<'_>) -> Result<ReadResult> {
        let t = self.target(req.ctx).await?;
        let url = urljoin(&[&t.read_url, &t.bucket, &t.root, req.bucket, req.path]);
        debug!("Redirecting read to {}", url);
        Ok(ReadResult::Redirect { url })
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, bucket = req.bucket, path = req.path, data_len = req.content.len()))]
    async fn perform_write(&self, req: WriteRequest<'_>) -> Result<()> {
        let t = self.target(req.ctx).await?;
        let url = urljoin(&[&t.hub_url, "store", &t.bucket, &t.root, req.bucket, req.path]);
        self.client
            .store(&url, &t.token, req.content_type, req.content.clone())
            .await
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, bucket = req.bucket, path = req.path))]
    async fn perform_delete(&self, req: DeleteRequest<'_>) -> Result<()> {
        let t = self.target(req.ctx).await?;
        let url = urljoin(&[&t.hub_url, "delete", &t.bucket, &t.root, req.bucket, req.path]);
        self.client.delete(&url, &t.token).await
    }

    #[instrument(skip(self, ctx), level = "debug", fields(driver = %self.id))]
    async fn list_files(
        &self,
        prefix: &str,
        page: usize,
        extended: bool,
        ctx: &ConnectionContext,
    ) -> Result<ListFilesResponse> {
        let t = self.target(ctx).await?;
        let root = urljoin(&[&t.root, prefix]);
        let strip = if t.root.is_empty() {
            String::new()
        } else {
            format!("{}/", t.root)
        };

        let all = self
            .client
            .list_all(&t.hub_url, &t.bucket, &t.token, extended)
            .await?;

        let matching: Vec<ListEntry> = all
            .into_iter()
            .filter(|e| e.name().starts_with(&root))
            .map(|e| match e {
                ListEntry::Name(n) => ListEntry::Name(n.strip_prefix(&strip).unwrap_or(&n).to_string()),
                ListEntry::Extended {
                    name,
                    content_length,
                    content_type,
                    last_modified_date,
                } => ListEntry::Extended {
                    name: name.strip_prefix(&strip).unwrap_or(&name).to_string(),
                    content_length,
                    content_type,
                    last_modified_date,
                },
            })
            .collect();

        Ok(paginate(matching, page, self.page_size))
    }

    async fn get_info(&self, _ctx: &ConnectionContext) -> Result<DriverSpaceInfo> {
        Ok(DriverSpaceInfo {
            space_used: -1,
            space_available: None,
        })
    }

    async fn register(
        &self,
        user: Option<&ConnectionContext>,
        _redirect_uri: Option<&str>,
        req: Option<&RegisterRequest>,
    ) -> Result<RegisterOutcome> {
        let user = user.ok_or_else(|| HestiaError::malformed("Must have user object to register."))?;

        if self.shared.is_some() {
            return Ok(RegisterOutcome::Finish {
                address: user.address.clone(),
                userdata: serde_json::Value::Null,
            });
        }

        let query = req.map(|r| &r.query).ok_or_else(|| {
            HestiaError::malformed("Tried to register for the user-driver but there was no request!")
        })?;
        let param = |name: &str| {
            query
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| HestiaError::malformed(format!("Missing \"{}\" query parameter", name)))
        };
        let token = param("token")?;
        let hub_url = param("hub_url")?;
        let bucket = param("bucket")?;

        if hub_url.trim_end_matches('/') == self.api()?.origin().trim_end_matches('/') {
            return Err(HestiaError::malformed(
                "Cannot register for the same hub that this is running on!",
            ));
        }

        let info = self.client.hub_info(&hub_url).await.map_err(|e| {
            HestiaError::malformed(format!("Error getting hub info for {}: {}", hub_url, e))
        })?;

        let hub = UserHub {
            hub_url,
            read_url: info.read_url_prefix,
            bucket,
        };
        self.api()?
            .set(&Self::token_key(&user.address, &hub), &token)
            .await?;

        Ok(RegisterOutcome::Finish {
            address: user.address.clone(),
            userdata: serde_json::to_value(&hub)?,
        })
    }

    async fn unregister(&self, ctx: &ConnectionContext) -> Result<()> {
        if self.shared.is_some() {
            return Ok(());
        }
        if let Ok(hub) = serde_json::from_value::<UserHub>(ctx.driver_config.clone()) {
            self.api()?.delete(&Self::token_key(&ctx.address, &hub)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use hestia_core::KeyValueStore;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct MemKv(Mutex<HashMap<(String, String), serde_json::Value>>);

    #[async_trait]
    impl KeyValueStore for MemKv {
        async fn kv_get(&self, ns: &str, key: &str) -> Result<Option<serde_json::Value>> {
            Ok(self.0.lock().unwrap().get(&(ns.into(), key.into())).cloned())
        }
        async fn kv_set(&self, ns: &str, key: &str, value: serde_json::Value) -> Result<()> {
            self.0.lock().unwrap().insert((ns.into(), key.into()), value);
            Ok(())
        }
        async fn kv_delete(&self, ns: &str, key: &str) -> Result<()> {
            self.0.lock().unwrap().remove(&(ns.into(), key.into()));
            Ok(())
        }
        async fn kv_get_all(&self, ns: &str) -> Result<Vec<(String, serde_json::Value)>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|((n, _), _)| n == ns)
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    async fn mock_hub_info(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/hub_info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "read_url_prefix": "https://read.example/",
            })))
            .mount(server)
            .await;
    }

    fn ctx(config: serde_json::Value) -> ConnectionContext {
        ConnectionContext {
            address: "alice".into(),
            internal_bucket_address: None,
            connection_id: "c1".into(),
            driver_config: config,
        }
    }

    async fn hub_mode(server: &MockServer) -> HubDriver {
        mock_hub_info(server).await;
        let mut driver = HubDriver::new();
        let api = DriverApi::new("hub", "http://gateway", Arc::new(MemKv::default()));
        let init = driver
            .init(
                "hub",
                &serde_json::json!({ "token": "tok", "hub_url": server.uri(), "bucket": "B" }),
                api,
            )
            .await
            .unwrap();
        assert!(init.auto_registerable);
        assert!(init.multi_instance);
        driver
    }

    #[tokio::test]
    async fn test_hub_mode_write_and_read() {
        let server = MockServer::start().await;
        let driver = hub_mode(&server).await;

        Mock::given(method("POST"))
            .and(path("/store/B/alice/app/notes.txt"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let c = ctx(serde_json::Value::Null);
        driver
            .perform_write(WriteRequest {
                path: "notes.txt",
                bucket: "app",
                content_type: "text/plain",
                content: Bytes::from_static(b"hi"),
                ctx: &c,
            })
            .await
            .unwrap();

        let read = driver
            .perform_read(ReadRequest { path: "notes.txt", bucket: "app", ctx: &c })
            .await
            .unwrap();
        assert_eq!(
            read,
            ReadResult::Redirect {
                url: "https://read.example/B/alice/app/notes.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn test_hub_mode_list_follows_remote_pages() {
        let server = MockServer::start().await;
        let driver = hub_mode(&server).await;

        Mock::given(method("POST"))
            .and(path("/list-files/B"))
            .and(body_json(serde_json::json!({ "page": null, "state": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": ["alice/app/a", "bob/app/x"],
                "page": "1",
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/list-files/B"))
            .and(body_json(serde_json::json!({ "page": "1", "state": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entries": ["alice/app/b", "alice/other/c"],
            })))
            .mount(&server)
            .await;

        let listed = driver
            .list_files("app", 0, false, &ctx(serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(
            listed.entries,
            vec![
                ListEntry::Name("app/a".into()),
                ListEntry::Name("app/b".into())
            ]
        );
        assert_eq!(listed.next_page, None);
    }

    #[tokio::test]
    async fn test_remote_not_found_on_delete() {
        let server = MockServer::start().await;
        let driver = hub_mode(&server).await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = ctx(serde_json::Value::Null);
        let err = driver
            .perform_delete(DeleteRequest { path: "f", bucket: "alice", ctx: &c })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_same_hub_is_rejected() {
        let mut driver = HubDriver::new();
        let api = DriverApi::new("hub", "http://gateway", Arc::new(MemKv::default()));
        let err = driver
            .init(
                "hub",
                &serde_json::json!({ "token": "t", "hub_url": "http://gateway/", "bucket": "B" }),
                api,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same hub"));
    }

    #[tokio::test]
    async fn test_user_mode_register_keeps_token_out_of_userdata() {
        let server = MockServer::start().await;
        mock_hub_info(&server).await;
        Mock::given(method("POST"))
            .and(path("/store/UB/alice/f"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let kv = Arc::new(MemKv::default());
        let mut driver = HubDriver::new();
        let init = driver
            .init("hub-user", &serde_json::Value::Null, DriverApi::new("hub-user", "http://gateway", kv.clone()))
            .await
            .unwrap();
        assert!(init.multi_user);
        assert!(!init.auto_registerable);

        let mut req = RegisterRequest::default();
        req.query.insert("token".into(), "secret".into());
        req.query.insert("hub_url".into(), server.uri());
        req.query.insert("bucket".into(), "UB".into());

        let unconnected = ConnectionContext::unconnected("alice");
        let outcome = driver.register(Some(&unconnected), None, Some(&req)).await.unwrap();
        let userdata = match outcome {
            RegisterOutcome::Finish { userdata, .. } => userdata,
            other => panic!("unexpected {:?}", other),
        };
        assert!(!userdata.to_string().contains("secret"));

        let c = ctx(userdata);
        driver
            .perform_write(WriteRequest {
                path: "f",
                bucket: "alice",
                content_type: "text/plain",
                content: Bytes::from_static(b"x"),
                ctx: &c,
            })
            .await
            .unwrap();

        driver.unregister(&c).await.unwrap();
        assert!(kv.kv_get_all("drivers/hub-user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_mode_register_requires_token() {
        let mut driver = HubDriver::new();
        driver
            .init("hub-user", &serde_json::Value::Null, DriverApi::new("hub-user", "http://gateway", Arc::new(MemKv::default())))
            .await
            .unwrap();
        let err = driver
            .register(Some(&ctx(serde_json::Value::Null)), None, Some(&RegisterRequest::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }
}
