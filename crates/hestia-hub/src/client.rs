//! Minimal client for a remote Gaia hub's HTTP API.

use std::time::Duration;

use bytes::Bytes;
use hestia_core::{HestiaError, ListEntry, Result};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

const MAX_RETRIES: u32 = 5;
const BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct HubInfo {
    #[serde(default)]
    pub challenge_text: Option<String>,
    #[serde(default)]
    pub latest_auth_version: Option<String>,
    pub read_url_prefix: String,
}

#[derive(Debug, Deserialize)]
struct RemoteListPage {
    #[serde(default)]
    entries: Vec<ListEntry>,
    /// Hubs send the continuation token as a string or a number
    #[serde(default)]
    page: Option<serde_json::Value>,
}

/// Join URL parts with exactly one slash between them.
pub fn urljoin(parts: &[&str]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        let p = if i == 0 {
            part.trim_end_matches('/')
        } else {
            part.trim_matches('/')
        };
        if p.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(p);
    }
    out
}

/// Remote hub API client. All requests retry with exponential backoff on 429/5xx.
#[derive(Debug, Clone)]
pub struct HubClient {
    http: HttpClient,
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HubClient {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }

    async fn send_with_retry(&self, build_request: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);
        let mut attempt = 0;

        loop {
            let response = build_request()
                .send()
                .await
                .map_err(|e| HestiaError::Driver(format!("Hub request failed: {}", e)))?;

            let status = response.status();
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if !retryable || attempt == MAX_RETRIES {
                return Ok(response);
            }

            attempt += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                status = status.as_u16(),
                "Hub request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => HestiaError::not_found(format!("{}: {}", what, text)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                HestiaError::not_allowed(format!("{} rejected by hub: {}", what, text))
            }
            _ => HestiaError::Driver(format!("{} failed with status {}: {}", what, status, text)),
        })
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn hub_info(&self, hub_url: &str) -> Result<HubInfo> {
        let url = urljoin(&[hub_url, "hub_info"]);
        let response = self.send_with_retry(|| self.http.get(&url)).await?;
        let response = Self::check(response, "hub_info").await?;
        response
            .json()
            .await
            .map_err(|e| HestiaError::Driver(format!("Invalid hub_info response: {}", e)))
    }

    #[instrument(skip(self, token, data), level = "debug", fields(data_len = data.len()))]
    pub async fn store(&self, url: &str, token: &str, content_type: &str, data: Bytes) -> Result<()> {
        let response = self
            .send_with_retry(|| {
                self.http
                    .post(url)
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(data.clone())
            })
            .await?;
        Self::check(response, "store").await?;
        debug!("Stored {} bytes to {}", data.len(), url);
        Ok(())
    }

    #[instrument(skip(self, token), level = "debug")]
    pub async fn delete(&self, url: &str, token: &str) -> Result<()> {
        let response = self
            .send_with_retry(|| self.http.delete(url).bearer_auth(token))
            .await?;
        Self::check(response, "delete").await?;
        debug!("Deleted {}", url);
        Ok(())
    }

    /// Fetch every remote listing page for `bucket`.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn list_all(&self, hub_url: &str, bucket: &str, token: &str, extended: bool) -> Result<Vec<ListEntry>> {
        let url = urljoin(&[hub_url, "list-files", bucket]);
        let mut entries = Vec::new();
        let mut page: Option<serde_json::Value> = None;

        loop {
            let body = serde_json::json!({ "page": page, "state": extended });
            let response = self
                .send_with_retry(|| self.http.post(&url).bearer_auth(token).json(&body))
                .await?;
            let response = Self::check(response, "list-files").await?;
            let remote: RemoteListPage = response
                .json()
                .await
                .map_err(|e| HestiaError::Driver(format!("Invalid list-files response: {}", e)))?;

            let empty = remote.entries.is_empty();
            entries.extend(remote.entries);

            match remote.page {
                Some(next) if !next.is_null() && !empty => page = Some(next),
                _ => break,
            }
        }

        Ok(entries)
    }

    /// Fetch a publicly readable URL.
    pub async fn fetch(&self, url: &str) -> Result<(Option<String>, Bytes)> {
        let response = self.send_with_retry(|| self.http.get(url)).await?;
        let response = Self::check(response, "read").await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let data = response
            .bytes()
            .await
            .map_err(|e| HestiaError::Driver(format!("Failed to read body: {}", e)))?;
        Ok((content_type, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_urljoin() {
        assert_eq!(urljoin(&["http://h/", "/store/", "b", "x/y"]), "http://h/store/b/x/y");
        assert_eq!(urljoin(&["http://h", "", "a"]), "http://h/a");
    }

    #[tokio::test]
    async fn test_retries_on_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hub_info"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hub_info"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "read_url_prefix": "http://r/" })),
            )
            .mount(&server)
            .await;

        let info = HubClient::new().hub_info(&server.uri()).await.unwrap();
        assert_eq!(info.read_url_prefix, "http://r/");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = HubClient::new()
            .delete(&urljoin(&[&server.uri(), "delete/b/f"]), "t")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
