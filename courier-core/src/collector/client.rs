//! HTTP client for the collection endpoint and the settings CDN.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::pipeline::{BatchUploader, UploadError};
use crate::settings::Settings;

/// Hosts are given without a scheme; an explicit `http://` or `https://`
/// prefix is kept as-is.
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

/// Batch upload endpoint for `api_host`.
pub fn upload_url(api_host: &str) -> String {
    format!("{}/b", base_url(api_host))
}

/// Settings endpoint for a write key.
pub fn settings_url(cdn_host: &str, write_key: &str) -> String {
    format!(
        "{}/projects/{}/settings",
        base_url(cdn_host),
        urlencoding::encode(write_key)
    )
}

/// `Retry-After` as whole seconds. HTTP-date values are not supported.
pub fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    value?.trim().parse().ok()
}

/// Shared reqwest client for uploads and settings fetches.
pub struct HttpClient {
    write_key: String,
    http_client: reqwest::Client,
}

impl HttpClient {
    pub fn new(write_key: impl Into<String>, config: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let user_agent = format!("courier/{}", crate::LIBRARY_VERSION);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent)
                .map_err(|e| Error::Config(format!("invalid user agent: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            write_key: write_key.into(),
            http_client,
        })
    }

    pub fn write_key(&self) -> &str {
        &self.write_key
    }

    /// Fetch the source settings from the CDN.
    pub async fn fetch_settings(&self, cdn_host: &str) -> Result<Settings> {
        let url = settings_url(cdn_host, &self.write_key);

        let response = self
            .http_client
            .get(&url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("settings request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                retry_after: None,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read settings: {}", e)))?;
        Settings::from_json(&body)
    }
}

#[async_trait]
impl BatchUploader for HttpClient {
    async fn upload(&self, api_host: &str, body: Vec<u8>) -> std::result::Result<(), UploadError> {
        let response = self
            .http_client
            .post(upload_url(api_host))
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = parse_retry_after(
            response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let detail = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %detail, "Upload rejected");

        Err(UploadError::Http {
            status: status.as_u16(),
            retry_after,
        })
    }
}
