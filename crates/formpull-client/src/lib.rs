//! Authenticated, paginated HTTP client for the remote survey-form API.

use std::time::Duration;

use formpull_core::{AttachmentDescriptor, Cursor, RemoteSubmission};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "formpull-client";

const DEFAULT_FILENAME: &str = "file.bin";

/// Metadata-document keys that may carry the real content URL, in priority order.
const DOWNLOAD_URL_KEYS: [&str; 3] = ["download_url", "download_large_url", "download_small_url"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Explicit client configuration; the credential travels here instead of being
/// looked up from process-global state.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub asset_uid: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, asset_uid: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            asset_uid: asset_uid.into(),
            api_token: None,
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no API token configured for the remote form service")]
    MissingToken,
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One page of submissions plus the opaque next-page cursor.
#[derive(Debug, Clone)]
pub struct SubmissionPage {
    pub results: Vec<RemoteSubmission>,
    pub next: Option<Cursor>,
}

/// Attachment bytes plus the filename resolved from descriptor or metadata.
#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct DataPageWire {
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug)]
pub struct FormClient {
    http: reqwest::Client,
    base_url: String,
    asset_uid: String,
    token: String,
    backoff: BackoffPolicy,
}

impl FormClient {
    /// Fails before any I/O when the credential is absent.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let token = config
            .api_token
            .filter(|t| !t.is_empty())
            .ok_or(ClientError::MissingToken)?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            asset_uid: config.asset_uid,
            token,
            backoff: config.backoff,
        })
    }

    pub fn data_url(&self, page_size: u32, page_index: u32) -> String {
        let mut url = format!(
            "{}/api/v2/assets/{}/data/?format=json&page_size={}",
            self.base_url, self.asset_uid, page_size
        );
        if page_index > 1 {
            url.push_str(&format!("&page={page_index}"));
        }
        url
    }

    /// Fetches one page addressed by size and 1-based index.
    pub async fn fetch_page(
        &self,
        page_size: u32,
        page_index: u32,
    ) -> Result<SubmissionPage, ClientError> {
        let url = self.data_url(page_size, page_index);
        self.fetch_page_url(&url).await
    }

    /// Follows a cursor returned by a previous page, verbatim.
    pub async fn fetch_cursor(&self, cursor: &Cursor) -> Result<SubmissionPage, ClientError> {
        self.fetch_page_url(cursor.as_str()).await
    }

    async fn fetch_page_url(&self, url: &str) -> Result<SubmissionPage, ClientError> {
        let resp = self.get_with_retry(url, true).await?;
        let final_url = resp.url().to_string();
        let bytes = resp.bytes().await?;
        let wire: DataPageWire =
            serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode {
                url: final_url,
                source,
            })?;

        let results = wire
            .results
            .into_iter()
            .filter_map(RemoteSubmission::from_value)
            .collect();
        Ok(SubmissionPage {
            results,
            next: wire.next.map(Cursor::new),
        })
    }

    /// Fetches one attachment's bytes. The locator may return the content
    /// directly or a JSON metadata document carrying the real download URL.
    /// A 404 at the metadata step means the attachment is gone: `Ok(None)`.
    pub async fn fetch_attachment(
        &self,
        descriptor: &AttachmentDescriptor,
    ) -> Result<Option<FetchedAttachment>, ClientError> {
        let Some(meta_url) = descriptor.download_url.as_deref() else {
            return Ok(None);
        };

        let resp = match self.get_with_retry(meta_url, true).await {
            Ok(resp) => resp,
            Err(ClientError::Status { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let is_json_meta = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if !is_json_meta {
            let bytes = resp.bytes().await?.to_vec();
            let filename = descriptor
                .filename
                .clone()
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
            return Ok(Some(FetchedAttachment { filename, bytes }));
        }

        let final_url = resp.url().to_string();
        let bytes = resp.bytes().await?;
        let meta: JsonValue =
            serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode {
                url: final_url,
                source,
            })?;

        let Some(file_url) = pick_download_url(&meta) else {
            return Ok(None);
        };

        // Content URLs from the metadata document are pre-signed; no auth header.
        let file_resp = self.get_with_retry(file_url, false).await?;
        let content = file_resp.bytes().await?.to_vec();
        let filename = descriptor
            .filename
            .clone()
            .or_else(|| {
                meta.get("filename")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

        Ok(Some(FetchedAttachment {
            filename,
            bytes: content,
        }))
    }

    async fn get_with_retry(
        &self,
        url: &str,
        with_auth: bool,
    ) -> Result<reqwest::Response, ClientError> {
        let span = info_span!("form_fetch", url);
        async {
            let mut attempt = 0;
            loop {
                let mut request = self.http.get(url);
                if with_auth {
                    request = request.header("Authorization", format!("Token {}", self.token));
                }

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        let final_url = resp.url().to_string();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ClientError::Status {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(ClientError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Picks the content URL out of an attachment metadata document, trying the
/// alternative keys in priority order.
pub fn pick_download_url(meta: &JsonValue) -> Option<&str> {
    DOWNLOAD_URL_KEYS
        .iter()
        .find_map(|key| meta.get(*key).and_then(JsonValue::as_str))
        .filter(|url| !url.is_empty())
}
