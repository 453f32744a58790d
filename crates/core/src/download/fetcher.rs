//! Byte sources for downloads.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use reqwest::{Client, Proxy, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

use super::retry::{classify_status, ErrorKind};
use crate::config::{DownloadConfig, ProxyConfig};

/// Errors raised while opening or reading a transfer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("fetcher configuration error: {0}")]
    Config(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout(_) => ErrorKind::Timeout,
            FetchError::Connection(_) => ErrorKind::Connection,
            FetchError::Status { status, .. } => classify_status(*status),
            FetchError::Config(_) => ErrorKind::Permanent,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

/// An open transfer.
pub struct FetchResponse {
    /// Whether the body starts at the requested offset. False means the
    /// server sent the whole resource.
    pub resumed: bool,
    /// Size of the whole resource, when the server announced it.
    pub total_size: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, FetchError>>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("resumed", &self.resumed)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Opens transfers, optionally continuing from a byte offset.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse, FetchError>;
}

/// Parse the total out of `Content-Range: bytes <start>-<end>/<total>`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

/// HTTP(S) fetcher built on reqwest.
pub struct HttpFetcher {
    client: Client,
    /// Bearer token and the origin it is sent to.
    auth: Option<(String, String)>,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig, proxy: &ProxyConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone());

        if let Some(url) = proxy.http.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.proxy(Proxy::http(url).map_err(|e| FetchError::Config(e.to_string()))?);
        }
        if let Some(url) = proxy.https.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.proxy(Proxy::https(url).map_err(|e| FetchError::Config(e.to_string()))?);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Config(e.to_string()))?;

        Ok(Self { client, auth: None })
    }

    /// Send `Authorization: Bearer <token>` to URLs on the same origin as
    /// `base_url`.
    pub fn with_bearer_token(mut self, base_url: &str, token: &str) -> Result<Self, FetchError> {
        let origin = Url::parse(base_url)
            .map_err(|e| FetchError::Config(format!("invalid base url {}: {}", base_url, e)))?
            .origin()
            .ascii_serialization();
        self.auth = Some((origin, token.to_string()));
        Ok(self)
    }

    fn token_for(&self, url: &str) -> Option<&str> {
        let (origin, token) = self.auth.as_ref()?;
        let target = Url::parse(url).ok()?.origin().ascii_serialization();
        (target == *origin).then_some(token.as_str())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse, FetchError> {
        debug!(url = %url, offset, "Opening transfer");

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        if let Some(token) = self.token_for(url) {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(FetchError::from_reqwest)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total_size = if resumed {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            response.content_length()
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(FetchError::from_reqwest))
            .boxed();

        Ok(FetchResponse {
            resumed,
            total_size,
            body,
        })
    }
}
