//! Civitai model version lookup.
//!
//! Turns a `(model_id, version_id)` pair into a [`SourceDescriptor`] for
//! the version's primary file.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::{PlatformRef, SourceDescriptor};
use crate::config::{CivitaiConfig, ProxyConfig};

pub const PLATFORM: &str = "civitai";

/// Errors from the Civitai API.
#[derive(Debug, Error)]
pub enum CivitaiError {
    #[error("Model version not found: {0}")]
    NotFound(String),

    #[error("Civitai rejected the API key")]
    Unauthorized,

    #[error("Civitai API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Model version {0} has no files")]
    NoFiles(String),

    #[error("Failed to parse Civitai response: {0}")]
    ParseError(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    name: String,
    #[serde(default)]
    model: Option<VersionModel>,
    #[serde(default)]
    files: Vec<VersionFile>,
}

#[derive(Debug, Deserialize)]
struct VersionModel {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionFile {
    name: String,
    download_url: String,
    #[serde(default)]
    primary: bool,
    #[serde(rename = "sizeKB", default)]
    size_kb: Option<f64>,
    #[serde(default)]
    hashes: FileHashes,
}

#[derive(Debug, Default, Deserialize)]
struct FileHashes {
    #[serde(rename = "SHA256", default)]
    sha256: Option<String>,
}

/// Civitai API client.
pub struct CivitaiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CivitaiClient {
    pub fn new(config: &CivitaiConfig, proxy: &ProxyConfig) -> Result<Self, CivitaiError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if let Some(url) = proxy.https.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::https(url)?);
        }
        if let Some(url) = proxy.http.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::http(url)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    /// Look up a model version and describe its primary file.
    pub async fn resolve(
        &self,
        model_id: &str,
        version_id: &str,
    ) -> Result<SourceDescriptor, CivitaiError> {
        let url = format!("{}/model-versions/{}", self.base_url, version_id);

        debug!("Civitai get model version: model={}, version={}", model_id, version_id);

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == 404 {
            return Err(CivitaiError::NotFound(version_id.to_string()));
        }
        if status == 401 || status == 403 {
            return Err(CivitaiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CivitaiError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let version: VersionResponse = response
            .json()
            .await
            .map_err(|e| CivitaiError::ParseError(e.to_string()))?;

        source_from_version(model_id, version_id, version)
    }
}

fn source_from_version(
    model_id: &str,
    version_id: &str,
    version: VersionResponse,
) -> Result<SourceDescriptor, CivitaiError> {
    let VersionResponse { name, model, files } = version;

    let index = files
        .iter()
        .position(|f| f.primary || f.name.ends_with(".safetensors"))
        .unwrap_or(0);
    let file = files
        .into_iter()
        .nth(index)
        .ok_or_else(|| CivitaiError::NoFiles(version_id.to_string()))?;

    let (model_name, model_kind) = match model {
        Some(m) => (Some(m.name), m.kind.map(|k| k.to_lowercase())),
        None => (None, None),
    };

    Ok(SourceDescriptor {
        url: file.download_url,
        filename: file.name,
        expected_sha256: file
            .hashes
            .sha256
            .filter(|h| !h.is_empty())
            .map(|h| h.to_ascii_uppercase()),
        expected_size: file
            .size_kb
            .filter(|kb| *kb > 0.0)
            .map(|kb| (kb * 1024.0).round() as u64),
        model_name,
        version_name: Some(name),
        model_kind: model_kind.or_else(|| Some("checkpoint".to_string())),
        platform: Some(PlatformRef {
            platform: PLATFORM.to_string(),
            model_id: model_id.to_string(),
            version_id: version_id.to_string(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const VERSION_JSON: &str = r#"{
        "id": 42,
        "modelId": 7,
        "name": "v2.0",
        "model": {"name": "Dreamy", "type": "LORA"},
        "files": [
            {"name": "preview.zip", "downloadUrl": "https://civitai.com/api/download/models/1", "sizeKB": 10},
            {"name": "dreamy.safetensors", "downloadUrl": "https://civitai.com/api/download/models/42",
             "sizeKB": 2.5, "hashes": {"SHA256": "abcdef"}}
        ]
    }"#;

    fn parse(json: &str) -> VersionResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_picks_safetensors_file() {
        let source = source_from_version("7", "42", parse(VERSION_JSON)).unwrap();

        assert_eq!(source.url, "https://civitai.com/api/download/models/42");
        assert_eq!(source.filename, "dreamy.safetensors");
        assert_eq!(source.expected_sha256.as_deref(), Some("ABCDEF"));
        assert_eq!(source.expected_size, Some(2560));
        assert_eq!(source.model_name.as_deref(), Some("Dreamy"));
        assert_eq!(source.version_name.as_deref(), Some("v2.0"));
        assert_eq!(source.model_kind.as_deref(), Some("lora"));
        assert_eq!(
            source.platform,
            Some(PlatformRef {
                platform: "civitai".to_string(),
                model_id: "7".to_string(),
                version_id: "42".to_string(),
            })
        );
    }

    #[test]
    fn test_primary_flag_wins_over_order() {
        let json = r#"{"name": "v1", "files": [
            {"name": "a.ckpt", "downloadUrl": "u1"},
            {"name": "b.ckpt", "downloadUrl": "u2", "primary": true}
        ]}"#;
        let source = source_from_version("1", "2", parse(json)).unwrap();
        assert_eq!(source.url, "u2");
        assert_eq!(source.model_kind.as_deref(), Some("checkpoint"));
    }

    #[test]
    fn test_falls_back_to_first_file() {
        let json = r#"{"name": "v1", "files": [
            {"name": "a.ckpt", "downloadUrl": "u1"},
            {"name": "b.pt", "downloadUrl": "u2"}
        ]}"#;
        let source = source_from_version("1", "2", parse(json)).unwrap();
        assert_eq!(source.url, "u1");
        assert!(source.expected_sha256.is_none());
        assert!(source.expected_size.is_none());
    }

    #[test]
    fn test_no_files() {
        let json = r#"{"name": "v1", "files": []}"#;
        assert!(matches!(
            source_from_version("1", "2", parse(json)),
            Err(CivitaiError::NoFiles(_))
        ));
    }

    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || String::from_utf8_lossy(&request).contains("\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}/api/v1", addr), handle)
    }

    #[tokio::test]
    async fn test_resolve_sends_token() {
        let (base_url, server) = serve_once("HTTP/1.1 200 OK", VERSION_JSON).await;
        let client = CivitaiClient::new(
            &CivitaiConfig {
                base_url,
                api_key: Some("key".to_string()),
                timeout_secs: 5,
            },
            &ProxyConfig::default(),
        )
        .unwrap();

        let source = client.resolve("7", "42").await.unwrap();
        assert_eq!(source.filename, "dreamy.safetensors");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/model-versions/42"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer key"));
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let (base_url, _server) = serve_once("HTTP/1.1 404 Not Found", "{}").await;
        let client = CivitaiClient::new(
            &CivitaiConfig {
                base_url,
                api_key: None,
                timeout_secs: 5,
            },
            &ProxyConfig::default(),
        )
        .unwrap();

        assert!(matches!(
            client.resolve("7", "42").await,
            Err(CivitaiError::NotFound(v)) if v == "42"
        ));
    }
}
