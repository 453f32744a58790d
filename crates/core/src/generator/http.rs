//! Generator backed by an HTTP inference service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{GenerationError, GenerationProgress, Generator};
use crate::config::GeneratorConfig;
use crate::pipeline::PipelineHandle;

#[derive(Debug, Serialize)]
struct ModelRef<'a> {
    reference: &'a str,
    path: String,
}

#[derive(Debug, Serialize)]
struct AdapterRef<'a> {
    reference: &'a str,
    path: String,
    weight: f32,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    checkpoint: ModelRef<'a>,
    adapters: Vec<AdapterRef<'a>>,
    params: &'a serde_json::Value,
}

/// POSTs `{checkpoint, adapters, params}` to the configured endpoint and
/// returns the JSON body as the task result.
pub struct HttpGenerator {
    client: Client,
    endpoint: String,
}

impl HttpGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    fn request_body<'a>(
        pipeline: &'a PipelineHandle,
        params: &'a serde_json::Value,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            checkpoint: ModelRef {
                reference: &pipeline.checkpoint.reference,
                path: pipeline.checkpoint.path.display().to_string(),
            },
            adapters: pipeline
                .adapters
                .iter()
                .map(|a| AdapterRef {
                    reference: &a.handle.reference,
                    path: a.handle.path.display().to_string(),
                    weight: a.spec.weight,
                })
                .collect(),
            params,
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn execute(
        &self,
        pipeline: &PipelineHandle,
        params: &serde_json::Value,
        progress_tx: mpsc::Sender<GenerationProgress>,
    ) -> Result<serde_json::Value, GenerationError> {
        debug!(endpoint = %self.endpoint, checkpoint = %pipeline.checkpoint.reference, "Sending generation request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&Self::request_body(pipeline, params))
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Failed(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        // The backend answers only when done
        let _ = progress_tx.try_send(GenerationProgress::from_steps(1, 1));

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_store::ModelHandle;
    use crate::pipeline::LoadedAdapter;
    use crate::task::AdapterSpec;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn pipeline() -> PipelineHandle {
        PipelineHandle {
            checkpoint: ModelHandle {
                reference: "A".to_string(),
                path: PathBuf::from("/models/A.safetensors"),
                size_bytes: 10,
            },
            adapters: vec![LoadedAdapter {
                spec: AdapterSpec::new("L1", 0.5),
                handle: ModelHandle {
                    reference: "L1".to_string(),
                    path: PathBuf::from("/models/L1.safetensors"),
                    size_bytes: 5,
                },
            }],
        }
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
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
        (format!("http://{}/generate", addr), handle)
    }

    #[test]
    fn test_request_body_shape() {
        let pipeline = pipeline();
        let params = serde_json::json!({"prompt": "a red fox"});
        let body = serde_json::to_value(HttpGenerator::request_body(&pipeline, &params)).unwrap();

        assert_eq!(body["checkpoint"]["reference"], "A");
        assert_eq!(body["adapters"][0]["reference"], "L1");
        assert_eq!(body["adapters"][0]["weight"], 0.5);
        assert_eq!(body["params"]["prompt"], "a red fox");
    }

    #[tokio::test]
    async fn test_execute_returns_backend_json() {
        let (endpoint, server) = serve_once("HTTP/1.1 200 OK", r#"{"images":["out/1.png"]}"#).await;
        let generator = HttpGenerator::new(&GeneratorConfig {
            endpoint,
            timeout_secs: 5,
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let result = generator
            .execute(&pipeline(), &serde_json::json!({"prompt": "x"}), tx)
            .await
            .unwrap();

        assert_eq!(result["images"][0], "out/1.png");
        assert_eq!(rx.recv().await.unwrap().fraction, 1.0);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /generate"));
        assert!(request.contains("\"reference\":\"L1\""));
    }

    #[tokio::test]
    async fn test_non_success_status_fails_task() {
        let (endpoint, _server) =
            serve_once("HTTP/1.1 500 Internal Server Error", r#"{"error":"CUDA OOM"}"#).await;
        let generator = HttpGenerator::new(&GeneratorConfig {
            endpoint,
            timeout_secs: 5,
        })
        .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let err = generator
            .execute(&pipeline(), &serde_json::Value::Null, tx)
            .await
            .unwrap_err();
        match err {
            GenerationError::Failed(msg) => assert!(msg.contains("CUDA OOM")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
