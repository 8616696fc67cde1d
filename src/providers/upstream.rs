//! Upstream LLM port
//!
//! The gateway forwards the (possibly augmented) request body as-is and
//! relays the upstream body as a byte stream, so streaming and non-streaming
//! responses share one path.

use crate::config::{resolve_api_key, UpstreamConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

/// Response head plus a body stream.
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl UpstreamResponse {
    /// Buffer the whole body.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

/// An OpenAI-compatible chat-completions endpoint.
#[async_trait]
pub trait ChatUpstream: Send + Sync {
    /// Send a chat-completions request.
    ///
    /// `authorization` is the client's header, used when no key is configured.
    async fn chat_completions(
        &self,
        body: &serde_json::Value,
        authorization: Option<&str>,
    ) -> Result<UpstreamResponse>;
}

/// reqwest-backed upstream
pub struct HttpUpstream {
    base_url: String,
    api_key: Option<String>,
    header_timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: resolve_api_key(config.api_key_env.as_deref()),
            header_timeout: Duration::from_millis(config.timeout_ms),
            http_client,
        })
    }
}

#[async_trait]
impl ChatUpstream for HttpUpstream {
    async fn chat_completions(
        &self,
        body: &serde_json::Value,
        authorization: Option<&str>,
    ) -> Result<UpstreamResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.http_client.post(&url).json(body);
        match (&self.api_key, authorization) {
            (Some(key), _) => req = req.bearer_auth(key),
            (None, Some(auth)) => req = req.header(reqwest::header::AUTHORIZATION, auth),
            (None, None) => {}
        }

        // Only the response head is time-bounded; streams may run long.
        let response = tokio::time::timeout(self.header_timeout, req.send())
            .await
            .map_err(|_| {
                Error::Upstream(format!(
                    "no response within {}ms",
                    self.header_timeout.as_millis()
                ))
            })?
            .map_err(|e| Error::Upstream(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Upstream(e.to_string())))
            .boxed();

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
