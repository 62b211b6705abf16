//! HTTP transport over reqwest, for both upstream flavors.

use async_trait::async_trait;
use surge_common::{Result, SurgeError};
use tokio_stream::StreamExt as _;

use crate::{ByteStream, StreamTransport};

/// Which upstream the bench talks to. Both stream newline-separated
/// records; the proxy additionally wraps them in `data: ` SSE framing,
/// which the frame decoder strips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// `POST {base}/api/chat` against Ollama itself (NDJSON).
    OllamaChat,
    /// `POST {base}/chat/stream` against the surge proxy (SSE).
    ProxyStream,
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    endpoint: Endpoint,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, endpoint: Endpoint) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| SurgeError::Transport(format!("failed to build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url, endpoint })
    }

    /// Transport straight against a local Ollama server.
    pub fn ollama(base_url: impl Into<String>) -> Result<Self> {
        Self::new(base_url, Endpoint::OllamaChat)
    }

    /// Transport against the surge proxy's SSE endpoint.
    pub fn proxy(base_url: impl Into<String>) -> Result<Self> {
        Self::new(base_url, Endpoint::ProxyStream)
    }

    fn url(&self) -> String {
        match self.endpoint {
            Endpoint::OllamaChat => format!("{}/api/chat", self.base_url),
            Endpoint::ProxyStream => format!("{}/chat/stream", self.base_url),
        }
    }

    fn body(&self, level: u32, message: &str, model: &str) -> serde_json::Value {
        match self.endpoint {
            Endpoint::OllamaChat => serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": message}],
                "stream": true,
            }),
            Endpoint::ProxyStream => serde_json::json!({
                "concurrency": level,
                "message": message,
                "model": model,
            }),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn start_run(&self, level: u32, message: &str, model: &str) -> Result<ByteStream> {
        let url = self.url();
        tracing::debug!(target: "transport", level, %url, "starting streaming run");

        let response = self
            .client
            .post(&url)
            .json(&self.body(level, message, model))
            .send()
            .await
            .map_err(|e| SurgeError::Transport(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SurgeError::Transport(format!(
                "upstream returned {status}: {detail}"
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SurgeError::Transport(format!("stream read failed: {e}"))));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let t = HttpTransport::ollama("http://localhost:11434/").unwrap();
        assert_eq!(t.url(), "http://localhost:11434/api/chat");
        let t = HttpTransport::proxy("http://localhost:8000").unwrap();
        assert_eq!(t.url(), "http://localhost:8000/chat/stream");
    }

    #[test]
    fn ollama_body_requests_streaming() {
        let t = HttpTransport::ollama("http://localhost:11434").unwrap();
        let body = t.body(3, "hi", "llama3");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["model"], "llama3");
    }

    #[test]
    fn proxy_body_carries_level() {
        let t = HttpTransport::proxy("http://localhost:8000").unwrap();
        let body = t.body(5, "hi", "llama3");
        assert_eq!(body["concurrency"], 5);
        assert_eq!(body["message"], "hi");
    }
}
