//! OpenAI-compatible `/chat/completions` client

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::{
    ChatMessage, CompletionClient, CompletionOptions, DEFAULT_TEMPERATURE, TextStream,
    dynamic_timeout,
};
use crate::config::LlmConfig;
use crate::{Error, Result};

/// Client for an OpenAI-compatible completion endpoint
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    base_timeout: Duration,
}

impl OpenAiCompatClient {
    /// Create a client for `base_url` (e.g. `https://host/compatible-mode/v1`)
    #[must_use]
    pub fn new(api_key: Option<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            base_timeout: super::BASE_TIMEOUT,
        }
    }

    /// Create a client from configuration
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.api_key.clone(), &config.base_url, &config.model)
            .with_base_timeout(config.base_timeout)
    }

    /// Override the base of the dynamic timeout
    #[must_use]
    pub const fn with_base_timeout(mut self, base: Duration) -> Self {
        self.base_timeout = base;
        self
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::Config("DASHSCOPE_API_KEY is not configured".to_string()))
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        });
        if options.json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages, options, stream);

        let resp = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("AI API network error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Llm(format!(
                "AI API error {}: {text}",
                status.as_u16()
            )));
        }
        Ok(resp)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    #[serde(default)]
    delta: ApiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| dynamic_timeout(self.base_timeout, messages));

        let call = async {
            let resp = self.send(messages, options, false).await?;
            let data: ApiResponse = resp.json().await?;
            Ok::<_, Error>(
                data.choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default(),
            )
        };

        let content = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::Llm(format!("AI API timeout after {}ms", timeout.as_millis())))??;

        if content.is_empty() {
            tracing::warn!(model = %self.model, "AI returned empty content");
        }
        Ok(content)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TextStream> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| dynamic_timeout(self.base_timeout, messages));

        // The timeout bounds the wait for response headers only
        let resp = tokio::time::timeout(timeout, self.send(messages, options, true))
            .await
            .map_err(|_| {
                Error::Llm(format!("AI API stream timeout after {}ms", timeout.as_millis()))
            })??;

        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }
}

/// Turn a server-sent-events body into content fragments
fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes).replace("\r\n", "\n"));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for fragment in parse_sse_event(&event_text) {
                            yield Ok(fragment);
                        }
                    }
                }
                Err(e) => {
                    yield Err(Error::Llm(format!("AI API stream error: {e}")));
                    return;
                }
            }
        }

        // Trailing event without a blank line
        for fragment in parse_sse_event(&buffer) {
            yield Ok(fragment);
        }
    }
}

/// Content fragments of one SSE event; `[DONE]` and undecodable data are skipped
fn parse_sse_event(event_text: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    for line in event_text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            continue;
        }

        match serde_json::from_str::<ApiStreamChunk>(data) {
            Ok(chunk) => {
                if let Some(content) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|c| !c.is_empty())
                {
                    fragments.push(content);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable stream event");
            }
        }
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn trims_trailing_slash() {
        let client = OpenAiCompatClient::new(None, "https://example.com/v1/", "qwen-plus");
        assert_eq!(client.base_url, "https://example.com/v1");
    }

    #[test]
    fn json_request_body() {
        let client = OpenAiCompatClient::new(None, "https://example.com/v1", "qwen-plus");
        let body = client.request_body(
            &[ChatMessage::user("hi")],
            &CompletionOptions::json(),
            false,
        );
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], Role::User.as_str());
        assert!(body.get("stream").is_none());
        assert!((body["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn sse_event_parsing() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}";
        assert_eq!(parse_sse_event(event), vec!["你好".to_string()]);
        assert!(parse_sse_event("data: [DONE]").is_empty());
        assert!(parse_sse_event("data: not json").is_empty());
        assert!(parse_sse_event(": keep-alive").is_empty());
    }

    #[tokio::test]
    async fn sse_stream_handles_split_chunks() {
        let parts: Vec<std::result::Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"打\"}}]}\n\ndata: {\"choices\":[{\"del",
            )),
            Ok(bytes::Bytes::from(
                "ta\":{\"content\":\"开\"}}]}\n\ndata: [DONE]\n\n",
            )),
        ];
        let fragments: Vec<String> = parse_sse_stream(futures::stream::iter(parts))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["打".to_string(), "开".to_string()]);
    }

    #[tokio::test]
    async fn missing_api_key_is_a_config_error() {
        let client = OpenAiCompatClient::new(None, "http://127.0.0.1:9", "qwen-plus");
        let err = client
            .complete(&[ChatMessage::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
