//! OpenAI-compatible `/chat/completions` backend over HTTP.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::debug;

use super::backend::{BackendErrorKind, BackendResult, GenerationBackend, GenerationRequest};
use crate::config::BackendConfig;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Build a client for `config.base_url`, reading the key from the
    /// environment variable named by `config.api_key_env`.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let api_key = if config.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&config.api_key_env).ok()
        };
        Self::new(&config.base_url, api_key)
    }

    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("backend.base_url is empty".to_string()).into());
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::ValidationError(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &GenerationRequest) -> BackendResult {
        let body = ChatRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .headers(self.headers())
            .timeout(request.timeout())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return BackendResult::error(BackendErrorKind::Timeout, err.to_string());
            }
            Err(err) => return BackendResult::error(BackendErrorKind::Unavailable, err.to_string()),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) if err.is_timeout() => {
                return BackendResult::error(BackendErrorKind::Timeout, err.to_string());
            }
            Err(err) => return BackendResult::error(BackendErrorKind::Malformed, err.to_string()),
        };
        debug!(
            unit = %request.unit,
            slot = request.slot,
            status = status.as_u16(),
            bytes = text.len(),
            "Backend responded"
        );

        if !status.is_success() {
            return BackendResult::error(
                BackendErrorKind::from_http_status(status.as_u16()),
                format!("HTTP {status}: {}", text.chars().take(300).collect::<String>()),
            );
        }
        BackendResult::from_chat_completion(&text)
    }
}
