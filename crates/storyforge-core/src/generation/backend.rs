//! Generation backend contract.
//!
//! Backends never return a bare string or a loosely-typed map: every reply is
//! parsed once, at the boundary, into a [`BackendResult`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::model::UnitKey;

/// One completion request for one candidate slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub unit: UnitKey,
    pub slot: u32,
    pub attempt: u32,
    pub system: String,
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Applies once the request is issued, not while it waits for a gate permit.
    pub timeout_ms: u64,
}

impl GenerationRequest {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Timeout,
    RateLimited,
    Unavailable,
    InvalidRequest,
    ContentFiltered,
    Malformed,
}

impl BackendErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::InvalidRequest => "invalid_request",
            Self::ContentFiltered => "content_filtered",
            Self::Malformed => "malformed",
        }
    }

    /// Worth another attempt after backoff.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Unavailable)
    }

    /// Map an HTTP status code from an OpenAI-compatible endpoint.
    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::Unavailable,
            _ => Self::InvalidRequest,
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strictly tagged backend reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendResult {
    Ok { text: String },
    Error { kind: BackendErrorKind, message: String },
}

impl BackendResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self::Ok { text: text.into() }
    }

    pub fn error(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Convert into the crate error space. Empty text counts as malformed.
    pub fn into_result(self) -> Result<String, GenerationError> {
        match self {
            Self::Ok { text } if text.trim().is_empty() => Err(GenerationError::Backend {
                kind: BackendErrorKind::Malformed,
                message: "backend returned empty text".to_string(),
            }),
            Self::Ok { text } => Ok(text),
            Self::Error { kind, message } => Err(GenerationError::Backend { kind, message }),
        }
    }

    /// Parse an OpenAI-compatible `/chat/completions` response body.
    #[must_use]
    pub fn from_chat_completion(body: &str) -> Self {
        let parsed: ChatResponse = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Self::error(
                    BackendErrorKind::Malformed,
                    format!("failed to parse completion: {err}"),
                );
            }
        };
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Self::error(BackendErrorKind::Malformed, "completion has no choices");
        };
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Self::error(
                BackendErrorKind::ContentFiltered,
                "completion stopped by content filter",
            );
        }
        match choice.message.content {
            Some(text) if !text.trim().is_empty() => Self::ok(text),
            _ => Self::error(BackendErrorKind::Malformed, "completion has empty content"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// External text-generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &GenerationRequest) -> BackendResult;
}
