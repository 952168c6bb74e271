//! Embedding backend contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, IndexError};

#[derive(Error, Debug)]
pub enum EmbedError {
    /// Backend down, overloaded or timed out; worth retrying.
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused this input; retrying the same text will not help.
    #[error("embedding rejected: {0}")]
    Rejected(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbedError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<EmbedError> for Error {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::DimensionMismatch { expected, actual } => {
                Self::Index(IndexError::DimensionMismatch { expected, actual })
            }
            other => Self::Index(IndexError::Embedding(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedderInfo {
    pub name: String,
    pub dimension: usize,
}

/// Turns text into a fixed-length vector.
///
/// Implementations that call out over the network must not block the
/// calling thread; CPU-only embedders may compute inline.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn info(&self) -> EmbedderInfo;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn dimension(&self) -> usize {
        self.info().dimension
    }
}
