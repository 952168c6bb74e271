//! Configuration management (`storyforge.toml`).
//!
//! Every section is `#[serde(default)]`, so a missing file or a partial file
//! yields working defaults. Resolution order for the file:
//! 1. an explicit path (`--config`)
//! 2. `./storyforge.toml`
//! 3. `$XDG_CONFIG_HOME/storyforge/storyforge.toml`

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const CONFIG_FILE_NAME: &str = "storyforge.toml";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly colored output
    #[default]
    Pretty,
    /// Machine-parseable JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub generation: GenerationConfig,
    pub context: ContextConfig,
    pub index: IndexConfig,
    pub backend: BackendConfig,
    pub logging: crate::logging::LogConfig,
    pub storage: StorageConfig,
}

/// Candidate generation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Global cap on simultaneously in-flight backend calls, across projects.
    pub max_concurrent_generations: usize,
    /// Retries per slot after the first attempt.
    pub retry_count: u32,
    /// First backoff delay; doubles on each retry.
    pub retry_backoff_base_ms: u64,
    pub candidates_per_unit: u32,
    /// Applies from the moment a request is issued, not while queued.
    pub request_timeout_ms: u64,
    pub evaluation_enabled: bool,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Consecutive backend failures before the circuit opens.
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_generations: 3,
            retry_count: 3,
            retry_backoff_base_ms: 500,
            candidates_per_unit: 3,
            request_timeout_ms: 120_000,
            evaluation_enabled: false,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.9,
            max_output_tokens: 4_096,
            circuit_failure_threshold: 8,
            circuit_cooldown_ms: 30_000,
        }
    }
}

impl GenerationConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Layered context sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub context_budget_tokens: usize,
    /// Retrieved chunks promoted to the important tier.
    pub important_top_k: usize,
    /// Further retrieved chunks offered to the reference tier.
    pub reference_top_k: usize,
    /// How many preceding units contribute a compressed summary.
    pub preceding_summaries: usize,
    /// Characters of the previous unit carried as its ending state.
    pub ending_chars: usize,
    /// Non-CJK characters per estimated token.
    pub chars_per_token: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_budget_tokens: 6_000,
            important_top_k: 8,
            reference_top_k: 16,
            preceding_summaries: 3,
            ending_chars: 800,
            chars_per_token: 4,
        }
    }
}

/// Chunking / embedding knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dimension: usize,
    pub max_chunk_chars: usize,
    pub min_chunk_chars: usize,
    /// Size of the embedding worker pool per reindex call.
    pub embed_workers: usize,
    /// Retries per chunk after the first embedding attempt.
    pub embed_retry_count: u32,
    pub prefer_accelerated: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 256,
            max_chunk_chars: 1_200,
            min_chunk_chars: 80,
            embed_workers: 4,
            embed_retry_count: 2,
            prefer_accelerated: true,
        }
    }
}

/// Remote generation backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "STORYFORGE_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("storyforge.db"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("storyforge")
}

/// Find the config file to load, if any.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("storyforge").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}

impl Config {
    /// Load configuration, falling back to defaults when no file is found.
    ///
    /// An explicit path that does not exist is an error; an implicit one is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = resolve_config_path(explicit) else {
            tracing::debug!("No config file found; using defaults");
            return Ok(Self::default());
        };
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()).into());
        if self.generation.max_concurrent_generations == 0 {
            return fail("generation.max_concurrent_generations must be at least 1");
        }
        if self.generation.candidates_per_unit == 0 {
            return fail("generation.candidates_per_unit must be at least 1");
        }
        if self.generation.request_timeout_ms == 0 {
            return fail("generation.request_timeout_ms must be positive");
        }
        if self.index.dimension == 0 {
            return fail("index.dimension must be at least 1");
        }
        if self.index.embed_workers == 0 {
            return fail("index.embed_workers must be at least 1");
        }
        if self.index.min_chunk_chars > self.index.max_chunk_chars {
            return fail("index.min_chunk_chars must not exceed index.max_chunk_chars");
        }
        if self.context.chars_per_token == 0 {
            return fail("context.chars_per_token must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn named_options_parse_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [generation]
            max_concurrent_generations = 2
            retry_count = 5
            retry_backoff_base_ms = 250
            candidates_per_unit = 4

            [context]
            context_budget_tokens = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.generation.max_concurrent_generations, 2);
        assert_eq!(config.generation.retry_count, 5);
        assert_eq!(config.generation.retry_backoff_base_ms, 250);
        assert_eq!(config.generation.candidates_per_unit, 4);
        assert_eq!(config.context.context_budget_tokens, 9000);
        // untouched sections keep defaults
        assert_eq!(config.index, IndexConfig::default());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = Config::from_toml_str("[generation]\nmax_concurrent_generations = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_generations"));
    }

    #[test]
    fn chunk_bounds_validated() {
        let err = Config::from_toml_str("[index]\nmin_chunk_chars = 500\nmax_chunk_chars = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("min_chunk_chars"));
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let err = Config::from_toml_str("[generation\n").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::ParseFailed(_))
        ));
    }

    #[test]
    fn explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\nformat = \"json\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = Config::default();
        config.generation.candidates_per_unit = 5;
        config.index.prefer_accelerated = false;
        let text = config.to_toml_string().unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
