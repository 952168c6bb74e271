//! Structured logging for storyforge
//!
//! Uses `tracing` with a pretty or JSON-lines layer on stderr and an
//! optional log file in the same format.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `project_id`: Project identifier
//! - `unit`: Unit key (`project#ordinal`)
//! - `slot`, `attempt`: Candidate slot and attempt number within a batch
//! - `candidate_id`: Persisted candidate identifier
//! - `chunk_id`: Indexed chunk identifier
//! - `phase`: Project lifecycle phase
//!
//! Never log generated prose at info level or above; log lengths and hashes.

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub use crate::config::LogFormat;

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `storyforge_core::generation=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,

    pub format: LogFormat,

    /// When set, logs are also appended here (created 0600 on unix)
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("cannot open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build one output layer in `format`, writing to `writer`.
fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(SystemTime)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Filter from `RUST_LOG`, else from the configured directive.
fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|_| LogError::InvalidFilter(level.to_string()))
}

fn open_log_file(path: &Path) -> Result<File, LogError> {
    let wrap = |source| LogError::File {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    let existed = path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(wrap)?;
    }
    Ok(file)
}

/// Install the global subscriber. Call once at startup; later calls return
/// `LogError::AlreadyInitialized`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = build_filter(&config.level)?;
    let mut layers: Vec<BoxedLayer> = vec![output_layer(
        config.format,
        io::stderr,
        io::stderr().is_terminal(),
    )];
    if let Some(path) = &config.file {
        let file = open_log_file(path)?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    tracing::subscriber::set_global_default(Registry::default().with(layers).with(filter))?;
    let _ = LOGGING_INITIALIZED.set(());

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

/// Create a span carrying storyforge correlation fields.
///
/// ```ignore
/// let span = storyforge_core::sf_span!("generate_unit", project_id = "p1", unit = 3);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! sf_span {
    ($name:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::info_span!($name $(, $field = $value)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn filter_accepts_directives_and_rejects_garbage() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter("warn,storyforge_core::generation=debug").is_ok());
        assert!(matches!(
            build_filter("storyforge_core=loudest"),
            Err(LogError::InvalidFilter(_))
        ));
    }

    #[test]
    fn json_layer_flattens_correlation_fields() {
        let capture = Capture::default();
        let subscriber = Registry::default().with(output_layer(
            LogFormat::Json,
            capture.clone(),
            false,
        ));

        tracing::subscriber::with_default(subscriber, || {
            let span = crate::sf_span!("generate_unit", project_id = "p1");
            let _guard = span.enter();
            tracing::info!(unit = "p1#2", slot = 0_u32, "slot started");
        });

        let value: serde_json::Value = serde_json::from_str(capture.contents().trim()).unwrap();
        assert_eq!(value["unit"], "p1#2");
        assert_eq!(value["slot"], 0);
        assert_eq!(value["message"], "slot started");
        assert_eq!(value["span"]["project_id"], "p1");
    }

    #[test]
    fn log_file_is_created_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("nested").join("sf.log");
        open_log_file(&path).unwrap();
        assert!(path.is_file());
        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
