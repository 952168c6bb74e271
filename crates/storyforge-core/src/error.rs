//! Error types for storyforge-core

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation::BackendErrorKind;
use crate::lifecycle::ProjectPhase;
use crate::model::{GenerationStatus, UnitKey};

/// A shell command the user can run to diagnose or fix an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationCommand {
    pub label: String,
    pub command: String,
}

/// How to get out of an error: a summary, runnable `sf` commands and
/// free-form alternatives. Printed under `To fix:` by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub commands: Vec<RemediationCommand>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        let (label, command) = (label.into(), command.into());
        self.commands.push(RemediationCommand { label, command });
        self
    }

    #[must_use]
    pub fn alternative(mut self, text: impl Into<String>) -> Self {
        self.alternatives.push(text.into());
        self
    }

    /// Multi-line text block starting with `To fix:`.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = format!("To fix:\n  {}\n", self.summary);
        if !self.commands.is_empty() {
            out.push_str("  Commands:\n");
            for RemediationCommand { label, command } in &self.commands {
                let _ = writeln!(out, "    - {label}: {command}");
            }
        }
        if !self.alternatives.is_empty() {
            out.push_str("  Alternatives:\n");
            for text in &self.alternatives {
                let _ = writeln!(out, "    - {text}");
            }
        }
        out
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for storyforge-core
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generation orchestration errors
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Project lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Vector index / indexer errors
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operation was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Generation(err) => Some(err.remediation()),
            Self::Lifecycle(err) => Some(err.remediation()),
            Self::Index(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "sf config")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new(
                    "A stored JSON value could not be decoded. The database may come from \
                     a newer storyforge.",
                )
                .command("Show config", "sf config")
                .alternative("Point --db at a database written by this version."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command.")
                    .command("Unit status", "sf status <project> <unit>")
                    .alternative("If the issue persists, run with --log-level debug."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new(
                    "Operation was cancelled. Retry if the cancellation was unexpected.",
                )
                .command("Unit status", "sf status <project> <unit>")
                .alternative("Completed candidates were kept; only pending slots were dropped."),
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid database value: {0}")]
    InvalidDbValue(String),

    #[error("Integer conversion overflow for field: {0}")]
    IntegerOverflow(&'static str),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Show config", "sf config")
            .alternative("Ensure no other process holds a write lock on the database."),
            Self::InvalidDbValue(_) | Self::IntegerOverflow(_) => Remediation::new(
                "The database contains a value this version cannot read.",
            )
            .command("Show config", "sf config")
            .alternative("Restore the database from a backup written by a compatible version."),
            Self::Constraint(_) => Remediation::new(
                "The write would violate a data invariant and was rejected.",
            )
            .command("Unit status", "sf status <project> <unit>")
            .alternative("Reload the unit and retry with a candidate that belongs to it."),
            Self::NotFound(_) => Remediation::new("The requested record was not found.")
                .command("Unit status", "sf status <project> <unit>")
                .alternative("Verify the project id and unit number."),
        }
    }
}

/// Per-slot failure detail surfaced on operation-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFailure {
    pub slot: u32,
    pub attempts: u32,
    pub last_error: String,
}

/// Which fraction of a candidate batch failed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailureReport {
    pub unit: UnitKey,
    pub requested: u32,
    pub failed: u32,
    pub cancelled: bool,
    pub slots: Vec<SlotFailure>,
}

impl BatchFailureReport {
    /// Fraction of requested slots that failed (0.0..=1.0).
    #[must_use]
    pub fn failed_fraction(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        f64::from(self.failed) / f64::from(self.requested)
    }
}

impl std::fmt::Display for BatchFailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} candidate slots failed for {}",
            self.failed, self.requested, self.unit
        )?;
        for slot in &self.slots {
            write!(
                f,
                "; slot {} after {} attempt(s): {}",
                slot.slot, slot.attempts, slot.last_error
            )?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("all candidate slots failed: {0}")]
    BatchFailed(BatchFailureReport),

    #[error("generation backend error ({kind}): {message}")]
    Backend {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("generation circuit breaker is open; retry in {retry_after_ms} ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("unit {unit} is busy ({status})")]
    UnitBusy {
        unit: UnitKey,
        status: GenerationStatus,
    },

    #[error("unit {unit} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        unit: UnitKey,
        from: GenerationStatus,
        to: GenerationStatus,
    },

    #[error("candidate {candidate_id} does not belong to unit {unit}")]
    ForeignCandidate { unit: UnitKey, candidate_id: String },

    #[error("slot {slot} is out of range for unit {unit} ({slots} slots)")]
    SlotOutOfRange { unit: UnitKey, slot: u32, slots: u32 },

    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

impl GenerationError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::BatchFailed(report) => Remediation::new(format!(
                "Every candidate slot failed ({}/{}). Check the backend and retry the unit.",
                report.failed, report.requested
            ))
            .command("Retry the unit", format!("sf generate {} {}", report.unit.project_id, report.unit.ordinal))
            .alternative("Lower max_concurrent_generations if the backend is rate limiting."),
            Self::Backend { kind, .. } => match kind {
                BackendErrorKind::Timeout => Remediation::new(
                    "The backend did not answer in time. Long units need a longer timeout.",
                )
                .command("Show config", "sf config")
                .alternative("Increase generation.request_timeout_ms."),
                BackendErrorKind::RateLimited => Remediation::new(
                    "The backend is rate limiting requests. Wait, or send fewer at once.",
                )
                .alternative("Lower generation.max_concurrent_generations."),
                BackendErrorKind::Unavailable => Remediation::new(
                    "The generation backend is unreachable or failing. Check backend.base_url.",
                )
                .command("Show config", "sf config"),
                BackendErrorKind::InvalidRequest | BackendErrorKind::Malformed => {
                    Remediation::new(
                        "The backend rejected the request or sent an unusable reply. Check \
                         backend.model and the API key.",
                    )
                    .command("Show config", "sf config")
                    .alternative("Reduce context.context_budget_tokens if the prompt is too long.")
                }
                BackendErrorKind::ContentFiltered => Remediation::new(
                    "The backend's content filter blocked this unit. Revise the outline summary.",
                ),
            },
            Self::CircuitOpen { retry_after_ms } => Remediation::new(format!(
                "Generation backend circuit breaker is open. Retry after {retry_after_ms} ms."
            ))
            .command("Show config", "sf config")
            .alternative("Verify the backend is reachable before retrying."),
            Self::UnitBusy { unit, .. } => Remediation::new(
                "The unit already has a generation in progress. Wait for it to finish.",
            )
            .command("Unit status", format!("sf status {} {}", unit.project_id, unit.ordinal))
            .alternative("Cancel the project's in-flight generations to stop it early."),
            Self::InvalidStatusTransition { unit, .. } => Remediation::new(
                "The unit is not in a state that allows this operation.",
            )
            .command("Unit status", format!("sf status {} {}", unit.project_id, unit.ordinal))
            .alternative("Use regenerate to start over on a finalized unit."),
            Self::ForeignCandidate { unit, .. } => Remediation::new(
                "Select a candidate that was generated for this unit.",
            )
            .command("List candidates", format!("sf status {} {}", unit.project_id, unit.ordinal)),
            Self::SlotOutOfRange { unit, .. } => Remediation::new(
                "Retry a slot index that exists in the unit's last batch.",
            )
            .command("List slots", format!("sf status {} {}", unit.project_id, unit.ordinal)),
            Self::Evaluation(_) => Remediation::new(
                "Automated evaluation failed; candidates are still selectable by hand.",
            )
            .command("Show config", "sf config")
            .alternative("Disable evaluation_enabled to skip automated scoring."),
        }
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: ProjectPhase, to: ProjectPhase },

    #[error("operation {operation} is not permitted in phase {phase}")]
    OperationNotPermitted {
        operation: String,
        phase: ProjectPhase,
    },

    #[error("cannot complete project {project_id}: {pending} unit(s) are not done")]
    UnitsIncomplete { project_id: String, pending: usize },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),
}

impl LifecycleError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::IllegalTransition { .. } => Remediation::new(
                "That phase change is not allowed from the current phase.",
            )
            .command("Show project", "sf project <project>")
            .alternative("Move forward one phase at a time; rollbacks may skip phases."),
            Self::OperationNotPermitted { .. } => Remediation::new(
                "Move the project to a phase that allows this operation first.",
            )
            .command("Start drafting", "sf transition <project> drafting"),
            Self::UnitsIncomplete { project_id, .. } => Remediation::new(
                "Select a candidate for every outlined unit before completing the project.",
            )
            .command("Show project", format!("sf project {project_id}")),
            Self::ProjectNotFound(_) => Remediation::new("The project does not exist.")
                .command("Create a project", "sf init <bible.toml>"),
            Self::ProjectExists(project_id) => Remediation::new(
                "A project with this id already exists.",
            )
            .command("Show project", format!("sf project {project_id}"))
            .alternative("Choose a different project id."),
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid embedding vector: {0}")]
    InvalidVector(String),

    #[error("embedding backend error: {0}")]
    Embedding(String),
}

impl IndexError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::DimensionMismatch { .. } => Remediation::new(
                "The embedding model and the index disagree on vector size.",
            )
            .command("Show config", "sf config")
            .alternative("Set [index].dimension to the embedding model's output size and reindex."),
            Self::InvalidVector(_) => Remediation::new(
                "The embedding backend returned an unusable vector.",
            )
            .command("Reindex the unit", "sf index <project> <unit>"),
            Self::Embedding(_) => Remediation::new(
                "The embedding backend failed. Failed chunks are excluded until reindexed.",
            )
            .command("Reindex the unit", "sf index <project> <unit>"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show effective config", "sf config")
                .alternative("Validate the TOML syntax."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "sf config")
                    .alternative("Review validation errors and adjust storyforge.toml.")
            }
        }
    }
}

#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
