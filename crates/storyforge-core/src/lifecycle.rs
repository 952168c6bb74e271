//! Project lifecycle state machine.
//!
//! ```text
//! setup -> outlined -> drafting -> completed
//!   ^________|___________|____________|      (any backward move)
//! ```
//!
//! Forward moves advance one phase at a time. Backward moves may skip
//! phases; a rollback that leaves `drafting` (or `completed`) for an earlier
//! phase purges every unit's candidates, chunks and entity snapshots and
//! bumps the project epoch so batches still in flight discard their output.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coordination::{Coordination, KeyedMutex};
use crate::error::{LifecycleError, Result};
use crate::invalidation::CascadeInvalidator;
use crate::model::{GenerationStatus, now_epoch_ms};
use crate::store::SharedStore;

/// Project phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    /// Bible being written; no outline yet.
    Setup,
    /// Outline exists; unit generation not yet open.
    Outlined,
    /// Units may be generated and selected.
    Drafting,
    /// Every outlined unit is done.
    Completed,
}

impl ProjectPhase {
    pub const ALL: [Self; 4] = [Self::Setup, Self::Outlined, Self::Drafting, Self::Completed];

    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Setup => Some(Self::Outlined),
            Self::Outlined => Some(Self::Drafting),
            Self::Drafting => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Outlined => "outlined",
            Self::Drafting => "drafting",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "setup" => Some(Self::Setup),
            "outlined" => Some(Self::Outlined),
            "drafting" => Some(Self::Drafting),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether units can hold generated output in this phase.
    #[must_use]
    pub const fn holds_units(self) -> bool {
        matches!(self, Self::Drafting | Self::Completed)
    }
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(&s.to_ascii_lowercase()).ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// Operations gated by the permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    EditBible,
    SetOutline,
    Assemble,
    GenerateUnit,
    SelectCandidate,
    IndexUnit,
    DeleteUnit,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EditBible => "edit_bible",
            Self::SetOutline => "set_outline",
            Self::Assemble => "assemble",
            Self::GenerateUnit => "generate_unit",
            Self::SelectCandidate => "select_candidate",
            Self::IndexUnit => "index_unit",
            Self::DeleteUnit => "delete_unit",
        }
    }

    /// Permission matrix.
    #[must_use]
    pub const fn permitted_in(self, phase: ProjectPhase) -> bool {
        use ProjectPhase::{Completed, Drafting, Outlined, Setup};
        match self {
            Self::EditBible => matches!(phase, Setup | Outlined | Drafting),
            Self::SetOutline => matches!(phase, Setup | Outlined),
            Self::Assemble => matches!(phase, Outlined | Drafting | Completed),
            Self::GenerateUnit | Self::SelectCandidate => matches!(phase, Drafting),
            Self::IndexUnit | Self::DeleteUnit => matches!(phase, Drafting | Completed),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure transition rule: forward one step, or backward any distance.
///
/// Guards that need project data (e.g. "all units done" for completion) are
/// applied by [`LifecycleStateMachine::transition`].
#[must_use]
pub fn can_transition(current: ProjectPhase, target: ProjectPhase) -> bool {
    target < current || current.next() == Some(target)
}

/// One recorded phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: ProjectPhase,
    pub to: ProjectPhase,
    pub at: i64,
    /// Applied by the system (auto-complete, downgrade) rather than requested.
    pub automatic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Lifecycle state owned by a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub phase: ProjectPhase,
    pub history: Vec<PhaseTransition>,
    /// Bumped whenever generated output is purged by a rollback.
    pub epoch: u64,
}

impl ProjectState {
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            phase: ProjectPhase::Setup,
            history: Vec::new(),
            epoch: 0,
        }
    }

    /// Apply a move, recording it in history. Fails without side effect
    /// when the pure rule rejects it.
    pub fn apply(
        &mut self,
        target: ProjectPhase,
        automatic: bool,
        reason: Option<String>,
    ) -> Result<PhaseTransition> {
        if !can_transition(self.phase, target) {
            return Err(LifecycleError::IllegalTransition {
                from: self.phase,
                to: target,
            }
            .into());
        }
        let record = PhaseTransition {
            from: self.phase,
            to: target,
            at: now_epoch_ms(),
            automatic,
            reason,
        };
        self.phase = target;
        self.history.push(record.clone());
        Ok(record)
    }
}

/// Result of an explicit transition request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub project_id: String,
    pub from: ProjectPhase,
    pub to: ProjectPhase,
    pub purged_units: usize,
    pub purged_candidates: usize,
    pub purged_chunks: usize,
    pub epoch: u64,
}

/// Applies phase changes to stored projects, with cascading invalidation.
pub struct LifecycleStateMachine {
    store: SharedStore,
    invalidator: Arc<CascadeInvalidator>,
    coordination: Arc<Coordination>,
    /// Serializes read-modify-write of each project's state.
    state_locks: KeyedMutex<String>,
}

impl LifecycleStateMachine {
    #[must_use]
    pub fn new(
        store: SharedStore,
        invalidator: Arc<CascadeInvalidator>,
        coordination: Arc<Coordination>,
    ) -> Self {
        Self {
            store,
            invalidator,
            coordination,
            state_locks: KeyedMutex::new(),
        }
    }

    pub async fn state(&self, project_id: &str) -> Result<ProjectState> {
        self.store
            .project_state(project_id)
            .await?
            .ok_or_else(|| LifecycleError::ProjectNotFound(project_id.to_string()).into())
    }

    /// Reject `operation` unless the project's current phase allows it.
    pub async fn ensure_permitted(
        &self,
        project_id: &str,
        operation: Operation,
    ) -> Result<ProjectState> {
        let state = self.state(project_id).await?;
        if !operation.permitted_in(state.phase) {
            return Err(LifecycleError::OperationNotPermitted {
                operation: operation.to_string(),
                phase: state.phase,
            }
            .into());
        }
        Ok(state)
    }

    /// Number of outlined units not yet `done`.
    async fn pending_units(&self, project_id: &str) -> Result<usize> {
        let bible = self.store.bible(project_id).await?.unwrap_or_default();
        let units = self.store.list_units(project_id).await?;
        Ok(bible
            .unit_ordinals()
            .into_iter()
            .filter(|ordinal| {
                !units
                    .iter()
                    .any(|u| u.key.ordinal == *ordinal && u.status == GenerationStatus::Done)
            })
            .count())
    }

    /// Request a phase change.
    pub async fn transition(
        &self,
        project_id: &str,
        target: ProjectPhase,
    ) -> Result<TransitionReport> {
        let _state_lock = self.state_locks.lock(&project_id.to_string()).await;
        let mut state = self.state(project_id).await?;
        let from = state.phase;
        if !can_transition(from, target) {
            return Err(LifecycleError::IllegalTransition { from, to: target }.into());
        }

        match (from, target) {
            (ProjectPhase::Setup, ProjectPhase::Outlined) => {
                let bible = self.store.bible(project_id).await?.unwrap_or_default();
                if bible.outline.is_empty() {
                    return Err(LifecycleError::OperationNotPermitted {
                        operation: "outline (outline is empty)".to_string(),
                        phase: from,
                    }
                    .into());
                }
            }
            (ProjectPhase::Drafting, ProjectPhase::Completed) => {
                let pending = self.pending_units(project_id).await?;
                if pending > 0 {
                    return Err(LifecycleError::UnitsIncomplete {
                        project_id: project_id.to_string(),
                        pending,
                    }
                    .into());
                }
            }
            _ => {}
        }

        let mut report = TransitionReport {
            project_id: project_id.to_string(),
            from,
            to: target,
            purged_units: 0,
            purged_candidates: 0,
            purged_chunks: 0,
            epoch: state.epoch,
        };

        if from.holds_units() && !target.holds_units() {
            // stop new calls first, then wait out any batch that is persisting
            self.coordination.cancels.cancel(project_id);
            let _exclusive = self.coordination.projects.exclusive(project_id).await;

            // re-read under the guard; a batch may have advanced state meanwhile
            state = self.state(project_id).await?;
            let purge = self.invalidator.purge_project_units(project_id).await?;
            report.purged_units = purge.units;
            report.purged_candidates = purge.candidates;
            report.purged_chunks = purge.chunks;

            state.epoch = state.epoch.wrapping_add(1);
            state.apply(target, false, Some("rollback".to_string()))?;
            self.store.put_project_state(&state).await?;
            report.epoch = state.epoch;
            warn!(
                project_id,
                phase = %target,
                purged_units = report.purged_units,
                purged_candidates = report.purged_candidates,
                "Rolled back past drafting; generated output purged"
            );
            return Ok(report);
        }

        state.apply(target, false, None)?;
        self.store.put_project_state(&state).await?;
        report.epoch = state.epoch;
        info!(project_id, from = %from, phase = %target, "Project phase changed");
        Ok(report)
    }

    /// Leave `drafting` automatically once every outlined unit is done.
    pub async fn auto_complete(&self, project_id: &str) -> Result<Option<PhaseTransition>> {
        let _state_lock = self.state_locks.lock(&project_id.to_string()).await;
        let mut state = self.state(project_id).await?;
        if state.phase != ProjectPhase::Drafting {
            return Ok(None);
        }
        if self.pending_units(project_id).await? > 0 {
            return Ok(None);
        }
        let record = state.apply(
            ProjectPhase::Completed,
            true,
            Some("all units done".to_string()),
        )?;
        self.store.put_project_state(&state).await?;
        info!(project_id, phase = %ProjectPhase::Completed, "Project completed automatically");
        Ok(Some(record))
    }

    /// Re-enter `drafting` when a completed project loses a done unit.
    pub async fn downgrade_if_incomplete(
        &self,
        project_id: &str,
        reason: &str,
    ) -> Result<Option<PhaseTransition>> {
        let _state_lock = self.state_locks.lock(&project_id.to_string()).await;
        let mut state = self.state(project_id).await?;
        if state.phase != ProjectPhase::Completed {
            return Ok(None);
        }
        if self.pending_units(project_id).await? == 0 {
            return Ok(None);
        }
        let record = state.apply(ProjectPhase::Drafting, true, Some(reason.to_string()))?;
        self.store.put_project_state(&state).await?;
        warn!(project_id, reason, phase = %ProjectPhase::Drafting, "Project downgraded");
        Ok(Some(record))
    }

    /// Advance `setup -> outlined` once an outline exists.
    pub async fn outline_ready(&self, project_id: &str) -> Result<Option<PhaseTransition>> {
        let _state_lock = self.state_locks.lock(&project_id.to_string()).await;
        let mut state = self.state(project_id).await?;
        if state.phase != ProjectPhase::Setup {
            return Ok(None);
        }
        let bible = self.store.bible(project_id).await?.unwrap_or_default();
        if bible.outline.is_empty() {
            return Ok(None);
        }
        let record = state.apply(
            ProjectPhase::Outlined,
            true,
            Some("outline set".to_string()),
        )?;
        self.store.put_project_state(&state).await?;
        Ok(Some(record))
    }
}
