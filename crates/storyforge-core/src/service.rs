//! `StoryEngine`: the request-facing surface over store, index, assembler,
//! orchestrator and lifecycle.
//!
//! Every operation checks the project's phase first, loads the project's
//! persisted embeddings into the vector index on first use, and returns
//! serde-serializable views.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerStatus;
use crate::config::Config;
use crate::context::{ContextAssembler, EntityIndex, LayeredContext};
use crate::coordination::Coordination;
use crate::error::{BatchFailureReport, LifecycleError, Result, StorageError};
use crate::generation::{
    ConcurrencyGate, GenerateReport, GenerationBackend, GenerationOrchestrator,
    HeuristicEvaluator, SelectReport,
};
use crate::invalidation::CascadeInvalidator;
use crate::lifecycle::{
    LifecycleStateMachine, Operation, PhaseTransition, ProjectPhase, ProjectState,
    TransitionReport,
};
use crate::model::{
    CandidateId, Character, ChunkState, GenerationStatus, OutlineEntry, ProjectBible, Unit,
    UnitKey, WorldFact,
};
use crate::search::{Embedder, HashEmbedder, IndexStats, Indexer, ReindexReport, VectorIndex};
use crate::store::{SharedStore, SqliteStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateView {
    pub id: CandidateId,
    pub slot: u32,
    pub attempt: u32,
    pub word_count: usize,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    pub selected: bool,
    pub created_at: i64,
}

/// Status of one unit with its candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatusView {
    pub unit: UnitKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<CandidateId>,
    pub last_batch_slots: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<BatchFailureReport>,
    pub candidates: Vec<CandidateView>,
    pub indexed_chunks: usize,
    pub failed_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub ordinal: u32,
    pub title: String,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<CandidateId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectView {
    pub state: ProjectState,
    pub title: String,
    pub units: Vec<UnitSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOutcome {
    #[serde(flatten)]
    pub report: SelectReport,
    /// Set when this selection completed the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_change: Option<PhaseTransition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub unit: UnitKey,
    pub existed: bool,
    /// Set when the deletion moved a completed project back to drafting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_change: Option<PhaseTransition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub index: IndexStats,
    pub circuit: CircuitBreakerStatus,
    pub gate_capacity: usize,
    pub gate_in_flight: usize,
}

pub struct StoryEngine {
    config: Config,
    store: SharedStore,
    indexer: Arc<Indexer>,
    assembler: ContextAssembler,
    orchestrator: GenerationOrchestrator,
    lifecycle: LifecycleStateMachine,
    coordination: Arc<Coordination>,
    warmed: Mutex<HashSet<String>>,
}

impl StoryEngine {
    /// Engine with its own concurrency gate sized from the config.
    #[must_use]
    pub fn new(
        config: Config,
        store: SharedStore,
        backend: Arc<dyn GenerationBackend>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let gate = Arc::new(ConcurrencyGate::new(
            config.generation.max_concurrent_generations,
        ));
        Self::with_gate(config, store, backend, embedder, gate)
    }

    /// Engine sharing `gate` with other engines in the process.
    #[must_use]
    pub fn with_gate(
        config: Config,
        store: SharedStore,
        backend: Arc<dyn GenerationBackend>,
        embedder: Arc<dyn Embedder>,
        gate: Arc<ConcurrencyGate>,
    ) -> Self {
        let coordination = Arc::new(Coordination::new());
        let index = Arc::new(VectorIndex::from_config(&config.index));
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&embedder),
            &config.index,
        ));
        let entities = Arc::new(EntityIndex::new(Arc::clone(&store)));
        let invalidator = Arc::new(CascadeInvalidator::new(
            Arc::clone(&store),
            Arc::clone(&indexer),
            Arc::clone(&entities),
        ));
        let assembler = ContextAssembler::new(
            Arc::clone(&store),
            index,
            embedder,
            entities,
            config.context.clone(),
        );
        let mut orchestrator = GenerationOrchestrator::new(
            Arc::clone(&store),
            backend,
            gate,
            Arc::clone(&indexer),
            Arc::clone(&invalidator),
            Arc::clone(&coordination),
            config.generation.clone(),
        );
        if config.generation.evaluation_enabled {
            orchestrator = orchestrator.with_evaluator(Arc::new(HeuristicEvaluator::default()));
        }
        let lifecycle = LifecycleStateMachine::new(
            Arc::clone(&store),
            invalidator,
            Arc::clone(&coordination),
        );
        Self {
            config,
            store,
            indexer,
            assembler,
            orchestrator,
            lifecycle,
            coordination,
            warmed: Mutex::new(HashSet::new()),
        }
    }

    /// Engine over the SQLite database at `config.storage.db_path`, with the
    /// built-in hash embedder.
    pub fn open(config: Config, backend: Arc<dyn GenerationBackend>) -> Result<Self> {
        config.validate()?;
        let store: SharedStore = Arc::new(SqliteStore::open(&config.storage.db_path)?);
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(config.index.dimension));
        info!(db = %config.storage.db_path.display(), "Opened story store");
        Ok(Self::new(config, store, backend, embedder))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let gate = self.orchestrator.gate();
        EngineStats {
            index: self.indexer.index().stats(),
            circuit: self.orchestrator.circuit_status(),
            gate_capacity: gate.capacity(),
            gate_in_flight: gate.in_flight(),
        }
    }

    // -- projects -------------------------------------------------------------

    /// Create a project from its bible. A bible that already carries an
    /// outline moves the project straight to `outlined`.
    pub async fn create_project(&self, bible: &ProjectBible) -> Result<ProjectState> {
        if bible.project_id.trim().is_empty() {
            return Err(StorageError::Constraint("project_id must not be empty".to_string()).into());
        }
        self.store.create_project(bible).await?;
        self.lifecycle.outline_ready(&bible.project_id).await?;
        info!(project_id = %bible.project_id, units = bible.outline.len(), "Project created");
        self.lifecycle.state(&bible.project_id).await
    }

    pub async fn project(&self, project_id: &str) -> Result<ProjectView> {
        let state = self.lifecycle.state(project_id).await?;
        let bible = self.store.bible(project_id).await?.unwrap_or_default();
        let units = self.store.list_units(project_id).await?;
        let mut ordinals: Vec<u32> = bible.unit_ordinals();
        ordinals.extend(units.iter().map(|u| u.key.ordinal));
        ordinals.sort_unstable();
        ordinals.dedup();
        let summaries = ordinals
            .into_iter()
            .map(|ordinal| {
                let unit = units.iter().find(|u| u.key.ordinal == ordinal);
                UnitSummary {
                    ordinal,
                    title: bible
                        .outline_entry(ordinal)
                        .map(|entry| entry.title.clone())
                        .unwrap_or_default(),
                    status: unit.map_or(GenerationStatus::NotStarted, |u| u.status),
                    selected: unit.and_then(|u| u.selected),
                }
            })
            .collect();
        Ok(ProjectView {
            state,
            title: bible.title,
            units: summaries,
        })
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectState>> {
        let mut projects = self.store.list_projects().await?;
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(projects)
    }

    /// Insert or replace outline entries, then advance `setup -> outlined`.
    pub async fn set_outline(
        &self,
        project_id: &str,
        entries: &[OutlineEntry],
    ) -> Result<Option<PhaseTransition>> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::SetOutline)
            .await?;
        for entry in entries {
            self.store.put_outline_entry(project_id, entry).await?;
        }
        self.lifecycle.outline_ready(project_id).await
    }

    pub async fn put_character(&self, project_id: &str, character: &Character) -> Result<()> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::EditBible)
            .await?;
        self.store.put_character(project_id, character).await
    }

    pub async fn put_world_fact(&self, project_id: &str, fact: &WorldFact) -> Result<()> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::EditBible)
            .await?;
        self.store.put_world_fact(project_id, fact).await
    }

    pub async fn transition(
        &self,
        project_id: &str,
        target: ProjectPhase,
    ) -> Result<TransitionReport> {
        self.lifecycle.transition(project_id, target).await
    }

    /// Stop issuing backend calls for the project's in-flight batches.
    pub fn cancel(&self, project_id: &str) {
        self.coordination.cancels.cancel(project_id);
    }

    // -- units ----------------------------------------------------------------

    pub async fn assemble(
        &self,
        project_id: &str,
        ordinal: u32,
        budget_tokens: Option<usize>,
    ) -> Result<LayeredContext> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::Assemble)
            .await?;
        self.ensure_warm(project_id).await?;
        self.assembler
            .assemble(&UnitKey::new(project_id, ordinal), budget_tokens)
            .await
    }

    /// Generate `n` candidates (default `candidates_per_unit`).
    pub async fn generate(
        &self,
        project_id: &str,
        ordinal: u32,
        n: Option<u32>,
    ) -> Result<GenerateReport> {
        let (unit, context) = self.prepare_generation(project_id, ordinal).await?;
        let n = n.unwrap_or(self.config.generation.candidates_per_unit);
        self.orchestrator.generate(&unit, n, &context).await
    }

    pub async fn retry_one(
        &self,
        project_id: &str,
        ordinal: u32,
        slot: u32,
    ) -> Result<GenerateReport> {
        let (unit, context) = self.prepare_generation(project_id, ordinal).await?;
        self.orchestrator.retry_one(&unit, slot, &context).await
    }

    pub async fn regenerate(
        &self,
        project_id: &str,
        ordinal: u32,
        n: Option<u32>,
    ) -> Result<GenerateReport> {
        let (unit, context) = self.prepare_generation(project_id, ordinal).await?;
        let n = n.unwrap_or(self.config.generation.candidates_per_unit);
        self.orchestrator.regenerate(&unit, n, &context).await
    }

    async fn prepare_generation(
        &self,
        project_id: &str,
        ordinal: u32,
    ) -> Result<(UnitKey, LayeredContext)> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::GenerateUnit)
            .await?;
        let bible = self
            .store
            .bible(project_id)
            .await?
            .ok_or_else(|| LifecycleError::ProjectNotFound(project_id.to_string()))?;
        if bible.outline_entry(ordinal).is_none() {
            return Err(StorageError::NotFound(format!(
                "outline entry {ordinal} in project {project_id}"
            ))
            .into());
        }
        self.ensure_warm(project_id).await?;
        let unit = UnitKey::new(project_id, ordinal);
        let context = self.assembler.assemble(&unit, None).await?;
        Ok((unit, context))
    }

    /// Select a candidate; completes the project when it was the last
    /// outstanding unit.
    pub async fn select(
        &self,
        project_id: &str,
        ordinal: u32,
        candidate_id: CandidateId,
    ) -> Result<SelectOutcome> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::SelectCandidate)
            .await?;
        self.ensure_warm(project_id).await?;
        let report = self
            .orchestrator
            .select(&UnitKey::new(project_id, ordinal), candidate_id)
            .await?;
        let phase_change = self.lifecycle.auto_complete(project_id).await?;
        Ok(SelectOutcome {
            report,
            phase_change,
        })
    }

    pub async fn status(&self, project_id: &str, ordinal: u32) -> Result<UnitStatusView> {
        let key = UnitKey::new(project_id, ordinal);
        let bible = self
            .store
            .bible(project_id)
            .await?
            .ok_or_else(|| LifecycleError::ProjectNotFound(project_id.to_string()))?;
        let title = bible.outline_entry(ordinal).map(|entry| entry.title.clone());
        let unit = match self.store.unit(&key).await? {
            Some(unit) => unit,
            None if title.is_some() => Unit::new(key.clone()),
            None => return Err(StorageError::NotFound(format!("unit {key}")).into()),
        };
        let candidates = self
            .store
            .list_candidates(&key)
            .await?
            .into_iter()
            .map(|c| CandidateView {
                selected: unit.selected == Some(c.id),
                id: c.id,
                slot: c.slot,
                attempt: c.attempt,
                word_count: c.word_count,
                summary: c.summary,
                score: c.evaluation.map(|e| e.score),
                created_at: c.created_at,
            })
            .collect();
        let records = self.store.chunk_records(&key).await?;
        let failed_chunks = records
            .iter()
            .filter(|r| r.state == ChunkState::Failed)
            .count();
        Ok(UnitStatusView {
            unit: key,
            title,
            status: unit.status,
            selected: unit.selected,
            last_batch_slots: unit.last_batch_slots,
            last_failure: unit.last_failure,
            candidates,
            indexed_chunks: records.len() - failed_chunks,
            failed_chunks,
        })
    }

    /// Delete a unit; a completed project drops back to drafting.
    pub async fn delete_unit(&self, project_id: &str, ordinal: u32) -> Result<DeleteOutcome> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::DeleteUnit)
            .await?;
        let unit = UnitKey::new(project_id, ordinal);
        let existed = self.orchestrator.delete_unit(&unit).await?;
        let phase_change = self
            .lifecycle
            .downgrade_if_incomplete(project_id, &format!("unit {ordinal} deleted"))
            .await?;
        Ok(DeleteOutcome {
            unit,
            existed,
            phase_change,
        })
    }

    /// Bring the unit's chunks in line with its selection. With `force`,
    /// re-chunk even when the stored chunks look current.
    ///
    /// Runs under the project's shared guard, so a rollback waits for it
    /// and then purges what it wrote.
    pub async fn index(
        &self,
        project_id: &str,
        ordinal: u32,
        force: bool,
    ) -> Result<Option<ReindexReport>> {
        self.lifecycle
            .ensure_permitted(project_id, Operation::IndexUnit)
            .await?;
        self.ensure_warm(project_id).await?;

        let _shared = self.coordination.projects.shared(project_id).await;
        // a rollback may have finished between the check above and the guard
        self.lifecycle
            .ensure_permitted(project_id, Operation::IndexUnit)
            .await?;
        let key = UnitKey::new(project_id, ordinal);
        let _unit_lock = self.indexer.lock_unit(&key).await;
        let unit = self
            .store
            .unit(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("unit {key}")))?;
        let selected = unit
            .selected
            .ok_or_else(|| StorageError::NotFound(format!("selected candidate of unit {key}")))?;
        let candidate = self
            .store
            .candidate(selected)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("candidate {selected}")))?;
        if force {
            return self
                .indexer
                .reindex_locked(&key, selected, &candidate.text)
                .await
                .map(Some);
        }
        self.indexer
            .refresh_locked(&key, selected, &candidate.text)
            .await
    }

    /// Load the project's stored embeddings on first use, then repair any
    /// unit whose chunks no longer match its selected text.
    async fn ensure_warm(&self, project_id: &str) -> Result<()> {
        let mut warmed = self.warmed.lock().await;
        if warmed.contains(project_id) {
            return Ok(());
        }
        let _shared = self.coordination.projects.shared(project_id).await;
        let loaded = self.indexer.load_project(project_id).await?;
        let mut repaired = 0;
        for listed in self.store.list_units(project_id).await? {
            let _unit_lock = self.indexer.lock_unit(&listed.key).await;
            // re-read: a delete may have run since the listing
            let Some(unit) = self.store.unit(&listed.key).await? else {
                continue;
            };
            let Some(selected) = unit.selected else {
                continue;
            };
            let Some(candidate) = self.store.candidate(selected).await? else {
                continue;
            };
            match self
                .indexer
                .refresh_locked(&unit.key, selected, &candidate.text)
                .await
            {
                Ok(Some(_)) => repaired += 1,
                Ok(None) => {}
                Err(err) => warn!(unit = %unit.key, error = %err, "Stale unit could not be reindexed"),
            }
        }
        debug!(project_id, loaded, repaired, "Project index warmed");
        warmed.insert(project_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::generation::{BackendResult, GenerationRequest};
    use crate::model::{Character, WorldFact};
    use crate::store::MemoryStore;

    struct EchoBackend;

    #[async_trait]
    impl GenerationBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &GenerationRequest) -> BackendResult {
            BackendResult::ok(format!(
                "Mara climbed the tower in unit {} (slot {}).\n\n\"Light it,\" she said.",
                request.unit.ordinal, request.slot
            ))
        }
    }

    fn bible() -> ProjectBible {
        ProjectBible {
            project_id: "fog".into(),
            title: "Fog".into(),
            premise: "A keeper waits for a ship.".into(),
            characters: vec![Character {
                name: "Mara".into(),
                description: "keeper".into(),
            }],
            world_facts: vec![WorldFact {
                id: "tide".into(),
                text: "Tides are high in spring.".into(),
                core: false,
            }],
            outline: vec![
                OutlineEntry {
                    ordinal: 1,
                    title: "Lamp".into(),
                    summary: "Mara lights the lamp.".into(),
                    characters: vec!["Mara".into()],
                    threads: Vec::new(),
                    target_words: None,
                },
                OutlineEntry {
                    ordinal: 2,
                    title: "Ship".into(),
                    summary: "A ship appears.".into(),
                    characters: vec!["Mara".into()],
                    threads: Vec::new(),
                    target_words: None,
                },
            ],
            ..ProjectBible::default()
        }
    }

    fn engine() -> StoryEngine {
        let mut config = Config::default();
        config.index.dimension = 32;
        config.generation.candidates_per_unit = 2;
        StoryEngine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(EchoBackend),
            Arc::new(HashEmbedder::new(32)),
        )
    }

    #[tokio::test]
    async fn create_with_outline_lands_in_outlined() {
        let engine = engine();
        let state = engine.create_project(&bible()).await.unwrap();
        assert_eq!(state.phase, ProjectPhase::Outlined);
        let err = engine.generate("fog", 1, None).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Lifecycle(LifecycleError::OperationNotPermitted { .. })
        ));
    }

    #[tokio::test]
    async fn selecting_every_unit_completes_and_delete_downgrades() {
        let engine = engine();
        engine.create_project(&bible()).await.unwrap();
        engine.transition("fog", ProjectPhase::Drafting).await.unwrap();

        for ordinal in [1, 2] {
            let report = engine.generate("fog", ordinal, None).await.unwrap();
            assert_eq!(report.succeeded, 2);
            let pick = report.candidate_ids()[1];
            let outcome = engine.select("fog", ordinal, pick).await.unwrap();
            assert_eq!(outcome.report.status, GenerationStatus::Done);
            assert_eq!(outcome.phase_change.is_some(), ordinal == 2);
        }
        assert_eq!(
            engine.project("fog").await.unwrap().state.phase,
            ProjectPhase::Completed
        );

        let status = engine.status("fog", 2).await.unwrap();
        assert_eq!(status.candidates.len(), 2);
        assert!(status.candidates[1].selected);
        assert!(status.indexed_chunks > 0);

        let outcome = engine.delete_unit("fog", 2).await.unwrap();
        assert!(outcome.existed);
        assert_eq!(outcome.phase_change.unwrap().to, ProjectPhase::Drafting);
        let status = engine.status("fog", 2).await.unwrap();
        assert_eq!(status.status, GenerationStatus::NotStarted);
        assert!(status.candidates.is_empty());
    }

    #[tokio::test]
    async fn status_of_unknown_unit_is_not_found() {
        let engine = engine();
        engine.create_project(&bible()).await.unwrap();
        let err = engine.status("fog", 9).await.unwrap_err();
        assert!(matches!(err, crate::Error::Storage(StorageError::NotFound(_))));
        let fresh = engine.status("fog", 1).await.unwrap();
        assert_eq!(fresh.status, GenerationStatus::NotStarted);
        assert_eq!(fresh.title.as_deref(), Some("Lamp"));
    }

    #[tokio::test]
    async fn empty_project_id_is_rejected() {
        let engine = engine();
        let err = engine
            .create_project(&ProjectBible::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("project_id"));
    }
}
