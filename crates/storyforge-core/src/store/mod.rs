//! Persistence contract for projects, units, candidates, chunk records and
//! entity snapshots.
//!
//! Two backends: [`MemoryStore`] for tests and ephemeral runs, and
//! [`SqliteStore`] for durable projects.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lifecycle::ProjectState;
use crate::model::{
    Candidate, CandidateId, Character, ChunkRecord, Evaluation, GenerationStatus, IndexEntry,
    NewCandidate, OutlineEntry, ProjectBible, Unit, UnitKey, WorldFact,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn ProjectStore>;

/// Rows removed by a unit purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub candidates: usize,
    pub chunks: usize,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    // -- projects -----------------------------------------------------------

    /// Create the project in `setup` with the given bible.
    ///
    /// Fails with `LifecycleError::ProjectExists` if the id is taken.
    async fn create_project(&self, bible: &ProjectBible) -> Result<ProjectState>;

    async fn project_state(&self, project_id: &str) -> Result<Option<ProjectState>>;

    async fn put_project_state(&self, state: &ProjectState) -> Result<()>;

    async fn list_projects(&self) -> Result<Vec<ProjectState>>;

    // -- bible (normalized sub-records) -------------------------------------

    async fn bible(&self, project_id: &str) -> Result<Option<ProjectBible>>;

    /// Replace project-level fields only (title, premise, style notes).
    async fn put_bible_header(&self, bible: &ProjectBible) -> Result<()>;

    /// Insert or replace one character by name.
    async fn put_character(&self, project_id: &str, character: &Character) -> Result<()>;

    /// Insert or replace one world fact by id.
    async fn put_world_fact(&self, project_id: &str, fact: &WorldFact) -> Result<()>;

    /// Insert or replace one outline entry by ordinal.
    async fn put_outline_entry(&self, project_id: &str, entry: &OutlineEntry) -> Result<()>;

    // -- units --------------------------------------------------------------

    async fn unit(&self, key: &UnitKey) -> Result<Option<Unit>>;

    async fn put_unit(&self, unit: &Unit) -> Result<()>;

    /// Units of a project, ascending by ordinal.
    async fn list_units(&self, project_id: &str) -> Result<Vec<Unit>>;

    /// Atomically set the selection reference and status.
    ///
    /// A `Some` selection must name a candidate of `key`; otherwise the write
    /// is rejected with `StorageError::Constraint` and nothing changes.
    async fn commit_selection(
        &self,
        key: &UnitKey,
        selected: Option<CandidateId>,
        status: GenerationStatus,
    ) -> Result<Unit>;

    /// Delete the unit and, by cascade, its candidates and chunk records.
    async fn delete_unit(&self, key: &UnitKey) -> Result<bool>;

    /// Delete candidates and chunk records, and reset the unit to
    /// `not_started` with no selection.
    async fn purge_unit_outputs(&self, key: &UnitKey) -> Result<PurgeCounts>;

    // -- candidates ---------------------------------------------------------

    /// Append a candidate; the store assigns its id and timestamp.
    async fn append_candidate(&self, candidate: &NewCandidate) -> Result<Candidate>;

    async fn candidate(&self, id: CandidateId) -> Result<Option<Candidate>>;

    /// Candidates of a unit in creation order.
    async fn list_candidates(&self, key: &UnitKey) -> Result<Vec<Candidate>>;

    async fn set_evaluation(&self, id: CandidateId, evaluation: &Evaluation) -> Result<()>;

    // -- chunk records ------------------------------------------------------

    /// Replace every chunk record of the unit with `records`.
    async fn replace_chunk_records(&self, key: &UnitKey, records: &[ChunkRecord]) -> Result<()>;

    /// Chunk records of a unit ordered by `seq`.
    async fn chunk_records(&self, key: &UnitKey) -> Result<Vec<ChunkRecord>>;

    async fn project_chunk_records(&self, project_id: &str) -> Result<Vec<ChunkRecord>>;

    async fn delete_chunk_records(&self, key: &UnitKey) -> Result<usize>;

    // -- entity snapshots ---------------------------------------------------

    async fn put_index_entries(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Entries with `as_of < before_ordinal`.
    async fn index_entries(&self, project_id: &str, before_ordinal: u32)
    -> Result<Vec<IndexEntry>>;

    /// Remove entries with `as_of >= from_ordinal`.
    async fn delete_index_entries_from(&self, project_id: &str, from_ordinal: u32)
    -> Result<usize>;
}
