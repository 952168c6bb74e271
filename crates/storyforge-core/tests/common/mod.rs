//! Shared test infrastructure for storyforge-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{InstrumentedBackend, drafting_engine};
//! ```

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use storyforge_core::config::Config;
use storyforge_core::error::{Result as CoreResult, StorageError};
use storyforge_core::generation::{
    BackendErrorKind, BackendResult, GenerationBackend, GenerationRequest,
};
use storyforge_core::lifecycle::{ProjectPhase, ProjectState};
use storyforge_core::model::{
    Candidate, CandidateId, Character, ChunkRecord, Evaluation, GenerationStatus, IndexEntry,
    NewCandidate, OutlineEntry, ProjectBible, Unit, UnitKey, WorldFact,
};
use storyforge_core::search::{EmbedError, Embedder, EmbedderInfo, HashEmbedder};
use storyforge_core::store::{MemoryStore, ProjectStore, PurgeCounts, SharedStore};
use storyforge_core::StoryEngine;

pub const DIM: usize = 32;

/// Backend that records concurrency and can be told to fail or stall.
#[derive(Default)]
pub struct InstrumentedBackend {
    pub calls: AtomicU32,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay_ms: u64,
    failing_slots: Mutex<HashSet<u32>>,
    fail_all: AtomicBool,
    fail_kind: Mutex<Option<BackendErrorKind>>,
}

impl InstrumentedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    pub fn fail_slots(&self, slots: &[u32], kind: BackendErrorKind) {
        let mut failing = self.failing_slots.lock().unwrap();
        failing.clear();
        failing.extend(slots.iter().copied());
        *self.fail_kind.lock().unwrap() = Some(kind);
    }

    pub fn fail_everything(&self, kind: BackendErrorKind) {
        self.fail_all.store(true, Ordering::SeqCst);
        *self.fail_kind.lock().unwrap() = Some(kind);
    }

    pub fn heal(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.failing_slots.lock().unwrap().clear();
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn failure_for(&self, slot: u32) -> Option<BackendErrorKind> {
        let failing = self.fail_all.load(Ordering::SeqCst)
            || self.failing_slots.lock().unwrap().contains(&slot);
        if failing {
            *self.fail_kind.lock().unwrap()
        } else {
            None
        }
    }
}

#[async_trait]
impl GenerationBackend for InstrumentedBackend {
    fn name(&self) -> &str {
        "instrumented"
    }

    async fn complete(&self, request: &GenerationRequest) -> BackendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(kind) = self.failure_for(request.slot) {
            return BackendResult::error(kind, format!("slot {} forced to fail", request.slot));
        }
        BackendResult::ok(format!(
            "Unit {} draft {} attempt {}. Mara rowed out past the reef while the lamp burned.\n\n\
             \"Hold the line,\" Tomas called from the jetty.",
            request.unit.ordinal, request.slot, request.attempt
        ))
    }
}

/// Hash embedder that fails while `failing` is set.
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    pub failing: AtomicBool,
    pub calls: AtomicU32,
}

impl FlakyEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIM),
            failing: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            name: "flaky-hash".to_string(),
            dimension: DIM,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbedError::Unavailable("embedding service down".to_string()));
        }
        Ok(self.inner.embed_sync(text))
    }
}

/// Hash embedder that can reject every input, or hold calls until opened.
pub struct GatedEmbedder {
    inner: HashEmbedder,
    pub rejecting: AtomicBool,
    open: watch::Sender<bool>,
    entered: Notify,
}

impl GatedEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIM),
            rejecting: AtomicBool::new(false),
            open: watch::channel(true).0,
            entered: Notify::new(),
        }
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Resolves once a call is parked behind the closed gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl Embedder for GatedEmbedder {
    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            name: "gated-hash".to_string(),
            dimension: DIM,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(EmbedError::Rejected("input refused".to_string()));
        }
        let mut rx = self.open.subscribe();
        let open = *rx.borrow();
        if !open {
            self.entered.notify_one();
            let _ = rx.wait_for(|open| *open).await;
        }
        Ok(self.inner.embed_sync(text))
    }
}

/// Memory store whose candidate appends and chunk-record writes can be made
/// to fail.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    appends_left: Mutex<Option<u32>>,
    pub failing_chunk_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more appends through, then fail every later one.
    pub fn fail_appends_after(&self, n: u32) {
        *self.appends_left.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.appends_left.lock().unwrap() = None;
        self.failing_chunk_writes.store(false, Ordering::SeqCst);
    }

    fn disk_error() -> storyforge_core::Error {
        StorageError::Database("disk I/O error".to_string()).into()
    }
}

#[async_trait]
impl ProjectStore for FaultyStore {
    async fn create_project(&self, bible: &ProjectBible) -> CoreResult<ProjectState> {
        self.inner.create_project(bible).await
    }

    async fn project_state(&self, project_id: &str) -> CoreResult<Option<ProjectState>> {
        self.inner.project_state(project_id).await
    }

    async fn put_project_state(&self, state: &ProjectState) -> CoreResult<()> {
        self.inner.put_project_state(state).await
    }

    async fn list_projects(&self) -> CoreResult<Vec<ProjectState>> {
        self.inner.list_projects().await
    }

    async fn bible(&self, project_id: &str) -> CoreResult<Option<ProjectBible>> {
        self.inner.bible(project_id).await
    }

    async fn put_bible_header(&self, bible: &ProjectBible) -> CoreResult<()> {
        self.inner.put_bible_header(bible).await
    }

    async fn put_character(&self, project_id: &str, character: &Character) -> CoreResult<()> {
        self.inner.put_character(project_id, character).await
    }

    async fn put_world_fact(&self, project_id: &str, fact: &WorldFact) -> CoreResult<()> {
        self.inner.put_world_fact(project_id, fact).await
    }

    async fn put_outline_entry(&self, project_id: &str, entry: &OutlineEntry) -> CoreResult<()> {
        self.inner.put_outline_entry(project_id, entry).await
    }

    async fn unit(&self, key: &UnitKey) -> CoreResult<Option<Unit>> {
        self.inner.unit(key).await
    }

    async fn put_unit(&self, unit: &Unit) -> CoreResult<()> {
        self.inner.put_unit(unit).await
    }

    async fn list_units(&self, project_id: &str) -> CoreResult<Vec<Unit>> {
        self.inner.list_units(project_id).await
    }

    async fn commit_selection(
        &self,
        key: &UnitKey,
        selected: Option<CandidateId>,
        status: GenerationStatus,
    ) -> CoreResult<Unit> {
        self.inner.commit_selection(key, selected, status).await
    }

    async fn delete_unit(&self, key: &UnitKey) -> CoreResult<bool> {
        self.inner.delete_unit(key).await
    }

    async fn purge_unit_outputs(&self, key: &UnitKey) -> CoreResult<PurgeCounts> {
        self.inner.purge_unit_outputs(key).await
    }

    async fn append_candidate(&self, candidate: &NewCandidate) -> CoreResult<Candidate> {
        {
            let mut left = self.appends_left.lock().unwrap();
            match left.as_mut() {
                Some(0) => return Err(Self::disk_error()),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.inner.append_candidate(candidate).await
    }

    async fn candidate(&self, id: CandidateId) -> CoreResult<Option<Candidate>> {
        self.inner.candidate(id).await
    }

    async fn list_candidates(&self, key: &UnitKey) -> CoreResult<Vec<Candidate>> {
        self.inner.list_candidates(key).await
    }

    async fn set_evaluation(&self, id: CandidateId, evaluation: &Evaluation) -> CoreResult<()> {
        self.inner.set_evaluation(id, evaluation).await
    }

    async fn replace_chunk_records(&self, key: &UnitKey, records: &[ChunkRecord]) -> CoreResult<()> {
        if self.failing_chunk_writes.load(Ordering::SeqCst) {
            return Err(Self::disk_error());
        }
        self.inner.replace_chunk_records(key, records).await
    }

    async fn chunk_records(&self, key: &UnitKey) -> CoreResult<Vec<ChunkRecord>> {
        self.inner.chunk_records(key).await
    }

    async fn project_chunk_records(&self, project_id: &str) -> CoreResult<Vec<ChunkRecord>> {
        self.inner.project_chunk_records(project_id).await
    }

    async fn delete_chunk_records(&self, key: &UnitKey) -> CoreResult<usize> {
        self.inner.delete_chunk_records(key).await
    }

    async fn put_index_entries(&self, entries: &[IndexEntry]) -> CoreResult<()> {
        self.inner.put_index_entries(entries).await
    }

    async fn index_entries(&self, project_id: &str, before_ordinal: u32) -> CoreResult<Vec<IndexEntry>> {
        self.inner.index_entries(project_id, before_ordinal).await
    }

    async fn delete_index_entries_from(&self, project_id: &str, from_ordinal: u32) -> CoreResult<usize> {
        self.inner.delete_index_entries_from(project_id, from_ordinal).await
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.index.dimension = DIM;
    config.index.min_chunk_chars = 10;
    config.index.embed_retry_count = 0;
    config.generation.candidates_per_unit = 3;
    config.generation.max_concurrent_generations = 2;
    config.generation.retry_count = 1;
    config.generation.retry_backoff_base_ms = 1;
    config.generation.request_timeout_ms = 2_000;
    config.generation.circuit_failure_threshold = 100;
    config
}

pub fn bible(project_id: &str, units: u32) -> ProjectBible {
    ProjectBible {
        project_id: project_id.to_string(),
        title: "The Lamp at Harrow Point".to_string(),
        premise: "A lighthouse keeper waits for a ship that never came home.".to_string(),
        style_notes: "Close third person, past tense.".to_string(),
        characters: vec![
            Character {
                name: "Mara".to_string(),
                description: "The keeper.".to_string(),
            },
            Character {
                name: "Tomas".to_string(),
                description: "Her brother, a fisherman.".to_string(),
            },
        ],
        world_facts: vec![WorldFact {
            id: "reef".to_string(),
            text: "A reef guards the harbor mouth.".to_string(),
            core: true,
        }],
        outline: (1..=units)
            .map(|ordinal| OutlineEntry {
                ordinal,
                title: format!("Part {ordinal}"),
                summary: format!("Mara keeps watch on night {ordinal}."),
                characters: vec!["Mara".to_string()],
                threads: vec!["missing-ship".to_string()],
                target_words: None,
            })
            .collect(),
    }
}

pub fn memory_store() -> SharedStore {
    Arc::new(MemoryStore::new())
}

/// Engine over a project already moved to `drafting`.
pub async fn drafting_engine(
    backend: Arc<InstrumentedBackend>,
    embedder: Arc<dyn Embedder>,
    units: u32,
) -> StoryEngine {
    drafting_engine_with(test_config(), backend, embedder, units).await
}

pub async fn drafting_engine_with(
    config: Config,
    backend: Arc<InstrumentedBackend>,
    embedder: Arc<dyn Embedder>,
    units: u32,
) -> StoryEngine {
    drafting_engine_on(config, memory_store(), backend, embedder, units).await
}

pub async fn drafting_engine_on(
    config: Config,
    store: SharedStore,
    backend: Arc<InstrumentedBackend>,
    embedder: Arc<dyn Embedder>,
    units: u32,
) -> StoryEngine {
    let engine = StoryEngine::new(config, store, backend, embedder);
    engine.create_project(&bible("harrow", units)).await.unwrap();
    engine
        .transition("harrow", ProjectPhase::Drafting)
        .await
        .unwrap();
    engine
}
