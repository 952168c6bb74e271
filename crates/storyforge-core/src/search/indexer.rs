//! Keeps the vector index in step with each unit's selected text.
//!
//! `reindex` chunks the text, reuses stored embeddings whose content hash is
//! unchanged, embeds the rest on a bounded worker pool, then swaps the unit's
//! rows in the index and its chunk records in the store. One reindex per
//! unit runs at a time. If the store write fails, the unit's rows are put
//! back to what the stored records describe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::chunking::{ChunkPolicy, chunk_id, sha256_hex, split_into_chunks};
use super::embedder::{EmbedError, Embedder};
use super::vector_index::{ChunkMeta, VectorIndex};
use crate::config::IndexConfig;
use crate::coordination::{KeyedMutex, KeyedMutexGuard};
use crate::error::{Error, Result};
use crate::model::{CandidateId, ChunkRecord, ChunkState, UnitKey};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::store::SharedStore;

/// What one `reindex` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexReport {
    pub chunks: usize,
    /// Chunks whose stored embedding was reused.
    pub reused: usize,
    /// Chunks sent to the embedder.
    pub embedded: usize,
    /// Chunks excluded after exhausting retries.
    pub failed: usize,
    /// Index rows dropped because their chunk no longer exists.
    pub removed: usize,
}

pub struct Indexer {
    store: SharedStore,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    policy: ChunkPolicy,
    workers: usize,
    retry: RetryPolicy,
    unit_locks: KeyedMutex<UnitKey>,
}

impl Indexer {
    #[must_use]
    pub fn new(
        store: SharedStore,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: &IndexConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            policy: ChunkPolicy::from_config(config),
            workers: config.embed_workers.max(1),
            retry: RetryPolicy::embedding(config.embed_retry_count),
            unit_locks: KeyedMutex::new(),
        }
    }

    #[must_use]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    #[must_use]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Serializes every index write for `unit`. Callers that read the
    /// unit's selection before acting on it hold this across both steps and
    /// use the `*_locked` methods.
    pub async fn lock_unit(&self, unit: &UnitKey) -> KeyedMutexGuard<UnitKey> {
        self.unit_locks.lock(unit).await
    }

    /// Index `text` (the selected candidate of `unit`), replacing whatever
    /// the unit had indexed before.
    pub async fn reindex(
        &self,
        unit: &UnitKey,
        candidate_id: CandidateId,
        text: &str,
    ) -> Result<ReindexReport> {
        let _unit_lock = self.unit_locks.lock(unit).await;
        self.reindex_locked(unit, candidate_id, text).await
    }

    pub(crate) async fn reindex_locked(
        &self,
        unit: &UnitKey,
        candidate_id: CandidateId,
        text: &str,
    ) -> Result<ReindexReport> {
        let dimension = self.index.dimension();
        let source_hash = sha256_hex(text.as_bytes());
        let chunks = split_into_chunks(text, &self.policy);

        let previous = self.store.chunk_records(unit).await?;
        let mut cached: HashMap<&str, &[f32]> = HashMap::new();
        for record in &previous {
            if record.state != ChunkState::Indexed {
                continue;
            }
            if let Some(embedding) = record.embedding.as_deref() {
                if embedding.len() == dimension {
                    cached.entry(record.content_hash.as_str()).or_insert(embedding);
                }
            }
        }

        let mut report = ReindexReport {
            chunks: chunks.len(),
            ..ReindexReport::default()
        };
        let mut occurrences: HashMap<&str, u32> = HashMap::new();
        let mut records: Vec<ChunkRecord> = Vec::with_capacity(chunks.len());
        let mut pending: Vec<usize> = Vec::new();

        for chunk in &chunks {
            let occurrence = occurrences.entry(chunk.content_hash.as_str()).or_insert(0);
            let id = chunk_id(unit, &chunk.content_hash, *occurrence);
            *occurrence += 1;

            let embedding = cached.get(chunk.content_hash.as_str()).map(|v| v.to_vec());
            if embedding.is_some() {
                report.reused += 1;
            } else {
                pending.push(records.len());
            }
            records.push(ChunkRecord {
                chunk_id: id,
                unit: unit.clone(),
                candidate_id,
                seq: chunk.seq,
                content_hash: chunk.content_hash.clone(),
                source_hash: source_hash.clone(),
                text: chunk.text.clone(),
                state: ChunkState::Indexed,
                embedding,
            });
        }

        report.embedded = pending.len();
        if !pending.is_empty() {
            let jobs: Vec<(usize, String)> = pending
                .iter()
                .map(|&pos| (pos, records[pos].text.clone()))
                .collect();
            for (pos, outcome) in self.embed_all(jobs).await {
                let record = &mut records[pos];
                match outcome {
                    Ok(vector) if vector.len() == dimension => record.embedding = Some(vector),
                    Ok(vector) => {
                        warn!(
                            unit = %unit,
                            chunk_id = %record.chunk_id,
                            expected = dimension,
                            actual = vector.len(),
                            "Embedding has wrong dimension; chunk excluded"
                        );
                        record.state = ChunkState::Failed;
                    }
                    Err(message) => {
                        warn!(
                            unit = %unit,
                            chunk_id = %record.chunk_id,
                            error = %message,
                            "Embedding failed after retries; chunk excluded"
                        );
                        record.state = ChunkState::Failed;
                    }
                }
            }
        }

        let mut live: HashSet<&str> = HashSet::new();
        for record in &mut records {
            if record.state != ChunkState::Indexed {
                continue;
            }
            let Some(vector) = record.embedding.as_deref() else {
                record.state = ChunkState::Failed;
                continue;
            };
            if let Err(err) = self.index.upsert(&record.chunk_id, vector, chunk_meta(record)) {
                warn!(
                    unit = %unit,
                    chunk_id = %record.chunk_id,
                    error = %err,
                    "Vector rejected by index; chunk excluded"
                );
                record.state = ChunkState::Failed;
            }
        }
        for record in &records {
            if record.state == ChunkState::Indexed {
                live.insert(record.chunk_id.as_str());
            }
        }
        for old in self.index.unit_chunk_ids(unit) {
            if !live.contains(old.as_str()) && self.index.delete(&old) {
                report.removed += 1;
            }
        }
        report.failed = records
            .iter()
            .filter(|r| r.state == ChunkState::Failed)
            .count();

        if let Err(err) = self.store.replace_chunk_records(unit, &records).await {
            let restored = self.restore_rows(unit, &previous);
            warn!(unit = %unit, error = %err, restored, "Chunk records not saved; index rows restored");
            return Err(err);
        }

        info!(
            unit = %unit,
            candidate_id = %candidate_id,
            chunks = report.chunks,
            reused = report.reused,
            embedded = report.embedded,
            failed = report.failed,
            removed = report.removed,
            "Unit reindexed"
        );
        Ok(report)
    }

    /// Embed on at most `workers` concurrent tasks. Results come back keyed
    /// by record position, in completion order.
    async fn embed_all(
        &self,
        jobs: Vec<(usize, String)>,
    ) -> Vec<(usize, std::result::Result<Vec<f32>, String>)> {
        let gate = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let total = jobs.len();

        for (pos, text) in jobs {
            let gate = Arc::clone(&gate);
            let embedder = Arc::clone(&self.embedder);
            let retry = self.retry.clone();
            tasks.spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return (pos, Err("embedding pool closed".to_string()));
                };
                let outcome =
                    run_with_retry(&retry, EmbedError::is_transient, || embedder.embed(&text))
                        .await;
                if outcome.attempts > 1 {
                    debug!(attempts = outcome.attempts, "Embedding needed retries");
                }
                (pos, outcome.result.map_err(|e| e.to_string()))
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "Embedding task aborted"),
            }
        }
        // positions lost to aborted tasks stay without an embedding and are
        // marked failed by the caller
        results
    }

    /// Replace the unit's index rows with the indexed entries of `records`.
    fn restore_rows(&self, unit: &UnitKey, records: &[ChunkRecord]) -> usize {
        self.index.delete_by_unit(unit);
        records
            .iter()
            .filter(|r| r.state == ChunkState::Indexed)
            .filter_map(|r| r.embedding.as_deref().map(|vector| (r, vector)))
            .filter(|(record, vector)| {
                self.index
                    .upsert(&record.chunk_id, vector, chunk_meta(record))
                    .is_ok()
            })
            .count()
    }

    /// Drop every chunk of `unit` from the index and the store.
    pub async fn remove(&self, unit: &UnitKey) -> Result<usize> {
        let _unit_lock = self.unit_locks.lock(unit).await;
        self.remove_locked(unit).await
    }

    pub(crate) async fn remove_locked(&self, unit: &UnitKey) -> Result<usize> {
        let removed = self.index.delete_by_unit(unit);
        let records = self.store.delete_chunk_records(unit).await?;
        debug!(unit = %unit, rows = removed, records, "Unit removed from index");
        Ok(removed.max(records))
    }

    /// Reindex `unit` only if its stored chunks were cut from different text.
    ///
    /// Chunks of the old text are marked stale first so they stop matching
    /// queries even if the reindex fails.
    pub async fn refresh_if_stale(
        &self,
        unit: &UnitKey,
        candidate_id: CandidateId,
        text: &str,
    ) -> Result<Option<ReindexReport>> {
        let _unit_lock = self.unit_locks.lock(unit).await;
        self.refresh_locked(unit, candidate_id, text).await
    }

    pub(crate) async fn refresh_locked(
        &self,
        unit: &UnitKey,
        candidate_id: CandidateId,
        text: &str,
    ) -> Result<Option<ReindexReport>> {
        let source_hash = sha256_hex(text.as_bytes());
        let records = self.store.chunk_records(unit).await?;
        let fresh = !records.is_empty()
            && records
                .iter()
                .all(|r| r.source_hash == source_hash && r.candidate_id == candidate_id);
        if fresh {
            return Ok(None);
        }
        let marked = self.index.mark_unit_stale(unit);
        debug!(unit = %unit, marked, "Chunk source changed; reindexing");
        match self.reindex_locked(unit, candidate_id, text).await {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                // restored rows still belong to the old text
                self.index.mark_unit_stale(unit);
                Err(err)
            }
        }
    }

    /// Load persisted embeddings of a project into the index.
    pub async fn load_project(&self, project_id: &str) -> Result<usize> {
        let mut records = self.store.project_chunk_records(project_id).await?;
        records.sort_by(|a, b| a.unit.cmp(&b.unit).then(a.seq.cmp(&b.seq)));
        let mut loaded = 0;
        for record in records {
            if record.state != ChunkState::Indexed {
                continue;
            }
            let Some(vector) = record.embedding.as_deref() else {
                continue;
            };
            match self.index.upsert(&record.chunk_id, vector, chunk_meta(&record)) {
                Ok(()) => loaded += 1,
                Err(Error::Index(err)) => {
                    warn!(chunk_id = %record.chunk_id, error = %err, "Skipping stored chunk");
                }
                Err(other) => return Err(other),
            }
        }
        info!(project_id, loaded, "Loaded project chunks into vector index");
        Ok(loaded)
    }
}

fn chunk_meta(record: &ChunkRecord) -> ChunkMeta {
    ChunkMeta {
        unit: record.unit.clone(),
        candidate_id: record.candidate_id,
        seq: record.seq,
        content_hash: record.content_hash.clone(),
        text: record.text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectBible, Unit};
    use crate::search::hash_embedder::HashEmbedder;
    use crate::search::vector_index::{QueryFilter, ScanKernel};
    use crate::store::MemoryStore;

    fn config() -> IndexConfig {
        IndexConfig {
            dimension: 64,
            max_chunk_chars: 120,
            min_chunk_chars: 10,
            ..IndexConfig::default()
        }
    }

    async fn store_with_unit(unit: &UnitKey) -> SharedStore {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let bible = ProjectBible {
            project_id: unit.project_id.clone(),
            ..ProjectBible::default()
        };
        store.create_project(&bible).await.unwrap();
        store.put_unit(&Unit::new(unit.clone())).await.unwrap();
        store
    }

    fn indexer_on(store: SharedStore, kernel: ScanKernel) -> Indexer {
        let index = Arc::new(VectorIndex::with_kernel(64, kernel));
        Indexer::new(store, index, Arc::new(HashEmbedder::new(64)), &config())
    }

    async fn indexer(unit: &UnitKey) -> Indexer {
        indexer_on(store_with_unit(unit).await, ScanKernel::Portable)
    }

    const TEXT: &str = "The lamp burned all night on the cliff.\n\
                        Mara counted ships until the fog rolled in.\n\
                        At dawn a rowboat scraped the rocks below.";

    #[tokio::test]
    async fn reindex_then_query_finds_chunks() {
        let unit = UnitKey::new("p", 1);
        let indexer = indexer(&unit).await;
        let report = indexer.reindex(&unit, CandidateId(1), TEXT).await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.reused, 0);
        let query = HashEmbedder::new(64).embed_sync("counted ships until the fog");
        let hits = indexer
            .index()
            .query(&query, 1, &QueryFilter::project("p"))
            .unwrap();
        assert!(hits[0].meta.text.contains("fog"));
    }

    #[tokio::test]
    async fn unchanged_text_reuses_every_embedding() {
        let unit = UnitKey::new("p", 1);
        let indexer = indexer(&unit).await;
        indexer.reindex(&unit, CandidateId(1), TEXT).await.unwrap();
        let again = indexer.reindex(&unit, CandidateId(1), TEXT).await.unwrap();
        assert_eq!(again.embedded, 0);
        assert_eq!(again.reused, 3);
        assert_eq!(again.removed, 0);
    }

    #[tokio::test]
    async fn shrinking_text_removes_rows() {
        let unit = UnitKey::new("p", 1);
        let indexer = indexer(&unit).await;
        indexer.reindex(&unit, CandidateId(1), TEXT).await.unwrap();
        let first_line = TEXT.lines().next().unwrap();
        let report = indexer.reindex(&unit, CandidateId(2), first_line).await.unwrap();
        assert_eq!(report.reused, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(indexer.index().len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_index_and_store() {
        let unit = UnitKey::new("p", 1);
        let indexer = indexer(&unit).await;
        indexer.reindex(&unit, CandidateId(1), TEXT).await.unwrap();
        assert_eq!(indexer.remove(&unit).await.unwrap(), 3);
        assert!(indexer.index().is_empty());
        assert!(indexer.store.chunk_records(&unit).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_skips_fresh_units() {
        let unit = UnitKey::new("p", 1);
        let indexer = indexer(&unit).await;
        indexer.reindex(&unit, CandidateId(1), TEXT).await.unwrap();
        assert!(indexer.refresh_if_stale(&unit, CandidateId(1), TEXT).await.unwrap().is_none());
        let report = indexer
            .refresh_if_stale(&unit, CandidateId(1), "Entirely different text about a storm.")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(indexer.index().stats().stale, 0);
        assert_eq!(indexer.index().len(), 1);
    }

    #[tokio::test]
    async fn load_project_restores_rows() {
        let unit = UnitKey::new("p", 1);
        let store = store_with_unit(&unit).await;
        let first = indexer_on(Arc::clone(&store), ScanKernel::Unrolled);
        first.reindex(&unit, CandidateId(1), TEXT).await.unwrap();

        let second = indexer_on(store, ScanKernel::Unrolled);
        assert_eq!(second.load_project("p").await.unwrap(), 3);
        assert_eq!(second.index().len(), 3);
    }
}
