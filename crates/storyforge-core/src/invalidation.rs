//! Cascading invalidation of data derived from unit selections.
//!
//! Chunks and entity snapshots are caches of selected text. Whenever a
//! selection is cleared, replaced, purged or deleted, this is the one place
//! that drops what was derived from it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::EntityIndex;
use crate::error::Result;
use crate::model::UnitKey;
use crate::search::Indexer;
use crate::store::SharedStore;

/// Totals removed by a project-wide purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPurge {
    pub units: usize,
    pub candidates: usize,
    pub chunks: usize,
}

pub struct CascadeInvalidator {
    store: SharedStore,
    indexer: Arc<Indexer>,
    entities: Arc<EntityIndex>,
}

impl CascadeInvalidator {
    #[must_use]
    pub fn new(store: SharedStore, indexer: Arc<Indexer>, entities: Arc<EntityIndex>) -> Self {
        Self {
            store,
            indexer,
            entities,
        }
    }

    /// Remove the unit's rows from the vector index and its chunk records.
    pub async fn invalidate_unit_chunks(&self, unit: &UnitKey) -> Result<usize> {
        self.indexer.remove(unit).await
    }

    /// Drop entity snapshots at or after `from_ordinal`.
    pub async fn invalidate_entities_from(&self, project_id: &str, from_ordinal: u32) -> Result<usize> {
        self.entities.invalidate_from(project_id, from_ordinal).await
    }

    /// Recompute entity snapshots at or after `from_ordinal` from the
    /// current selections.
    pub async fn refresh_entities_from(&self, project_id: &str, from_ordinal: u32) -> Result<usize> {
        self.entities.rebuild_from(project_id, from_ordinal).await
    }

    /// Drop everything derived from the unit's selection. The caller clears
    /// the selection beforehand and refreshes entities afterwards.
    pub async fn invalidate_selection(&self, unit: &UnitKey) -> Result<usize> {
        let chunks = self.invalidate_unit_chunks(unit).await?;
        let entries = self
            .invalidate_entities_from(&unit.project_id, unit.ordinal)
            .await?;
        debug!(unit = %unit, chunks, entries, "Selection-derived data invalidated");
        Ok(chunks)
    }

    /// Delete a unit with its candidates and chunks, then rebuild the
    /// snapshots of later units without it.
    pub async fn delete_unit(&self, unit: &UnitKey) -> Result<bool> {
        let existed = {
            // a reindex waiting on the unit must find it gone
            let _unit_lock = self.indexer.lock_unit(unit).await;
            self.indexer.remove_locked(unit).await?;
            self.store.delete_unit(unit).await?
        };
        self.refresh_entities_from(&unit.project_id, unit.ordinal)
            .await?;
        info!(unit = %unit, existed, "Unit deleted");
        Ok(existed)
    }

    /// Purge candidates, chunks and snapshots of every unit in the project
    /// and reset the units to `not_started`.
    pub async fn purge_project_units(&self, project_id: &str) -> Result<ProjectPurge> {
        let mut purge = ProjectPurge::default();
        for unit in self.store.list_units(project_id).await? {
            let _unit_lock = self.indexer.lock_unit(&unit.key).await;
            let rows = self.indexer.remove_locked(&unit.key).await?;
            let counts = self.store.purge_unit_outputs(&unit.key).await?;
            purge.units += 1;
            purge.candidates += counts.candidates;
            purge.chunks += rows.max(counts.chunks);
        }
        // rows whose unit record is already gone
        purge.chunks += self.indexer.index().delete_by_project(project_id);
        self.invalidate_entities_from(project_id, 0).await?;
        Ok(purge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::model::{CandidateId, GenerationStatus, NewCandidate, ProjectBible, Unit};
    use crate::search::{HashEmbedder, QueryFilter, VectorIndex};
    use crate::store::MemoryStore;

    const TEXT: &str = "The lamp burned all night.\n\nMara counted the ships.";

    async fn fixture() -> (SharedStore, Arc<Indexer>, CascadeInvalidator, CandidateId) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store
            .create_project(&ProjectBible {
                project_id: "p".into(),
                ..ProjectBible::default()
            })
            .await
            .unwrap();
        let key = UnitKey::new("p", 1);
        store.put_unit(&Unit::new(key.clone())).await.unwrap();
        let candidate = store
            .append_candidate(&NewCandidate {
                unit: key.clone(),
                slot: 0,
                attempt: 0,
                text: TEXT.to_string(),
                word_count: 9,
                summary: String::new(),
            })
            .await
            .unwrap();
        store
            .commit_selection(&key, Some(candidate.id), GenerationStatus::Done)
            .await
            .unwrap();

        let config = IndexConfig {
            dimension: 32,
            min_chunk_chars: 5,
            ..IndexConfig::default()
        };
        let index = Arc::new(VectorIndex::from_config(&config));
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            index,
            Arc::new(HashEmbedder::new(32)),
            &config,
        ));
        indexer.reindex(&key, candidate.id, TEXT).await.unwrap();
        let entities = Arc::new(EntityIndex::new(Arc::clone(&store)));
        let invalidator =
            CascadeInvalidator::new(Arc::clone(&store), Arc::clone(&indexer), entities);
        (store, indexer, invalidator, candidate.id)
    }

    #[tokio::test]
    async fn invalidate_selection_removes_rows_and_records() {
        let (store, indexer, invalidator, _) = fixture().await;
        let key = UnitKey::new("p", 1);
        assert!(invalidator.invalidate_selection(&key).await.unwrap() > 0);
        assert!(indexer.index().is_empty());
        assert!(store.chunk_records(&key).await.unwrap().is_empty());
        let hits = indexer
            .index()
            .query(&HashEmbedder::new(32).embed_sync("ships"), 5, &QueryFilter::project("p"))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn project_purge_resets_units() {
        let (store, indexer, invalidator, _) = fixture().await;
        let purge = invalidator.purge_project_units("p").await.unwrap();
        assert_eq!(purge.units, 1);
        assert_eq!(purge.candidates, 1);
        assert!(purge.chunks > 0);
        assert!(indexer.index().is_empty());
        let unit = store.unit(&UnitKey::new("p", 1)).await.unwrap().unwrap();
        assert_eq!(unit.status, GenerationStatus::NotStarted);
        assert!(unit.selected.is_none());
    }

    #[tokio::test]
    async fn delete_unit_cascades() {
        let (store, indexer, invalidator, candidate) = fixture().await;
        let key = UnitKey::new("p", 1);
        assert!(invalidator.delete_unit(&key).await.unwrap());
        assert!(store.unit(&key).await.unwrap().is_none());
        assert!(store.candidate(candidate).await.unwrap().is_none());
        assert!(indexer.index().is_empty());
        assert!(!invalidator.delete_unit(&key).await.unwrap());
    }

    #[tokio::test]
    async fn delete_waits_for_the_unit_lock() {
        let (store, indexer, invalidator, _) = fixture().await;
        let invalidator = Arc::new(invalidator);
        let key = UnitKey::new("p", 1);

        let held = indexer.lock_unit(&key).await;
        let deleting = {
            let invalidator = Arc::clone(&invalidator);
            let key = key.clone();
            tokio::spawn(async move { invalidator.delete_unit(&key).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!deleting.is_finished());
        assert!(store.unit(&key).await.unwrap().is_some());
        assert!(!indexer.index().is_empty());

        drop(held);
        assert!(deleting.await.unwrap().unwrap());
        assert!(store.unit(&key).await.unwrap().is_none());
        assert!(indexer.index().is_empty());
    }

    #[tokio::test]
    async fn purge_waits_for_a_running_reindex() {
        let (store, indexer, invalidator, candidate) = fixture().await;
        let invalidator = Arc::new(invalidator);
        let key = UnitKey::new("p", 1);

        let held = indexer.lock_unit(&key).await;
        let purging = {
            let invalidator = Arc::clone(&invalidator);
            tokio::spawn(async move { invalidator.purge_project_units("p").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!purging.is_finished());
        // the lock holder finishes its write before the purge proceeds
        indexer
            .reindex_locked(&key, candidate, "A late paragraph about the harbor.")
            .await
            .unwrap();
        drop(held);

        purging.await.unwrap().unwrap();
        assert!(indexer.index().is_empty());
        assert!(store.chunk_records(&key).await.unwrap().is_empty());
    }
}
