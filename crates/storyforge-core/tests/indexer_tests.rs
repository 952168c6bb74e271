//! Indexer behaviour against the memory store: embedding reuse, failed
//! chunk exclusion, staleness checks, warm-up from stored records and
//! recovery from a failed record write.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{DIM, FaultyStore, FlakyEmbedder, bible, memory_store, test_config};
use storyforge_core::model::{CandidateId, ChunkState, NewCandidate, Unit, UnitKey};
use storyforge_core::search::{HashEmbedder, Indexer, QueryFilter, ScanKernel, VectorIndex};
use storyforge_core::store::{ProjectStore, SharedStore};

const THREE_PARAGRAPHS: &str = "The lamp burned all night above the reef.\n\n\
     Tomas hauled the nets in before the squall.\n\n\
     Mara counted the ships that did not come back.";

const ONE_EDITED: &str = "The lamp burned all night above the reef.\n\n\
     Tomas left the nets out and the squall took them.\n\n\
     Mara counted the ships that did not come back.";

struct Fixture {
    store: SharedStore,
    embedder: Arc<FlakyEmbedder>,
    index: Arc<VectorIndex>,
    indexer: Indexer,
    unit: UnitKey,
    candidate: CandidateId,
}

async fn fixture() -> Fixture {
    let store = memory_store();
    store.create_project(&bible("p", 2)).await.unwrap();
    let unit = UnitKey::new("p", 1);
    store.put_unit(&Unit::new(unit.clone())).await.unwrap();
    let candidate = store
        .append_candidate(&NewCandidate {
            unit: unit.clone(),
            slot: 0,
            attempt: 0,
            text: THREE_PARAGRAPHS.to_string(),
            word_count: 25,
            summary: "The lamp burned".to_string(),
        })
        .await
        .unwrap()
        .id;
    let embedder = Arc::new(FlakyEmbedder::new());
    let index = Arc::new(VectorIndex::with_kernel(DIM, ScanKernel::Portable));
    let indexer = Indexer::new(
        Arc::clone(&store),
        Arc::clone(&index),
        embedder.clone(),
        &test_config().index,
    );
    Fixture {
        store,
        embedder,
        index,
        indexer,
        unit,
        candidate,
    }
}

#[tokio::test]
async fn reindexing_same_text_reuses_embeddings() {
    let f = fixture().await;
    let first = f
        .indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert_eq!(first.chunks, 3);
    assert_eq!(first.embedded, 3);
    assert_eq!(first.reused, 0);
    assert_eq!(f.index.len(), 3);

    let second = f
        .indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert_eq!(second.reused, 3);
    assert_eq!(second.embedded, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(f.index.len(), 3);
    assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn edited_paragraph_is_the_only_one_embedded() {
    let f = fixture().await;
    f.indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    let report = f
        .indexer
        .reindex(&f.unit, f.candidate, ONE_EDITED)
        .await
        .unwrap();
    assert_eq!(report.reused, 2);
    assert_eq!(report.embedded, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(f.index.len(), 3);

    let probe = HashEmbedder::new(DIM).embed_sync("Tomas left the nets out and the squall took them.");
    let hits = f
        .index
        .query(&probe, 1, &QueryFilter::project("p"))
        .unwrap();
    assert!(hits[0].meta.text.contains("squall took them"));
}

#[tokio::test]
async fn failed_embeddings_are_excluded_and_repaired() {
    let f = fixture().await;
    f.embedder.failing.store(true, Ordering::SeqCst);
    let report = f
        .indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(report.failed, 3);
    assert!(f.index.is_empty());
    let records = f.store.chunk_records(&f.unit).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.state == ChunkState::Failed));

    f.embedder.failing.store(false, Ordering::SeqCst);
    let repaired = f
        .indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert_eq!(repaired.embedded, 3);
    assert_eq!(repaired.failed, 0);
    assert_eq!(f.index.len(), 3);
}

#[tokio::test]
async fn refresh_skips_current_chunks() {
    let f = fixture().await;
    let first = f
        .indexer
        .refresh_if_stale(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert!(first.is_some());
    let again = f
        .indexer
        .refresh_if_stale(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert!(again.is_none());

    let changed = f
        .indexer
        .refresh_if_stale(&f.unit, f.candidate, ONE_EDITED)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(changed.embedded, 1);

    // same text under a different candidate still counts as stale
    let other = CandidateId(f.candidate.0 + 100);
    let moved = f
        .indexer
        .refresh_if_stale(&f.unit, other, ONE_EDITED)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.reused, 3);
    let records = f.store.chunk_records(&f.unit).await.unwrap();
    assert!(records.iter().all(|r| r.candidate_id == other));
}

#[tokio::test]
async fn load_project_restores_only_indexed_chunks() {
    let f = fixture().await;
    f.indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();

    let second = UnitKey::new("p", 2);
    f.store.put_unit(&Unit::new(second.clone())).await.unwrap();
    f.embedder.failing.store(true, Ordering::SeqCst);
    let report = f
        .indexer
        .reindex(&second, f.candidate, "A gull landed on the rail of the gallery.")
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let fresh_index = Arc::new(VectorIndex::with_kernel(DIM, ScanKernel::Unrolled));
    let cold = Indexer::new(
        Arc::clone(&f.store),
        Arc::clone(&fresh_index),
        Arc::new(HashEmbedder::new(DIM)),
        &test_config().index,
    );
    assert_eq!(cold.load_project("p").await.unwrap(), 3);
    assert_eq!(fresh_index.len(), 3);
    assert!(fresh_index.unit_chunk_ids(&second).is_empty());
    assert_eq!(cold.load_project("nobody").await.unwrap(), 0);
}

#[tokio::test]
async fn remove_clears_index_and_records() {
    let f = fixture().await;
    f.indexer
        .reindex(&f.unit, f.candidate, THREE_PARAGRAPHS)
        .await
        .unwrap();
    assert_eq!(f.indexer.remove(&f.unit).await.unwrap(), 3);
    assert!(f.index.is_empty());
    assert!(f.store.chunk_records(&f.unit).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_record_write_restores_previous_rows() {
    let store = Arc::new(FaultyStore::new());
    store.create_project(&bible("p", 1)).await.unwrap();
    let unit = UnitKey::new("p", 1);
    store.put_unit(&Unit::new(unit.clone())).await.unwrap();
    let index = Arc::new(VectorIndex::with_kernel(DIM, ScanKernel::Portable));
    let indexer = Indexer::new(
        store.clone(),
        Arc::clone(&index),
        Arc::new(HashEmbedder::new(DIM)),
        &test_config().index,
    );
    let candidate = CandidateId(1);
    indexer.reindex(&unit, candidate, THREE_PARAGRAPHS).await.unwrap();
    let before = store.chunk_records(&unit).await.unwrap();

    store.failing_chunk_writes.store(true, Ordering::SeqCst);
    assert!(indexer.reindex(&unit, candidate, ONE_EDITED).await.is_err());
    assert_eq!(store.chunk_records(&unit).await.unwrap(), before);
    let mut ids = index.unit_chunk_ids(&unit);
    ids.sort();
    let mut stored: Vec<String> = before.iter().map(|r| r.chunk_id.clone()).collect();
    stored.sort();
    assert_eq!(ids, stored);
    let query = HashEmbedder::new(DIM).embed_sync("Tomas hauled the nets in before the squall.");
    let hits = index.query(&query, 1, &QueryFilter::project("p")).unwrap();
    assert!(hits[0].meta.text.contains("hauled the nets"));

    // a failed refresh leaves the restored rows marked stale
    assert!(indexer.refresh_if_stale(&unit, candidate, ONE_EDITED).await.is_err());
    assert_eq!(index.stats().stale, 3);

    store.heal();
    let report = indexer.reindex(&unit, candidate, ONE_EDITED).await.unwrap();
    assert_eq!(report.reused, 2);
    assert_eq!(index.stats().stale, 0);
}
