//! Property-based tests for the vector index.
//!
//! Verifies:
//! - Cosine similarity is symmetric and bounded
//! - Results are sorted by descending score and never exceed k
//! - Both scan kernels return the same chunks in the same order
//! - Stale chunks never match
//! - The ordinal filter excludes units at or after the bound
//! - Deleting a unit removes exactly its rows

use proptest::prelude::*;

use storyforge_core::model::{CandidateId, UnitKey};
use storyforge_core::search::{ChunkMeta, QueryFilter, ScanKernel, VectorIndex, cosine_similarity};

const DIM: usize = 8;

fn arb_vector() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..1.0, DIM)
        .prop_filter("non-zero", |v| v.iter().any(|x| x.abs() > 0.01))
}

fn arb_rows() -> impl Strategy<Value = Vec<(u32, Vec<f32>)>> {
    prop::collection::vec((1u32..6, arb_vector()), 1..40)
}

fn build(kernel: ScanKernel, rows: &[(u32, Vec<f32>)]) -> VectorIndex {
    let index = VectorIndex::with_kernel(DIM, kernel);
    for (i, (ordinal, vector)) in rows.iter().enumerate() {
        let meta = ChunkMeta {
            unit: UnitKey::new("p", *ordinal),
            candidate_id: CandidateId(i as u64),
            seq: i as u32,
            content_hash: format!("h{i}"),
            text: format!("chunk {i}"),
        };
        index.upsert(&format!("c{i}"), vector, meta).unwrap();
    }
    index
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_similarity_symmetric(a in arb_vector(), b in arb_vector()) {
        let ab = cosine_similarity(&a, &b).unwrap();
        let ba = cosine_similarity(&b, &a).unwrap();
        prop_assert!((ab - ba).abs() < 1e-9);
        prop_assert!((-1.0..=1.0).contains(&ab));
        let aa = cosine_similarity(&a, &a).unwrap();
        prop_assert!((aa - 1.0).abs() < 1e-6);
    }

    #[test]
    fn prop_results_sorted_and_bounded(
        rows in arb_rows(),
        query in arb_vector(),
        k in 0usize..12,
    ) {
        let index = build(ScanKernel::Portable, &rows);
        let hits = index.query(&query, k, &QueryFilter::project("p")).unwrap();
        prop_assert!(hits.len() <= k.min(rows.len()));
        for pair in hits.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
        for hit in &hits {
            prop_assert!((-1.0..=1.0).contains(&hit.score));
        }
    }

    #[test]
    fn prop_kernels_agree(rows in arb_rows(), query in arb_vector()) {
        let unrolled = build(ScanKernel::Unrolled, &rows);
        let portable = build(ScanKernel::Portable, &rows);
        let filter = QueryFilter::project("p");
        let a = unrolled.query(&query, rows.len(), &filter).unwrap();
        let b = portable.query(&query, rows.len(), &filter).unwrap();
        prop_assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            prop_assert!((x.score - y.score).abs() < 1e-4);
        }
    }

    #[test]
    fn prop_stale_never_matches(rows in arb_rows(), query in arb_vector(), ordinal in 1u32..6) {
        let index = build(ScanKernel::Unrolled, &rows);
        index.mark_unit_stale(&UnitKey::new("p", ordinal));
        let hits = index.query(&query, rows.len(), &QueryFilter::project("p")).unwrap();
        prop_assert!(hits.iter().all(|h| h.meta.unit.ordinal != ordinal));
    }

    #[test]
    fn prop_before_filter_bounds_ordinals(rows in arb_rows(), query in arb_vector(), bound in 1u32..7) {
        let index = build(ScanKernel::Unrolled, &rows);
        let hits = index
            .query(&query, rows.len(), &QueryFilter::project("p").before(bound))
            .unwrap();
        prop_assert!(hits.iter().all(|h| h.meta.unit.ordinal < bound));
        let expected = rows.iter().filter(|(o, _)| *o < bound).count();
        prop_assert_eq!(hits.len(), expected);
    }

    #[test]
    fn prop_delete_unit_removes_only_its_rows(rows in arb_rows(), ordinal in 1u32..6) {
        let index = build(ScanKernel::Portable, &rows);
        let expected = rows.iter().filter(|(o, _)| *o == ordinal).count();
        let removed = index.delete_by_unit(&UnitKey::new("p", ordinal));
        prop_assert_eq!(removed, expected);
        prop_assert_eq!(index.len(), rows.len() - expected);
        prop_assert!(index.unit_chunk_ids(&UnitKey::new("p", ordinal)).is_empty());
    }
}

#[test]
fn other_project_is_invisible() {
    let index = build(ScanKernel::Unrolled, &[(1, vec![1.0; DIM])]);
    let hits = index
        .query(&[1.0; DIM], 5, &QueryFilter::project("q"))
        .unwrap();
    assert!(hits.is_empty());
}

#[test]
fn zero_vector_is_rejected() {
    let index = VectorIndex::with_kernel(DIM, ScanKernel::Portable);
    assert!(index.query(&[0.0; DIM], 5, &QueryFilter::default()).is_err());
}
