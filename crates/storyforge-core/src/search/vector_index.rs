//! In-memory cosine-similarity index over chunk embeddings.
//!
//! Rows live in one flat row-major `f32` matrix, L2-normalised on upsert so a
//! query is a dot product per row. Two scan kernels:
//!
//! - [`ScanKernel::Unrolled`]: 8-lane unrolled dot product per row.
//! - [`ScanKernel::Portable`]: block-batched scan that walks the query once per
//!   block of rows, accumulating every row of the block per dimension.
//!
//! Both kernels accumulate in `f64` with the same per-lane addition order and
//! the same lane reduction, so they produce identical scores.

use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::error::{Error, IndexError, Result};
use crate::model::{CandidateId, UnitKey};

const LANES: usize = 8;
const BLOCK_ROWS: usize = 64;

static PORTABLE_FALLBACK_WARNING: Once = Once::new();

/// Which scan loop answers queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKernel {
    Unrolled,
    Portable,
}

impl ScanKernel {
    /// Pick the accelerated kernel when it is preferred and the target
    /// supports wide float lanes, otherwise the portable one.
    #[must_use]
    pub fn detect(prefer_accelerated: bool) -> Self {
        if !prefer_accelerated {
            info!("Accelerated vector scan disabled by config; using portable kernel");
            return Self::Portable;
        }
        if accelerated_available() {
            Self::Unrolled
        } else {
            PORTABLE_FALLBACK_WARNING.call_once(|| {
                warn!(
                    target_arch = std::env::consts::ARCH,
                    "Accelerated vector scan unavailable; portable kernel latency grows linearly with indexed chunks"
                );
            });
            Self::Portable
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unrolled => "unrolled",
            Self::Portable => "portable",
        }
    }
}

const fn accelerated_available() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Metadata kept next to each vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub unit: UnitKey,
    pub candidate_id: CandidateId,
    pub seq: u32,
    pub content_hash: String,
    pub text: String,
}

/// Restricts which chunks a query scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub project_id: Option<String>,
    /// Only chunks of units with a smaller ordinal.
    pub before_ordinal: Option<u32>,
    pub min_score: Option<f64>,
}

impl QueryFilter {
    #[must_use]
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn before(mut self, ordinal: u32) -> Self {
        self.before_ordinal = Some(ordinal);
        self
    }

    #[must_use]
    pub fn min_score(mut self, score: f64) -> Self {
        self.min_score = Some(score);
        self
    }

    fn matches(&self, meta: &ChunkMeta) -> bool {
        if let Some(project_id) = &self.project_id {
            if &meta.unit.project_id != project_id {
                return false;
            }
        }
        if let Some(before) = self.before_ordinal {
            if meta.unit.ordinal >= before {
                return false;
            }
        }
        true
    }
}

/// One scored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f64,
    pub meta: ChunkMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub chunks: usize,
    pub stale: usize,
    pub dimension: usize,
    pub kernel: ScanKernel,
}

#[derive(Debug, Default)]
struct Inner {
    ids: Vec<String>,
    metas: Vec<ChunkMeta>,
    vectors: Vec<f32>,
    /// Insertion order; larger is more recent.
    stamps: Vec<u64>,
    stale: Vec<bool>,
    positions: HashMap<String, usize>,
    next_stamp: u64,
}

impl Inner {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn swap_remove(&mut self, row: usize, dimension: usize) {
        let last = self.len() - 1;
        let removed = self.ids.swap_remove(row);
        self.metas.swap_remove(row);
        self.stamps.swap_remove(row);
        self.stale.swap_remove(row);
        if row != last {
            self.vectors
                .copy_within(last * dimension..(last + 1) * dimension, row * dimension);
            self.positions.insert(self.ids[row].clone(), row);
        }
        self.vectors.truncate(last * dimension);
        self.positions.remove(&removed);
    }
}

/// Similarity index shared by the indexer and the context assembler.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    kernel: ScanKernel,
    inner: RwLock<Inner>,
}

impl VectorIndex {
    #[must_use]
    pub fn new(dimension: usize, prefer_accelerated: bool) -> Self {
        Self::with_kernel(dimension, ScanKernel::detect(prefer_accelerated))
    }

    #[must_use]
    pub fn with_kernel(dimension: usize, kernel: ScanKernel) -> Self {
        Self {
            dimension: dimension.max(1),
            kernel,
            inner: RwLock::new(Inner::default()),
        }
    }

    #[must_use]
    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(config.dimension, config.prefer_accelerated)
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn kernel(&self) -> ScanKernel {
        self.kernel
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().positions.contains_key(chunk_id)
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let inner = self.read();
        IndexStats {
            chunks: inner.len(),
            stale: inner.stale.iter().filter(|s| **s).count(),
            dimension: self.dimension,
            kernel: self.kernel,
        }
    }

    /// Chunk ids of `unit`, in row order.
    #[must_use]
    pub fn unit_chunk_ids(&self, unit: &UnitKey) -> Vec<String> {
        let inner = self.read();
        inner
            .ids
            .iter()
            .zip(&inner.metas)
            .filter(|(_, meta)| &meta.unit == unit)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn normalized(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            }
            .into());
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::InvalidVector("non-finite component".to_string()).into());
        }
        let norm = dot_unrolled(vector, vector).sqrt();
        if norm <= f64::from(f32::EPSILON) {
            return Err(IndexError::InvalidVector("zero-norm vector".to_string()).into());
        }
        Ok(vector
            .iter()
            .map(|&x| (f64::from(x) / norm) as f32)
            .collect())
    }

    /// Insert or replace a chunk. Clears its stale flag and makes it the
    /// most recent row.
    pub fn upsert(&self, chunk_id: &str, vector: &[f32], meta: ChunkMeta) -> Result<()> {
        let row_vector = self.normalized(vector)?;
        let dimension = self.dimension;
        let mut inner = self.write();
        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        if let Some(&row) = inner.positions.get(chunk_id) {
            inner.vectors[row * dimension..(row + 1) * dimension].copy_from_slice(&row_vector);
            inner.metas[row] = meta;
            inner.stamps[row] = stamp;
            inner.stale[row] = false;
        } else {
            let row = inner.len();
            inner.ids.push(chunk_id.to_string());
            inner.metas.push(meta);
            inner.vectors.extend_from_slice(&row_vector);
            inner.stamps.push(stamp);
            inner.stale.push(false);
            inner.positions.insert(chunk_id.to_string(), row);
        }
        Ok(())
    }

    pub fn delete(&self, chunk_id: &str) -> bool {
        let mut inner = self.write();
        match inner.positions.get(chunk_id).copied() {
            Some(row) => {
                inner.swap_remove(row, self.dimension);
                true
            }
            None => false,
        }
    }

    fn delete_where(&self, predicate: impl Fn(&ChunkMeta) -> bool) -> usize {
        let mut inner = self.write();
        let mut removed = 0;
        let mut row = inner.len();
        while row > 0 {
            row -= 1;
            if predicate(&inner.metas[row]) {
                inner.swap_remove(row, self.dimension);
                removed += 1;
            }
        }
        removed
    }

    pub fn delete_by_unit(&self, unit: &UnitKey) -> usize {
        let removed = self.delete_where(|meta| &meta.unit == unit);
        if removed > 0 {
            debug!(unit = %unit, removed, "Removed unit chunks from vector index");
        }
        removed
    }

    pub fn delete_by_project(&self, project_id: &str) -> usize {
        self.delete_where(|meta| meta.unit.project_id == project_id)
    }

    /// Exclude a chunk from retrieval until it is upserted again.
    pub fn mark_stale(&self, chunk_id: &str) -> bool {
        let mut inner = self.write();
        match inner.positions.get(chunk_id).copied() {
            Some(row) => {
                inner.stale[row] = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_unit_stale(&self, unit: &UnitKey) -> usize {
        let mut inner = self.write();
        let Inner { metas, stale, .. } = &mut *inner;
        let mut marked = 0;
        for (meta, flag) in metas.iter().zip(stale.iter_mut()) {
            if &meta.unit == unit && !*flag {
                *flag = true;
                marked += 1;
            }
        }
        marked
    }

    /// Top `k` chunks by cosine similarity, best first; equal scores put the
    /// most recently upserted chunk first. Stale chunks never match. A filter
    /// that matches nothing yields an empty result.
    pub fn query(&self, vector: &[f32], k: usize, filter: &QueryFilter) -> Result<Vec<SearchHit>> {
        let query = self.normalized(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let inner = self.read();
        let rows: Vec<usize> = (0..inner.len())
            .filter(|&row| !inner.stale[row] && filter.matches(&inner.metas[row]))
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let scores = match self.kernel {
            ScanKernel::Unrolled => {
                scan_unrolled(&query, &inner.vectors, self.dimension, &rows)
            }
            ScanKernel::Portable => {
                scan_portable(&query, &inner.vectors, self.dimension, &rows)
            }
        };

        let mut scored: Vec<(usize, f64)> = rows
            .into_iter()
            .zip(scores)
            .map(|(row, score)| (row, score.clamp(-1.0, 1.0)))
            .filter(|(_, score)| filter.min_score.is_none_or(|min| *score >= min))
            .collect();
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| inner.stamps[b.0].cmp(&inner.stamps[a.0]))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(row, score)| SearchHit {
                chunk_id: inner.ids[row].clone(),
                score,
                meta: inner.metas[row].clone(),
            })
            .collect())
    }

    /// [`Self::query`] on the blocking pool.
    pub async fn query_async(
        self: &Arc<Self>,
        vector: Vec<f32>,
        k: usize,
        filter: QueryFilter,
    ) -> Result<Vec<SearchHit>> {
        let index = Arc::clone(self);
        tokio::task::spawn_blocking(move || index.query(&vector, k, &filter))
            .await
            .map_err(|e| Error::Runtime(format!("vector query task failed: {e}")))?
    }
}

/// Cosine similarity of two equal-length vectors; `None` when lengths differ
/// or either vector has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let norm_a = dot_unrolled(a, a).sqrt();
    let norm_b = dot_unrolled(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 || !norm_a.is_finite() || !norm_b.is_finite() {
        return None;
    }
    Some((dot_unrolled(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

#[inline]
fn reduce_lanes(lanes: &[f64; LANES], tail: f64) -> f64 {
    (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]) + (lanes[4] + lanes[5]) + (lanes[6] + lanes[7])
        + tail
}

fn dot_unrolled(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let chunks = n / LANES;
    let mut sum0 = 0.0f64;
    let mut sum1 = 0.0f64;
    let mut sum2 = 0.0f64;
    let mut sum3 = 0.0f64;
    let mut sum4 = 0.0f64;
    let mut sum5 = 0.0f64;
    let mut sum6 = 0.0f64;
    let mut sum7 = 0.0f64;

    for i in 0..chunks {
        let base = i * LANES;
        sum0 += f64::from(a[base]) * f64::from(b[base]);
        sum1 += f64::from(a[base + 1]) * f64::from(b[base + 1]);
        sum2 += f64::from(a[base + 2]) * f64::from(b[base + 2]);
        sum3 += f64::from(a[base + 3]) * f64::from(b[base + 3]);
        sum4 += f64::from(a[base + 4]) * f64::from(b[base + 4]);
        sum5 += f64::from(a[base + 5]) * f64::from(b[base + 5]);
        sum6 += f64::from(a[base + 6]) * f64::from(b[base + 6]);
        sum7 += f64::from(a[base + 7]) * f64::from(b[base + 7]);
    }

    let mut tail = 0.0f64;
    for i in (chunks * LANES)..n {
        tail += f64::from(a[i]) * f64::from(b[i]);
    }
    reduce_lanes(&[sum0, sum1, sum2, sum3, sum4, sum5, sum6, sum7], tail)
}

fn scan_unrolled(query: &[f32], vectors: &[f32], dimension: usize, rows: &[usize]) -> Vec<f64> {
    rows.iter()
        .map(|&row| dot_unrolled(&vectors[row * dimension..(row + 1) * dimension], query))
        .collect()
}

/// Dimension-outer, row-inner scan over blocks of rows.
fn scan_portable(query: &[f32], vectors: &[f32], dimension: usize, rows: &[usize]) -> Vec<f64> {
    let body = (dimension / LANES) * LANES;
    let mut out = Vec::with_capacity(rows.len());
    let mut lanes = vec![[0.0f64; LANES]; BLOCK_ROWS];
    let mut tails = vec![0.0f64; BLOCK_ROWS];

    for block in rows.chunks(BLOCK_ROWS) {
        let lanes = &mut lanes[..block.len()];
        let tails = &mut tails[..block.len()];
        lanes.fill([0.0; LANES]);
        tails.fill(0.0);

        for (d, &q) in query.iter().enumerate().take(body) {
            let q = f64::from(q);
            let lane = d % LANES;
            for (acc, &row) in lanes.iter_mut().zip(block) {
                acc[lane] += f64::from(vectors[row * dimension + d]) * q;
            }
        }
        for (d, &q) in query.iter().enumerate().skip(body) {
            let q = f64::from(q);
            for (tail, &row) in tails.iter_mut().zip(block) {
                *tail += f64::from(vectors[row * dimension + d]) * q;
            }
        }
        out.extend(lanes.iter().zip(tails.iter()).map(|(acc, tail)| reduce_lanes(acc, *tail)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(project: &str, ordinal: u32, seq: u32) -> ChunkMeta {
        ChunkMeta {
            unit: UnitKey::new(project, ordinal),
            candidate_id: CandidateId(u64::from(ordinal)),
            seq,
            content_hash: format!("h{ordinal}-{seq}"),
            text: format!("chunk {seq} of unit {ordinal}"),
        }
    }

    fn index(kernel: ScanKernel) -> VectorIndex {
        VectorIndex::with_kernel(4, kernel)
    }

    #[test]
    fn dot_product_correctness() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((dot_unrolled(&a, &b) - 32.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dot_product_8lane() {
        // >8 dimensions exercises the unrolled body and the tail
        let a: Vec<f32> = (0..19).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..19).map(|i| (18 - i) as f32).collect();
        let expected: f64 = a.iter().zip(&b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
        assert!((dot_unrolled(&a, &b) - expected).abs() < 1e-9);
    }

    #[test]
    fn kernels_produce_identical_scores() {
        let dim = 21;
        let rows: Vec<Vec<f32>> = (0..150)
            .map(|r| (0..dim).map(|d| ((r * 31 + d * 7) % 17) as f32 - 8.0).collect())
            .collect();
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let query: Vec<f32> = (0..dim).map(|d| (d as f32).sin()).collect();
        let selected: Vec<usize> = (0..150).filter(|r| r % 3 != 0).collect();
        let a = scan_unrolled(&query, &flat, dim, &selected);
        let b = scan_portable(&query, &flat, dim, &selected);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn query_returns_nearest_first() {
        for kernel in [ScanKernel::Unrolled, ScanKernel::Portable] {
            let idx = index(kernel);
            idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
            idx.upsert("b", &[0.0, 1.0, 0.0, 0.0], meta("p", 1, 1)).unwrap();
            idx.upsert("c", &[0.7, 0.7, 0.0, 0.0], meta("p", 1, 2)).unwrap();
            let hits = idx.query(&[1.0, 0.1, 0.0, 0.0], 3, &QueryFilter::default()).unwrap();
            let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
            assert_eq!(ids, vec!["a", "c", "b"], "{kernel:?}");
            assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }

    #[test]
    fn ties_prefer_most_recent() {
        let idx = index(ScanKernel::Unrolled);
        idx.upsert("old", &[0.0, 0.0, 1.0, 0.0], meta("p", 1, 0)).unwrap();
        idx.upsert("new", &[0.0, 0.0, 2.0, 0.0], meta("p", 2, 0)).unwrap();
        let hits = idx.query(&[0.0, 0.0, 1.0, 0.0], 2, &QueryFilter::default()).unwrap();
        assert_eq!(hits[0].chunk_id, "new");
        assert_eq!(hits[1].chunk_id, "old");
        // re-upserting refreshes recency
        idx.upsert("old", &[0.0, 0.0, 1.0, 0.0], meta("p", 1, 0)).unwrap();
        let hits = idx.query(&[0.0, 0.0, 1.0, 0.0], 2, &QueryFilter::default()).unwrap();
        assert_eq!(hits[0].chunk_id, "old");
    }

    #[test]
    fn filter_matching_nothing_is_empty_not_error() {
        let idx = index(ScanKernel::Portable);
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 3, 0)).unwrap();
        let hits = idx
            .query(&[1.0, 0.0, 0.0, 0.0], 5, &QueryFilter::project("other"))
            .unwrap();
        assert!(hits.is_empty());
        let hits = idx
            .query(&[1.0, 0.0, 0.0, 0.0], 5, &QueryFilter::project("p").before(3))
            .unwrap();
        assert!(hits.is_empty());
        let empty = index(ScanKernel::Unrolled);
        assert!(empty.query(&[1.0, 0.0, 0.0, 0.0], 5, &QueryFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn stale_chunks_excluded_until_upserted() {
        let idx = index(ScanKernel::Unrolled);
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
        idx.upsert("b", &[0.9, 0.1, 0.0, 0.0], meta("p", 2, 0)).unwrap();
        assert_eq!(idx.mark_unit_stale(&UnitKey::new("p", 1)), 1);
        let hits = idx.query(&[1.0, 0.0, 0.0, 0.0], 5, &QueryFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b");
        assert_eq!(idx.stats().stale, 1);
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
        assert_eq!(idx.stats().stale, 0);
        assert!(idx.mark_stale("a"));
        assert!(!idx.mark_stale("missing"));
    }

    #[test]
    fn delete_keeps_remaining_rows_addressable() {
        let idx = index(ScanKernel::Portable);
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
        idx.upsert("b", &[0.0, 1.0, 0.0, 0.0], meta("p", 1, 1)).unwrap();
        idx.upsert("c", &[0.0, 0.0, 1.0, 0.0], meta("p", 2, 0)).unwrap();
        assert!(idx.delete("a"));
        assert!(!idx.delete("a"));
        assert_eq!(idx.len(), 2);
        // "c" moved into row 0; its vector must have moved with it
        let hits = idx.query(&[0.0, 0.0, 1.0, 0.0], 1, &QueryFilter::default()).unwrap();
        assert_eq!(hits[0].chunk_id, "c");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn delete_by_unit_and_project() {
        let idx = index(ScanKernel::Unrolled);
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
        idx.upsert("b", &[0.0, 1.0, 0.0, 0.0], meta("p", 1, 1)).unwrap();
        idx.upsert("c", &[0.0, 0.0, 1.0, 0.0], meta("p", 2, 0)).unwrap();
        idx.upsert("d", &[0.0, 0.0, 0.0, 1.0], meta("q", 1, 0)).unwrap();
        assert_eq!(idx.delete_by_unit(&UnitKey::new("p", 1)), 2);
        assert!(idx.unit_chunk_ids(&UnitKey::new("p", 1)).is_empty());
        assert_eq!(idx.delete_by_project("p"), 1);
        assert_eq!(idx.len(), 1);
        assert!(idx.contains("d"));
    }

    #[test]
    fn rejects_bad_vectors() {
        let idx = index(ScanKernel::Unrolled);
        let err = idx.upsert("a", &[1.0, 0.0], meta("p", 1, 0)).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError::DimensionMismatch { expected: 4, actual: 2 })));
        let err = idx.upsert("a", &[0.0; 4], meta("p", 1, 0)).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError::InvalidVector(_))));
        let err = idx.upsert("a", &[f32::NAN, 0.0, 0.0, 1.0], meta("p", 1, 0)).unwrap_err();
        assert!(matches!(err, Error::Index(IndexError::InvalidVector(_))));
        assert!(idx.is_empty());
    }

    #[test]
    fn min_score_filter() {
        let idx = index(ScanKernel::Unrolled);
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
        idx.upsert("b", &[-1.0, 0.0, 0.0, 0.0], meta("p", 1, 1)).unwrap();
        let hits = idx
            .query(&[1.0, 0.0, 0.0, 0.0], 5, &QueryFilter::default().min_score(0.0))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn cosine_similarity_basics() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [-2.0f32, 0.5, 1.0];
        let ab = cosine_similarity(&a, &b).unwrap();
        let ba = cosine_similarity(&b, &a).unwrap();
        assert_eq!(ab.to_bits(), ba.to_bits());
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-12);
        assert!(cosine_similarity(&a, &[0.0; 3]).is_none());
        assert!(cosine_similarity(&a, &[1.0]).is_none());
    }

    #[tokio::test]
    async fn query_async_runs_on_blocking_pool() {
        let idx = Arc::new(index(ScanKernel::Portable));
        idx.upsert("a", &[1.0, 0.0, 0.0, 0.0], meta("p", 1, 0)).unwrap();
        let hits = idx
            .query_async(vec![1.0, 0.0, 0.0, 0.0], 1, QueryFilter::project("p"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn detect_respects_preference() {
        assert_eq!(ScanKernel::detect(false), ScanKernel::Portable);
        if accelerated_available() {
            assert_eq!(ScanKernel::detect(true), ScanKernel::Unrolled);
        }
    }
}
