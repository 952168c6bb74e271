//! Retrieval: chunking, embedding, vector index and the indexer that keeps
//! them in step with selected unit text.

pub mod chunking;
pub mod embedder;
pub mod hash_embedder;
pub mod indexer;
pub mod vector_index;

pub use chunking::{ChunkPolicy, TextChunk, chunk_id, sha256_hex, split_into_chunks};
pub use embedder::{EmbedError, Embedder, EmbedderInfo};
pub use hash_embedder::HashEmbedder;
pub use indexer::{Indexer, ReindexReport};
pub use vector_index::{
    ChunkMeta, IndexStats, QueryFilter, ScanKernel, SearchHit, VectorIndex, cosine_similarity,
};
