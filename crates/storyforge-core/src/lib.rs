//! storyforge-core: Core library for storyforge
//!
//! Generates long-form fiction one unit (chapter or section) at a time.
//! Each unit gets several candidates from a text-generation backend; an
//! author picks one, and the picked text feeds the context of later units.
//!
//! # Architecture
//!
//! ```text
//! ProjectBible ─┐
//! EntityIndex ──┼─→ ContextAssembler ─→ GenerationOrchestrator ─→ Backend
//! VectorIndex ──┘          ↑                      │
//!       ↑                  │                      ↓
//!    Indexer ←── selected candidate ←──── ProjectStore (SQLite)
//! ```
//!
//! # Modules
//!
//! - `model`: Units, candidates, chunks and bible records
//! - `store`: Persistence trait with SQLite and in-memory backends
//! - `search`: Chunking, embedding, vector index and the indexer
//! - `context`: Tiered context assembly and entity snapshots
//! - `generation`: Backend contract, concurrency gate and orchestrator
//! - `lifecycle`: Project phases and the operations each phase permits
//! - `invalidation`: Cascading cleanup of selection-derived data
//! - `coordination`: Per-unit locks, project guards and cancellation
//! - `service`: `StoryEngine`, the facade used by the CLI
//! - `config`, `logging`, `retry`, `circuit_breaker`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod generation;
pub mod invalidation;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod retry;
pub mod search;
pub mod service;
pub mod store;

pub use error::{Error, Result, StorageError};
pub use service::StoryEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
