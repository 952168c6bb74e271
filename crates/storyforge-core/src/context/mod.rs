//! Context assembly: token estimation, entity snapshots and the layered
//! assembler.

pub mod assembler;
pub mod budget;
pub mod entity_index;

pub use assembler::{
    ContextAssembler, ContextCandidates, ContextItem, ItemKind, LayeredContext, Tier,
};
pub use budget::TokenEstimator;
pub use entity_index::EntityIndex;
