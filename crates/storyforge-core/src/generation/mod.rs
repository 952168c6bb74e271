//! Candidate generation: backend contract, concurrency gate, evaluation and
//! the per-unit orchestrator.

pub mod backend;
pub mod evaluator;
pub mod gate;
#[cfg(feature = "http-backend")]
pub mod http_backend;
pub mod metadata;
pub mod orchestrator;
pub mod prompt;

pub use backend::{BackendErrorKind, BackendResult, GenerationBackend, GenerationRequest};
pub use evaluator::{Evaluator, HeuristicEvaluator};
pub use gate::{ConcurrencyGate, GatePermit};
#[cfg(feature = "http-backend")]
pub use http_backend::HttpBackend;
pub use orchestrator::{
    GenerateReport, GenerationOrchestrator, SelectReport, SlotOutcome, SlotReport,
};
pub use prompt::{RenderedPrompt, render_prompt};
