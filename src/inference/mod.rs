//! LLM inference core
//!
//! Model loading, per-request sessions, the decode loop and the single-worker
//! job queue. The llama-cpp backend is compiled in with the `llama` feature;
//! everything else is backend-agnostic.

pub mod backend;
pub mod cancel;
pub mod engine;
pub mod model;
pub mod params;
pub mod request;
pub mod session;
pub mod streaming;
pub mod worker;

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backend::{InferenceBackend, SamplingStrategy, TokenId};
pub use cancel::CancellationFlag;
pub use engine::{
    EngineError, FinishReason, GenerationEngine, GenerationOutcome, GenerationReport,
    GenerationStats,
};
pub use model::{
    is_gguf_file, validate_gguf, GgufMetadata, LoadedModelInfo, ModelError, ModelHandle,
    ModelMetadata, GGUF_MAGIC,
};
pub use params::{GenerationParams, ThreadPolicy};
pub use request::{GenerationRequest, RequestId, TokenControl};
pub use session::InferenceSession;
pub use streaming::{GenerationEvent, GenerationStream, Utf8Buffer};
pub use worker::JobQueue;

#[cfg(feature = "llama")]
pub use llama::{LlamaCppBackend, LlamaOptions};
