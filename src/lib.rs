//! AIRefinery Library
//!
//! On-device text refinement: a single loaded GGUF model served by one worker
//! thread that runs queued generation requests in order and streams their
//! tokens back to the caller.

pub mod inference;
pub mod prompt;
pub mod service;
pub mod storage;
pub mod system;
pub mod types;

pub use inference::{
    EngineError, FinishReason, GenerationEvent, GenerationOutcome, GenerationParams,
    GenerationReport, GenerationStream, InferenceBackend, RequestId, TokenControl,
};
pub use prompt::{ChatTemplate, EnhancementMode};
pub use service::{GenerationService, ServiceConfig, ServiceHandle};
