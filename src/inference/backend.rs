//! Inference backend abstraction
//!
//! The generation core never talks to llama.cpp directly. Everything it needs
//! from an inference engine (loading, tokenization, one decode step, sampling)
//! goes through [`InferenceBackend`], so the worker, session and decode loop can
//! be exercised against any implementation.
//!
//! Implementations do not have to be `Send`: the service loads the model on its
//! worker thread and the model never leaves it.

use std::path::Path;

use crate::inference::engine::EngineError;
use crate::inference::model::ModelMetadata;

/// Token identifier in the model vocabulary
pub type TokenId = i32;

/// Token selection strategy installed in a session's sampler
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingStrategy {
    /// Always pick the highest-probability token
    Greedy,
    /// top-k, then top-p, then temperature, then a seeded draw
    Stochastic {
        top_k: i32,
        top_p: f32,
        temperature: f32,
        seed: u32,
    },
}

impl SamplingStrategy {
    /// Returns true for the deterministic strategy
    pub fn is_greedy(&self) -> bool {
        matches!(self, SamplingStrategy::Greedy)
    }
}

/// The operations the generation core consumes from an inference engine.
pub trait InferenceBackend: Sized {
    /// Load-time options, sent to the worker thread that performs the load
    type Options: Clone + Send + 'static;

    /// Per-request decode state; borrows the loaded model
    type Context<'m>
    where
        Self: 'm;

    /// Stateful token selection chain
    type Sampler;

    /// Loads model weights and vocabulary from `path`.
    fn load(path: &Path, options: &Self::Options) -> Result<Self, EngineError>;

    /// Static facts about the loaded model
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata::default()
    }

    /// Tokenizes `text` into at most `capacity` tokens. The result may be empty.
    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of one token's text. May end in the middle of a UTF-8 sequence.
    fn detokenize_one(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Allocates a decode context holding `n_ctx` positions.
    fn open_context(&self, n_threads: u32, n_ctx: u32)
        -> Result<Self::Context<'_>, EngineError>;

    fn build_sampler(&self, strategy: &SamplingStrategy) -> Result<Self::Sampler, EngineError>;

    /// Runs one forward pass over `batch`, whose first token sits at position `n_past`.
    fn decode_step(
        &self,
        context: &mut Self::Context<'_>,
        batch: &[TokenId],
        n_past: usize,
    ) -> Result<(), EngineError>;

    /// Picks the next token from the distribution produced by the last decode step.
    fn sample_next(&self, sampler: &mut Self::Sampler, context: &mut Self::Context<'_>) -> TokenId;
}
