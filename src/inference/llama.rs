//! llama.cpp backend
//!
//! Implements [`InferenceBackend`] on top of `llama-cpp-2`. The backend handle
//! and the model live together and are freed together, model first.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{InferenceBackend, SamplingStrategy, TokenId};
use crate::inference::engine::EngineError;
use crate::inference::model::{validate_gguf, ModelMetadata};

/// Load-time options for llama.cpp
#[derive(Debug, Clone, Default)]
pub struct LlamaOptions {
    /// Layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// A GGUF model loaded through llama.cpp
pub struct LlamaCppBackend {
    // Dropped before the backend it was loaded with
    model: LlamaModel,
    backend: LlamaBackend,
}

impl InferenceBackend for LlamaCppBackend {
    type Options = LlamaOptions;
    type Context<'m> = LlamaContext<'m> where Self: 'm;
    type Sampler = LlamaSampler;

    fn load(path: &Path, options: &LlamaOptions) -> Result<Self, EngineError> {
        let gguf = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors, {} metadata entries",
            gguf.version,
            gguf.tensor_count,
            gguf.metadata_kv_count
        );

        let backend = LlamaBackend::init().map_err(|e| EngineError::Load(format!("backend init: {e}")))?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| EngineError::Load(e.to_string()))?;

        Ok(Self { model, backend })
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            vocab_size: usize::try_from(self.model.n_vocab()).unwrap_or(0),
            context_length: self.model.n_ctx_train(),
            param_count: self.model.n_params() as u64,
            size_bytes: self.model.size() as u64,
        }
    }

    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().take(capacity).map(|t| t.0).collect())
    }

    fn detokenize_one(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| EngineError::Tokenization(format!("token {token}: {e}")))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn open_context(
        &self,
        n_threads: u32,
        n_ctx: u32,
    ) -> Result<Self::Context<'_>, EngineError> {
        let threads = i32::try_from(n_threads).unwrap_or(i32::MAX);
        // The whole prompt goes through one decode call
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_ctx)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        self.model
            .new_context(&self.backend, params)
            .map_err(|e| EngineError::Session(format!("context: {e}")))
    }

    fn build_sampler(&self, strategy: &SamplingStrategy) -> Result<LlamaSampler, EngineError> {
        let sampler = match strategy {
            SamplingStrategy::Greedy => LlamaSampler::greedy(),
            SamplingStrategy::Stochastic {
                top_k,
                top_p,
                temperature,
                seed,
            } => LlamaSampler::chain_simple([
                LlamaSampler::top_k(*top_k),
                LlamaSampler::top_p(*top_p, 1),
                LlamaSampler::temp(*temperature),
                LlamaSampler::dist(*seed),
            ]),
        };
        Ok(sampler)
    }

    fn decode_step(
        &self,
        context: &mut Self::Context<'_>,
        batch: &[TokenId],
        n_past: usize,
    ) -> Result<(), EngineError> {
        let mut llama_batch = LlamaBatch::new(batch.len().max(1), 1);
        let last = batch.len().saturating_sub(1);

        for (i, &token) in batch.iter().enumerate() {
            let pos = i32::try_from(n_past + i)
                .map_err(|_| EngineError::Decode(format!("position {} out of range", n_past + i)))?;
            // Logits only for the last token, which is the one sampled from
            llama_batch
                .add(LlamaToken(token), pos, &[0], i == last)
                .map_err(|e| EngineError::Decode(format!("batch: {e}")))?;
        }

        context
            .decode(&mut llama_batch)
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn sample_next(&self, sampler: &mut LlamaSampler, context: &mut Self::Context<'_>) -> TokenId {
        sampler.sample(context, -1).0
    }
}
