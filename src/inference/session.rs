//! Inference session
//!
//! Binds one request's parameters to a freshly allocated decode context and
//! sampler. A session is never reused: the engine opens one per request and
//! it is closed on every exit path, explicitly or through `Drop`.

use crate::inference::backend::{InferenceBackend, TokenId};
use crate::inference::engine::EngineError;
use crate::inference::model::ModelHandle;
use crate::inference::params::{GenerationParams, ThreadPolicy};

/// Decode context plus sampler for a single request
pub struct InferenceSession<'m, B: InferenceBackend + 'm> {
    backend: &'m B,
    // Freed before the context it samples from
    sampler: Option<B::Sampler>,
    context: Option<B::Context<'m>>,
    n_threads: u32,
    n_ctx: u32,
}

impl<'m, B: InferenceBackend + 'm> InferenceSession<'m, B> {
    /// Opens a session sized to `params.max_tokens` positions.
    ///
    /// If the sampler cannot be built, the already allocated context is
    /// released before the error is returned.
    pub fn open(
        model: &'m ModelHandle<B>,
        params: &GenerationParams,
        policy: &ThreadPolicy,
        hardware_threads: usize,
    ) -> Result<Self, EngineError> {
        if params.max_tokens == 0 {
            return Err(EngineError::Session(
                "max_tokens must be positive".to_string(),
            ));
        }

        let backend = model.backend()?;
        let n_threads = policy.effective_threads(params.n_threads, hardware_threads);
        let n_ctx = params.max_tokens;
        let strategy = params.sampling_strategy();

        tracing::debug!(
            "Opening session: {} threads, {} ctx, greedy={}",
            n_threads,
            n_ctx,
            strategy.is_greedy()
        );

        let context = backend.open_context(n_threads, n_ctx)?;
        let sampler = backend.build_sampler(&strategy)?;

        Ok(Self {
            backend,
            sampler: Some(sampler),
            context: Some(context),
            n_threads,
            n_ctx,
        })
    }

    /// Feeds `batch` through one decode step.
    pub fn decode(&mut self, batch: &[TokenId], n_past: usize) -> Result<(), EngineError> {
        let backend = self.backend;
        let context = self.context.as_mut().ok_or_else(closed)?;
        backend.decode_step(context, batch, n_past)
    }

    /// Samples the next token from the last decode step's output.
    pub fn sample(&mut self) -> Result<TokenId, EngineError> {
        let backend = self.backend;
        let (Some(sampler), Some(context)) = (self.sampler.as_mut(), self.context.as_mut()) else {
            return Err(closed());
        };
        Ok(backend.sample_next(sampler, context))
    }

    pub fn n_threads(&self) -> u32 {
        self.n_threads
    }

    pub fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    pub fn is_open(&self) -> bool {
        self.context.is_some()
    }

    /// Frees the sampler, then the context. Idempotent.
    pub fn close(&mut self) {
        let had_resources = self.sampler.is_some() || self.context.is_some();
        drop(self.sampler.take());
        drop(self.context.take());
        if had_resources {
            tracing::debug!("Session closed");
        }
    }
}

impl<'m, B: InferenceBackend + 'm> Drop for InferenceSession<'m, B> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed() -> EngineError {
    EngineError::Session("session is closed".to_string())
}
