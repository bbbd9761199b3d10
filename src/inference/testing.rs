//! Scripted backend for tests
//!
//! Tokenizes byte-by-byte (token id = byte value, 0 is end of sequence) and
//! samples from a fixed script. A shared [`Probe`] records every resource the
//! core allocates and frees so tests can check lifecycle guarantees.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::inference::backend::{InferenceBackend, SamplingStrategy, TokenId};
use crate::inference::engine::EngineError;
use crate::inference::model::{ModelHandle, ModelMetadata};

pub const EOS: TokenId = 0;

/// Bookkeeping shared between a test and the backend it drives
#[derive(Debug, Default)]
pub struct Probe {
    contexts_opened: AtomicUsize,
    contexts_closed: AtomicUsize,
    live_contexts: AtomicUsize,
    max_live_contexts: AtomicUsize,
    samplers_built: AtomicUsize,
    samplers_dropped: AtomicUsize,
    decode_calls: AtomicUsize,
    models_dropped: AtomicUsize,
    context_requests: Mutex<Vec<(u32, u32)>>,
    strategies: Mutex<Vec<SamplingStrategy>>,
    release_order: Mutex<Vec<&'static str>>,
    batches: Mutex<Vec<(usize, usize)>>,
    loaded_on: Mutex<Option<String>>,
}

impl Probe {
    pub fn contexts_opened(&self) -> usize {
        self.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn max_live_contexts(&self) -> usize {
        self.max_live_contexts.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn models_dropped(&self) -> usize {
        self.models_dropped.load(Ordering::SeqCst)
    }

    /// True when every context and sampler handed out has been freed
    pub fn all_released(&self) -> bool {
        self.contexts_opened() == self.contexts_closed()
            && self.samplers_built.load(Ordering::SeqCst)
                == self.samplers_dropped.load(Ordering::SeqCst)
    }

    /// `(n_threads, n_ctx)` of the most recent context
    pub fn last_context_request(&self) -> Option<(u32, u32)> {
        self.context_requests.lock().last().copied()
    }

    pub fn strategies(&self) -> Vec<SamplingStrategy> {
        self.strategies.lock().clone()
    }

    pub fn release_order(&self) -> Vec<&'static str> {
        self.release_order.lock().clone()
    }

    /// `(batch_len, n_past)` for every decode step
    pub fn batches(&self) -> Vec<(usize, usize)> {
        self.batches.lock().clone()
    }

    /// Name of the thread the model was loaded on
    pub fn loaded_on(&self) -> Option<String> {
        self.loaded_on.lock().clone()
    }
}

/// How the scripted backend behaves
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Tokens returned by successive samples of one session
    pub output: Vec<TokenId>,
    /// Token returned once `output` is exhausted
    pub filler: TokenId,
    pub fail_load: bool,
    pub fail_open_context: bool,
    pub fail_build_sampler: bool,
    /// Zero-based decode step (per session) that reports failure
    pub fail_decode_at: Option<usize>,
    /// Zero-based decode step (per session) that panics inside the backend
    pub panic_decode_at: Option<usize>,
    /// Simulated duration of every decode step
    pub step_delay: Duration,
    pub probe: Arc<Probe>,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            output: Vec::new(),
            filler: TokenId::from(b'x'),
            fail_load: false,
            fail_open_context: false,
            fail_build_sampler: false,
            fail_decode_at: None,
            panic_decode_at: None,
            step_delay: Duration::ZERO,
            probe: Arc::new(Probe::default()),
        }
    }
}

impl ScriptOptions {
    /// Script that samples the bytes of `text`, then end of sequence
    pub fn replying(text: &str) -> Self {
        let mut output: Vec<TokenId> = text.bytes().map(TokenId::from).collect();
        output.push(EOS);
        Self {
            output,
            ..Self::default()
        }
    }
}

pub struct ScriptedBackend {
    options: ScriptOptions,
}

pub struct ScriptedContext {
    probe: Arc<Probe>,
    steps: usize,
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.probe.contexts_closed.fetch_add(1, Ordering::SeqCst);
        self.probe.live_contexts.fetch_sub(1, Ordering::SeqCst);
        self.probe.release_order.lock().push("context");
    }
}

pub struct ScriptedSampler {
    probe: Arc<Probe>,
    output: Vec<TokenId>,
    filler: TokenId,
    cursor: usize,
}

impl Drop for ScriptedSampler {
    fn drop(&mut self) {
        self.probe.samplers_dropped.fetch_add(1, Ordering::SeqCst);
        self.probe.release_order.lock().push("sampler");
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.options.probe.models_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl InferenceBackend for ScriptedBackend {
    type Options = ScriptOptions;
    type Context<'m> = ScriptedContext where Self: 'm;
    type Sampler = ScriptedSampler;

    fn load(_path: &Path, options: &ScriptOptions) -> Result<Self, EngineError> {
        if options.fail_load {
            return Err(EngineError::Load("scripted load failure".to_string()));
        }
        *options.probe.loaded_on.lock() = std::thread::current().name().map(str::to_string);
        Ok(Self {
            options: options.clone(),
        })
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            vocab_size: 256,
            context_length: 4096,
            param_count: 0,
            size_bytes: 0,
        }
    }

    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>, EngineError> {
        Ok(text.bytes().take(capacity).map(TokenId::from).collect())
    }

    fn detokenize_one(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        u8::try_from(token)
            .map(|byte| vec![byte])
            .map_err(|_| EngineError::Tokenization(format!("unknown token {token}")))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn open_context(
        &self,
        n_threads: u32,
        n_ctx: u32,
    ) -> Result<Self::Context<'_>, EngineError> {
        let probe = &self.options.probe;
        probe.context_requests.lock().push((n_threads, n_ctx));
        if self.options.fail_open_context {
            return Err(EngineError::Session("scripted context failure".to_string()));
        }

        probe.contexts_opened.fetch_add(1, Ordering::SeqCst);
        let live = probe.live_contexts.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_live_contexts.fetch_max(live, Ordering::SeqCst);

        Ok(ScriptedContext {
            probe: Arc::clone(probe),
            steps: 0,
        })
    }

    fn build_sampler(&self, strategy: &SamplingStrategy) -> Result<ScriptedSampler, EngineError> {
        let probe = &self.options.probe;
        probe.strategies.lock().push(strategy.clone());
        if self.options.fail_build_sampler {
            return Err(EngineError::Session("scripted sampler failure".to_string()));
        }

        probe.samplers_built.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSampler {
            probe: Arc::clone(probe),
            output: self.options.output.clone(),
            filler: self.options.filler,
            cursor: 0,
        })
    }

    fn decode_step(
        &self,
        context: &mut Self::Context<'_>,
        batch: &[TokenId],
        n_past: usize,
    ) -> Result<(), EngineError> {
        let step = context.steps;
        context.steps += 1;
        context.probe.decode_calls.fetch_add(1, Ordering::SeqCst);
        context.probe.batches.lock().push((batch.len(), n_past));

        if !self.options.step_delay.is_zero() {
            std::thread::sleep(self.options.step_delay);
        }
        if self.options.panic_decode_at == Some(step) {
            panic!("scripted backend panic at step {step}");
        }
        if self.options.fail_decode_at == Some(step) {
            return Err(EngineError::Decode(format!("scripted failure at step {step}")));
        }
        Ok(())
    }

    fn sample_next(
        &self,
        sampler: &mut ScriptedSampler,
        _context: &mut Self::Context<'_>,
    ) -> TokenId {
        let token = sampler
            .output
            .get(sampler.cursor)
            .copied()
            .unwrap_or(sampler.filler);
        sampler.cursor += 1;
        token
    }
}

/// Loads a scripted model from a throwaway file. Keep the file alive while the handle is used.
pub fn load_scripted(
    options: ScriptOptions,
) -> (ModelHandle<ScriptedBackend>, Arc<Probe>, NamedTempFile) {
    let file = model_file();
    let probe = Arc::clone(&options.probe);
    let model = ModelHandle::load(file.path(), &options).unwrap();
    (model, probe, file)
}

/// An empty file standing in for model weights
pub fn model_file() -> NamedTempFile {
    tempfile::Builder::new().suffix(".gguf").tempfile().unwrap()
}
