//! Generation engine
//!
//! Runs the tokenize → decode/sample/detokenize → stop loop for one request.
//!
//! # Loop
//!
//! The first decode step consumes the whole prompt (prefill); every later step
//! consumes exactly the one token sampled before it. Cancellation is checked
//! between steps only, so a decode call that has started always completes.
//! The loop ends on an end-of-sequence token, when the next step would not fit
//! in `max_tokens`, on cancellation, or when the token callback asks to stop.
//! Only an end-of-sequence finish flushes a trailing partial character.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::inference::backend::{InferenceBackend, TokenId};
use crate::inference::cancel::CancellationFlag;
use crate::inference::model::{ModelError, ModelHandle};
use crate::inference::params::{GenerationParams, ThreadPolicy};
use crate::inference::request::{RequestId, TokenControl};
use crate::inference::session::InferenceSession;
use crate::inference::streaming::Utf8Buffer;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("No model loaded")]
    NotInitialized,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Failed to open session: {0}")]
    Session(String),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Request abandoned before completion")]
    Abandoned,

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Why a successful generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced an end-of-sequence token
    EndOfSequence,
    /// No room left in `max_tokens`
    TokenBudget,
    /// The shared cancellation flag was raised
    Cancelled,
    /// The token callback returned [`TokenControl::Stop`]
    StoppedByCaller,
}

/// Wall-clock timings of the decode steps, for throughput diagnostics only
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    /// Duration of the prefill step
    pub time_to_first_token: Option<Duration>,
    /// Prefill plus every following decode step
    pub time_to_last_token: Duration,
    /// Single-token decode steps after prefill
    pub decode_iterations: u32,
}

impl GenerationStats {
    fn record_step(&mut self, elapsed: Duration) {
        if self.time_to_first_token.is_none() {
            self.time_to_first_token = Some(elapsed);
            self.time_to_last_token = elapsed;
        } else {
            self.time_to_last_token += elapsed;
            self.decode_iterations += 1;
        }
    }

    /// Average duration of a single-token decode step
    pub fn decode_latency(&self) -> Duration {
        let ttft = self.time_to_first_token.unwrap_or_default();
        let decode_total = self.time_to_last_token.saturating_sub(ttft);
        decode_total / self.decode_iterations.max(1)
    }

    pub fn prefill_tokens_per_second(&self, prompt_tokens: usize) -> f64 {
        match self.time_to_first_token {
            Some(ttft) if !ttft.is_zero() => prompt_tokens as f64 / ttft.as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn decode_tokens_per_second(&self) -> f64 {
        let latency = self.decode_latency();
        if self.decode_iterations == 0 || latency.is_zero() {
            0.0
        } else {
            1.0 / latency.as_secs_f64()
        }
    }
}

/// Summary of a finished request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub request_id: RequestId,
    pub finish_reason: FinishReason,
    pub prompt_tokens: usize,
    /// Sampled tokens, end-of-sequence excluded
    pub generated_tokens: usize,
    pub stats: GenerationStats,
}

/// Delivered to the completion callback exactly once per request
pub type GenerationOutcome = Result<GenerationReport, EngineError>;

/// Executes requests against a loaded model. Lives on the worker thread.
pub struct GenerationEngine<'a, B: InferenceBackend> {
    model: &'a ModelHandle<B>,
    threads: ThreadPolicy,
    hardware_threads: usize,
    cancel: CancellationFlag,
}

impl<'a, B: InferenceBackend> GenerationEngine<'a, B> {
    pub fn new(
        model: &'a ModelHandle<B>,
        threads: ThreadPolicy,
        hardware_threads: usize,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            model,
            threads,
            hardware_threads,
            cancel,
        }
    }

    /// Runs one request to completion.
    ///
    /// The session is closed before this returns, whatever the outcome.
    pub fn generate(
        &self,
        request_id: RequestId,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> TokenControl,
    ) -> GenerationOutcome {
        let mut session =
            InferenceSession::open(self.model, params, &self.threads, self.hardware_threads)
                .map_err(|e| {
                    tracing::error!("Failed to open session: {}", e);
                    e
                })?;

        let result = self.run_loop(&mut session, request_id, prompt, params, on_token);
        session.close();

        match &result {
            Ok(report) => log_throughput(report),
            Err(e) => tracing::warn!("Generation failed: {}", e),
        }
        result
    }

    fn run_loop(
        &self,
        session: &mut InferenceSession<'_, B>,
        request_id: RequestId,
        prompt: &str,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str) -> TokenControl,
    ) -> GenerationOutcome {
        let backend = self.model.backend()?;
        let max_tokens = params.max_tokens as usize;

        let prompt_tokens = backend.tokenize(prompt, max_tokens)?;
        if prompt_tokens.is_empty() {
            return Err(EngineError::Tokenization(
                "prompt produced no tokens".to_string(),
            ));
        }
        if prompt_tokens.len() >= max_tokens {
            return Err(EngineError::Tokenization(format!(
                "prompt uses {} tokens, leaving no room within max_tokens {}",
                prompt_tokens.len(),
                max_tokens
            )));
        }
        tracing::debug!("Tokenized prompt into {} tokens", prompt_tokens.len());

        let mut stats = GenerationStats::default();
        let mut text = Utf8Buffer::new();
        let mut generated = 0usize;
        let mut n_past = 0usize;
        let mut batch: Vec<TokenId> = prompt_tokens.clone();
        let mut finish = FinishReason::TokenBudget;

        loop {
            if self.cancel.is_stop_requested() {
                tracing::debug!("Generation stopped by cancellation");
                finish = FinishReason::Cancelled;
                break;
            }
            if n_past + batch.len() >= max_tokens {
                break;
            }

            let started = Instant::now();
            session.decode(&batch, n_past)?;
            stats.record_step(started.elapsed());
            n_past += batch.len();

            let token = session.sample()?;
            if backend.is_end_of_sequence(token) {
                tracing::debug!("End of generation token encountered");
                finish = FinishReason::EndOfSequence;
                break;
            }
            generated += 1;

            let bytes = backend.detokenize_one(token)?;
            if let Some(piece) = text.push(&bytes) {
                if deliver(on_token, &piece)? == TokenControl::Stop {
                    tracing::debug!("Token callback requested stop");
                    finish = FinishReason::StoppedByCaller;
                    break;
                }
            }

            batch.clear();
            batch.push(token);
        }

        // Only a natural end delivers the trailing partial character; every
        // other exit has already stopped emitting
        if finish == FinishReason::EndOfSequence {
            if let Some(rest) = text.flush() {
                deliver(on_token, &rest)?;
            }
        }

        Ok(GenerationReport {
            request_id,
            finish_reason: finish,
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: generated,
            stats,
        })
    }
}

/// Runs the token callback, turning a panic into a failure of this request
fn deliver(
    on_token: &mut dyn FnMut(&str) -> TokenControl,
    piece: &str,
) -> Result<TokenControl, EngineError> {
    panic::catch_unwind(AssertUnwindSafe(|| on_token(piece))).map_err(|_| {
        tracing::error!("Token callback panicked");
        EngineError::Callback("token callback panicked".to_string())
    })
}

fn log_throughput(report: &GenerationReport) {
    let stats = &report.stats;
    tracing::info!(
        "Time to first token: {:.3}s, time to last token: {:.3}s, decode latency: {:.3}s",
        stats.time_to_first_token.unwrap_or_default().as_secs_f64(),
        stats.time_to_last_token.as_secs_f64(),
        stats.decode_latency().as_secs_f64()
    );
    tracing::info!(
        "Generated {} tokens ({:?}); prefill {:.1} tokens/s, decode {:.1} tokens/s",
        report.generated_tokens,
        report.finish_reason,
        stats.prefill_tokens_per_second(report.prompt_tokens),
        stats.decode_tokens_per_second()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{load_scripted, ScriptOptions, EOS};

    fn run(
        options: ScriptOptions,
        prompt: &str,
        params: GenerationParams,
    ) -> (GenerationOutcome, Vec<String>, std::sync::Arc<crate::inference::testing::Probe>) {
        let (model, probe, _file) = load_scripted(options);
        let engine = GenerationEngine::new(&model, ThreadPolicy::default(), 4, CancellationFlag::new());
        let mut tokens = Vec::new();
        let outcome = engine.generate(uuid::Uuid::new_v4(), prompt, &params, &mut |piece: &str| {
            tokens.push(piece.to_string());
            TokenControl::Continue
        });
        (outcome, tokens, probe)
    }

    fn params(max_tokens: u32) -> GenerationParams {
        GenerationParams {
            max_tokens,
            ..GenerationParams::default()
        }
    }

    #[test]
    fn test_stops_on_end_of_sequence() {
        let (outcome, tokens, probe) = run(ScriptOptions::replying("Hi!"), "Hello", params(50));

        let report = outcome.unwrap();
        assert_eq!(report.finish_reason, FinishReason::EndOfSequence);
        assert_eq!(report.prompt_tokens, 5);
        assert_eq!(report.generated_tokens, 3);
        assert_eq!(tokens.concat(), "Hi!");
        assert!(probe.all_released());
    }

    #[test]
    fn test_budget_bounds_emitted_tokens() {
        let (outcome, tokens, probe) = run(ScriptOptions::default(), "Hello", params(50));

        let report = outcome.unwrap();
        assert_eq!(report.finish_reason, FinishReason::TokenBudget);
        assert_eq!(report.generated_tokens, 45);
        assert_eq!(tokens.len(), 45);
        assert!(tokens.len() <= 49);
        // every position decoded stays inside the context
        let (last_len, last_past) = *probe.batches().last().unwrap();
        assert!(last_past + last_len < 50);
    }

    #[test]
    fn test_prefill_then_single_token_batches() {
        let (outcome, _, probe) = run(ScriptOptions::replying("ab"), "abc", params(16));
        outcome.unwrap();

        assert_eq!(probe.batches(), vec![(3, 0), (1, 3), (1, 4)]);
    }

    #[test]
    fn test_stats_track_decode_iterations() {
        let (outcome, _, _) = run(ScriptOptions::replying("abcd"), "p", params(16));
        let report = outcome.unwrap();

        assert!(report.stats.time_to_first_token.is_some());
        assert_eq!(report.stats.decode_iterations, 4);
        assert!(report.stats.time_to_last_token >= report.stats.time_to_first_token.unwrap());
    }

    #[test]
    fn test_empty_prompt_fails_without_decoding() {
        let (outcome, tokens, probe) = run(ScriptOptions::default(), "", params(50));

        assert!(matches!(outcome, Err(EngineError::Tokenization(_))));
        assert!(tokens.is_empty());
        assert_eq!(probe.decode_calls(), 0);
        assert!(probe.all_released());
    }

    #[test]
    fn test_prompt_filling_budget_fails_without_decoding() {
        let (outcome, tokens, probe) = run(ScriptOptions::default(), "0123456789", params(10));

        assert!(matches!(outcome, Err(EngineError::Tokenization(_))));
        assert!(tokens.is_empty());
        assert_eq!(probe.decode_calls(), 0);
        assert!(probe.all_released());
    }

    #[test]
    fn test_decode_failure_is_fatal_and_releases_session() {
        let options = ScriptOptions {
            fail_decode_at: Some(2),
            ..ScriptOptions::default()
        };
        let (outcome, tokens, probe) = run(options, "Hello", params(50));

        assert!(matches!(outcome, Err(EngineError::Decode(_))));
        assert_eq!(tokens.len(), 2);
        assert_eq!(probe.decode_calls(), 3);
        assert!(probe.all_released());
    }

    #[test]
    fn test_session_failure_emits_nothing() {
        let options = ScriptOptions {
            fail_open_context: true,
            ..ScriptOptions::default()
        };
        let (outcome, tokens, probe) = run(options, "Hello", params(50));

        assert!(matches!(outcome, Err(EngineError::Session(_))));
        assert!(tokens.is_empty());
        assert_eq!(probe.decode_calls(), 0);
    }

    #[test]
    fn test_callback_stop_is_not_an_error() {
        let (model, probe, _file) = load_scripted(ScriptOptions::default());
        let engine = GenerationEngine::new(&model, ThreadPolicy::default(), 4, CancellationFlag::new());
        let mut seen = 0;

        let outcome = engine.generate(uuid::Uuid::new_v4(), "Hello", &params(50), &mut |_: &str| {
            seen += 1;
            if seen == 3 {
                TokenControl::Stop
            } else {
                TokenControl::Continue
            }
        });

        let report = outcome.unwrap();
        assert_eq!(report.finish_reason, FinishReason::StoppedByCaller);
        assert_eq!(seen, 3);
        assert!(probe.all_released());
    }

    #[test]
    fn test_cancellation_observed_at_loop_boundary() {
        let (model, probe, _file) = load_scripted(ScriptOptions::default());
        let cancel = CancellationFlag::new();
        let engine = GenerationEngine::new(&model, ThreadPolicy::default(), 4, cancel.clone());
        let mut seen = 0;

        let outcome = engine.generate(uuid::Uuid::new_v4(), "Hello", &params(50), &mut |_: &str| {
            seen += 1;
            if seen == 2 {
                cancel.request_stop();
            }
            TokenControl::Continue
        });

        let report = outcome.unwrap();
        assert_eq!(report.finish_reason, FinishReason::Cancelled);
        assert_eq!(seen, 2);
        assert_eq!(probe.decode_calls(), 2);
        assert!(probe.all_released());
    }

    #[test]
    fn test_multibyte_character_split_across_tokens() {
        let options = ScriptOptions {
            output: "é!".bytes().map(TokenId::from).chain([EOS]).collect(),
            ..ScriptOptions::default()
        };
        let (outcome, tokens, _) = run(options, "Hello", params(50));

        let report = outcome.unwrap();
        assert_eq!(report.generated_tokens, 3);
        assert_eq!(tokens, vec!["é".to_string(), "!".to_string()]);
    }

    #[test]
    fn test_partial_character_flushed_at_end_of_sequence() {
        let options = ScriptOptions {
            output: vec![TokenId::from(b'a'), 0xE2, EOS],
            ..ScriptOptions::default()
        };
        let (outcome, tokens, _) = run(options, "Hello", params(50));

        assert_eq!(outcome.unwrap().finish_reason, FinishReason::EndOfSequence);
        assert_eq!(tokens, vec!["a".to_string(), "\u{FFFD}".to_string()]);
    }

    #[test]
    fn test_partial_character_dropped_when_budget_runs_out() {
        let options = ScriptOptions {
            output: vec![TokenId::from(b'a'), 0xE2],
            ..ScriptOptions::default()
        };
        // 5 prompt tokens leave room for exactly two samples in 7 positions
        let (outcome, tokens, _) = run(options, "Hello", params(7));

        let report = outcome.unwrap();
        assert_eq!(report.finish_reason, FinishReason::TokenBudget);
        assert_eq!(report.generated_tokens, 2);
        assert_eq!(tokens, vec!["a".to_string()]);
    }

    #[test]
    fn test_panicking_callback_fails_request_and_releases_session() {
        let (model, counters, _file) = load_scripted(ScriptOptions::default());
        let engine = GenerationEngine::new(&model, ThreadPolicy::default(), 4, CancellationFlag::new());

        let outcome = engine.generate(uuid::Uuid::new_v4(), "Hello", &params(50), &mut |_: &str| -> TokenControl {
            panic!("callback failure")
        });

        assert!(matches!(outcome, Err(EngineError::Callback(_))));
        assert!(counters.all_released());
    }

    #[test]
    fn test_stochastic_strategy_installed_when_not_greedy() {
        let request = GenerationParams {
            use_greedy: false,
            seed: Some(9),
            ..params(50)
        };
        let (outcome, _, probe) = run(ScriptOptions::replying("ok"), "Hello", request);
        outcome.unwrap();

        assert!(!probe.strategies()[0].is_greedy());
    }

    #[test]
    fn test_stats_throughput_math() {
        let stats = GenerationStats {
            time_to_first_token: Some(Duration::from_millis(500)),
            time_to_last_token: Duration::from_millis(1500),
            decode_iterations: 10,
        };
        assert_eq!(stats.decode_latency(), Duration::from_millis(100));
        assert!((stats.prefill_tokens_per_second(50) - 100.0).abs() < 1e-6);
        assert!((stats.decode_tokens_per_second() - 10.0).abs() < 1e-6);

        let empty = GenerationStats::default();
        assert_eq!(empty.prefill_tokens_per_second(10), 0.0);
        assert_eq!(empty.decode_tokens_per_second(), 0.0);
    }
}
