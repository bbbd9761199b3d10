//! Job queue and worker thread
//!
//! Callers push requests into a FIFO queue; exactly one worker thread pops
//! them one at a time and runs them to completion. The worker also loads and
//! owns the model, since backend types need not be `Send`.
//!
//! # Termination
//!
//! Termination is a separate signal from cancellation. The worker exits the
//! next time it looks at the queue; requests still queued at that point are
//! dropped without their completion callback.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::inference::backend::InferenceBackend;
use crate::inference::cancel::CancellationFlag;
use crate::inference::engine::{EngineError, GenerationEngine, GenerationOutcome};
use crate::inference::model::{LoadedModelInfo, ModelHandle};
use crate::inference::params::ThreadPolicy;
use crate::inference::request::GenerationRequest;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<GenerationRequest>,
    terminating: bool,
}

/// Thread-safe FIFO of pending requests with a wake signal for the worker
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `request` and wakes the worker. Never blocks on a running job.
    pub fn push(&self, request: GenerationRequest) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.terminating {
            return Err(EngineError::NotInitialized);
        }
        state.jobs.push_back(request);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a request is available or termination is raised.
    ///
    /// Returns `None` once terminating, even if requests are still queued.
    pub fn wait_next(&self) -> Option<GenerationRequest> {
        let mut state = self.state.lock();
        loop {
            if state.terminating {
                return None;
            }
            if let Some(request) = state.jobs.pop_front() {
                return Some(request);
            }
            self.available.wait(&mut state);
        }
    }

    /// Raises termination and drops queued requests. Returns how many were dropped.
    pub fn terminate(&self) -> usize {
        let abandoned = {
            let mut state = self.state.lock();
            state.terminating = true;
            std::mem::take(&mut state.jobs)
        };
        self.available.notify_all();
        // Dropped outside the lock: callbacks may own channels with their own drop logic
        let count = abandoned.len();
        drop(abandoned);
        count
    }

    pub fn is_terminating(&self) -> bool {
        self.state.lock().terminating
    }

    /// Requests waiting to start
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the worker thread needs, moved onto it at spawn time
pub(crate) struct WorkerContext<B: InferenceBackend> {
    pub model_path: PathBuf,
    pub options: B::Options,
    pub queue: Arc<JobQueue>,
    pub cancel: CancellationFlag,
    pub threads: ThreadPolicy,
    pub hardware_threads: usize,
    pub loaded_tx: Sender<Result<LoadedModelInfo, EngineError>>,
}

/// Worker thread main loop
///
/// Loads the model, reports the result, then serves the queue until terminated.
pub(crate) fn worker_thread_main<B: InferenceBackend>(ctx: WorkerContext<B>) {
    let WorkerContext {
        model_path,
        options,
        queue,
        cancel,
        threads,
        hardware_threads,
        loaded_tx,
    } = ctx;

    let mut model = match ModelHandle::<B>::load(&model_path, &options) {
        Ok(model) => {
            let _ = loaded_tx.send(Ok(model.info().clone()));
            model
        }
        Err(e) => {
            tracing::error!("Failed to load model {}: {}", model_path.display(), e);
            let _ = loaded_tx.send(Err(e));
            return;
        }
    };
    drop(loaded_tx);

    let engine = GenerationEngine::new(&model, threads, hardware_threads, cancel.clone());
    let mut served = 0u64;

    while let Some(request) = queue.wait_next() {
        cancel.reset();
        // A shutdown that raced the pop must still stop this job
        if queue.is_terminating() {
            cancel.request_stop();
        }
        run_job(&engine, request);
        served += 1;
    }

    drop(engine);
    model.release();
    tracing::info!("Worker thread shutting down after {} request(s)", served);
}

/// Runs one request and fires its completion callback exactly once.
///
/// A panic anywhere in the request fails only that request.
fn run_job<B: InferenceBackend>(engine: &GenerationEngine<'_, B>, request: GenerationRequest) {
    let GenerationRequest {
        id,
        prompt,
        params,
        mut on_token,
        on_done,
    } = request;

    let span = tracing::info_span!("generation", request_id = %id);
    let _enter = span.enter();
    tracing::debug!("Starting request ({} prompt bytes)", prompt.len());

    let outcome: GenerationOutcome = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.generate(id, &prompt, &params, &mut *on_token)
    }))
    .unwrap_or_else(|_| {
        tracing::error!("Generation panicked");
        Err(EngineError::Worker("generation panicked".to_string()))
    });

    if panic::catch_unwind(AssertUnwindSafe(move || on_done(outcome))).is_err() {
        tracing::error!("Completion callback panicked");
    }
}
