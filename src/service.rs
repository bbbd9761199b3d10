//! Generation service
//!
//! The explicitly constructed and torn down owner of the model, job queue and
//! worker thread. At most one model is active per service.
//!
//! Caller threads do not need the service itself: [`GenerationService::handle`]
//! returns a cheap, cloneable [`ServiceHandle`] that can submit work and
//! request stops from anywhere.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::inference::backend::InferenceBackend;
use crate::inference::cancel::CancellationFlag;
use crate::inference::engine::{EngineError, GenerationOutcome};
use crate::inference::model::LoadedModelInfo;
use crate::inference::params::{GenerationParams, ThreadPolicy};
use crate::inference::request::{GenerationRequest, RequestId, TokenControl};
use crate::inference::streaming::{GenerationEvent, GenerationStream};
use crate::inference::worker::{worker_thread_main, JobQueue, WorkerContext};

/// Service-wide configuration
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub threads: ThreadPolicy,
    /// Hardware parallelism; probed when `None`
    pub hardware_threads: Option<usize>,
}

struct Running {
    queue: Arc<JobQueue>,
    worker: Option<JoinHandle<()>>,
    model_info: LoadedModelInfo,
}

/// Owns one loaded model and the single worker that serves it
pub struct GenerationService<B: InferenceBackend + 'static> {
    config: ServiceConfig,
    cancel: CancellationFlag,
    running: Option<Running>,
    _backend: PhantomData<fn() -> B>,
}

impl<B: InferenceBackend + 'static> GenerationService<B> {
    /// Creates a service with no model loaded
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            cancel: CancellationFlag::new(),
            running: None,
            _backend: PhantomData,
        }
    }

    /// Loads the model and starts the worker.
    ///
    /// Blocks until the model is loaded. Calling it again while a model is
    /// active is a no-op that returns the active model's info.
    pub fn initialize<P: AsRef<Path>>(
        &mut self,
        model_path: P,
        options: B::Options,
    ) -> Result<LoadedModelInfo, EngineError> {
        if let Some(running) = &self.running {
            tracing::debug!("Service already initialized, keeping active model");
            return Ok(running.model_info.clone());
        }

        let hardware_threads = self
            .config
            .hardware_threads
            .unwrap_or_else(crate::system::hardware_threads);
        let queue = Arc::new(JobQueue::new());
        let (loaded_tx, loaded_rx) = mpsc::channel();

        let ctx = WorkerContext::<B> {
            model_path: model_path.as_ref().to_path_buf(),
            options,
            queue: Arc::clone(&queue),
            cancel: self.cancel.clone(),
            threads: self.config.threads,
            hardware_threads,
            loaded_tx,
        };

        let worker = thread::Builder::new()
            .name("generation-worker".into())
            .spawn(move || worker_thread_main(ctx))
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        let loaded = loaded_rx
            .recv()
            .map_err(|e| EngineError::Worker(e.to_string()))
            .and_then(|result| result);

        match loaded {
            Ok(model_info) => {
                tracing::info!(
                    "Generation worker started with {} hardware threads",
                    hardware_threads
                );
                self.running = Some(Running {
                    queue,
                    worker: Some(worker),
                    model_info: model_info.clone(),
                });
                Ok(model_info)
            }
            Err(e) => {
                let _ = worker.join();
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.running.is_some()
    }

    /// Information about the active model
    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.running.as_ref().map(|r| &r.model_info)
    }

    /// A cloneable handle for caller threads
    pub fn handle(&self) -> Result<ServiceHandle, EngineError> {
        let running = self.running.as_ref().ok_or(EngineError::NotInitialized)?;
        Ok(ServiceHandle {
            queue: Arc::clone(&running.queue),
            cancel: self.cancel.clone(),
        })
    }

    /// Queues a request with caller-supplied callbacks.
    ///
    /// Both callbacks run on the worker thread.
    pub fn submit_generation<T, D>(
        &self,
        prompt: impl Into<String>,
        params: GenerationParams,
        on_token: T,
        on_done: D,
    ) -> Result<RequestId, EngineError>
    where
        T: FnMut(&str) -> TokenControl + Send + 'static,
        D: FnOnce(GenerationOutcome) + Send + 'static,
    {
        self.handle()?
            .submit_generation(prompt, params, on_token, on_done)
    }

    /// Queues a request whose output arrives as a stream of events
    pub fn submit_stream(
        &self,
        prompt: impl Into<String>,
        params: GenerationParams,
    ) -> Result<GenerationStream, EngineError> {
        self.handle()?.submit_stream(prompt, params)
    }

    /// Stops whichever generation is running. No-op when idle.
    pub fn request_stop(&self) {
        self.cancel.request_stop();
    }

    /// Requests still waiting for the worker
    pub fn pending(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.queue.len())
    }

    /// Stops the worker and releases the model. Idempotent.
    ///
    /// The running generation is asked to stop and its completion callback
    /// still fires; queued requests that never started are dropped.
    pub fn shutdown(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        let abandoned = running.queue.terminate();
        if abandoned > 0 {
            tracing::warn!("Abandoning {} queued request(s) at shutdown", abandoned);
        }
        self.cancel.request_stop();

        if let Some(worker) = running.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Generation worker panicked");
            }
        }
        tracing::info!("Generation service shut down");
    }
}

impl<B: InferenceBackend + 'static> Drop for GenerationService<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Caller-side access to a running service
#[derive(Clone)]
pub struct ServiceHandle {
    queue: Arc<JobQueue>,
    cancel: CancellationFlag,
}

impl ServiceHandle {
    /// Queues a request. Fails only if the service has shut down.
    pub fn submit_generation<T, D>(
        &self,
        prompt: impl Into<String>,
        params: GenerationParams,
        on_token: T,
        on_done: D,
    ) -> Result<RequestId, EngineError>
    where
        T: FnMut(&str) -> TokenControl + Send + 'static,
        D: FnOnce(GenerationOutcome) + Send + 'static,
    {
        let request = GenerationRequest::new(prompt, params, on_token, on_done);
        let id = request.id;
        self.queue.push(request)?;
        tracing::debug!("Queued request {}", id);
        Ok(id)
    }

    /// Queues a request and returns the stream its events arrive on.
    ///
    /// Dropping the stream stops the request at its next token.
    pub fn submit_stream(
        &self,
        prompt: impl Into<String>,
        params: GenerationParams,
    ) -> Result<GenerationStream, EngineError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let done_tx = tx.clone();

        let on_token = move |piece: &str| {
            if tx.send(GenerationEvent::Token(piece.to_string())).is_err() {
                tracing::debug!("Receiver dropped, stopping generation");
                return TokenControl::Stop;
            }
            TokenControl::Continue
        };
        let on_done = move |outcome: GenerationOutcome| {
            let event = match outcome {
                Ok(report) => GenerationEvent::Done(report),
                Err(e) => GenerationEvent::Failed(e),
            };
            let _ = done_tx.send(event);
        };

        let id = self.submit_generation(prompt, params, on_token, on_done)?;
        Ok(GenerationStream::new(id, rx))
    }

    /// Stops whichever generation is running. No-op when idle.
    pub fn request_stop(&self) {
        self.cancel.request_stop();
    }

    pub fn is_accepting(&self) -> bool {
        !self.queue.is_terminating()
    }
}
