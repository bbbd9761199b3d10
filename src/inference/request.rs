//! Generation requests
//!
//! A request is created by the caller, consumed exactly once by the worker
//! and then discarded.

use std::fmt;

use uuid::Uuid;

use crate::inference::engine::GenerationOutcome;
use crate::inference::params::GenerationParams;

/// Identifier assigned to each submitted request
pub type RequestId = Uuid;

/// What the token callback wants the decode loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenControl {
    Continue,
    /// Stop early. Treated like cancellation, not as an error.
    Stop,
}

/// Invoked on the worker thread for each piece of generated text
pub type TokenCallback = Box<dyn FnMut(&str) -> TokenControl + Send>;

/// Invoked on the worker thread exactly once when the request finishes
pub type DoneCallback = Box<dyn FnOnce(GenerationOutcome) + Send>;

/// A queued unit of work for the worker
pub struct GenerationRequest {
    pub id: RequestId,
    pub prompt: String,
    pub params: GenerationParams,
    pub(crate) on_token: TokenCallback,
    pub(crate) on_done: DoneCallback,
}

impl GenerationRequest {
    pub fn new<T, D>(prompt: impl Into<String>, params: GenerationParams, on_token: T, on_done: D) -> Self
    where
        T: FnMut(&str) -> TokenControl + Send + 'static,
        D: FnOnce(GenerationOutcome) + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            params,
            on_token: Box::new(on_token),
            on_done: Box::new(on_done),
        }
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("id", &self.id)
            .field("prompt_len", &self.prompt.len())
            .field("params", &self.params)
            .finish()
    }
}
