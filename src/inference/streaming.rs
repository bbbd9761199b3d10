//! Streaming inference support
//!
//! Token-by-token delivery of generated text as a channel of events, and
//! reassembly of token bytes into valid UTF-8.

use tokio::sync::mpsc::UnboundedReceiver;

use crate::inference::engine::{EngineError, GenerationReport};
use crate::inference::request::RequestId;

/// An event emitted while a request is processed.
///
/// Every stream ends with exactly one `Done` or `Failed`.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A piece of generated text
    Token(String),
    /// Generation finished (end of sequence, budget, or stop)
    Done(GenerationReport),
    /// Generation failed
    Failed(EngineError),
}

impl GenerationEvent {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, GenerationEvent::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, GenerationEvent::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, GenerationEvent::Failed(_))
    }

    /// Returns true for either terminal variant
    pub fn is_terminal(&self) -> bool {
        !self.is_token()
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            GenerationEvent::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error if this is a Failed variant
    pub fn as_error(&self) -> Option<&EngineError> {
        match self {
            GenerationEvent::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Receiving end of a streamed request.
///
/// Dropping the stream asks the worker to stop the request early.
#[derive(Debug)]
pub struct GenerationStream {
    id: RequestId,
    events: UnboundedReceiver<GenerationEvent>,
}

impl GenerationStream {
    pub(crate) fn new(id: RequestId, events: UnboundedReceiver<GenerationEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Next event, or `None` once the request is over or was abandoned
    pub async fn next(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    /// Blocking variant of [`next`](Self::next) for non-async callers.
    /// Must not be called from inside an async runtime.
    pub fn blocking_next(&mut self) -> Option<GenerationEvent> {
        self.events.blocking_recv()
    }

    /// Drains the stream into the full text and the final report
    pub async fn collect(mut self) -> Result<(String, GenerationReport), EngineError> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                GenerationEvent::Token(piece) => text.push_str(&piece),
                GenerationEvent::Done(report) => return Ok((text, report)),
                GenerationEvent::Failed(e) => return Err(e),
            }
        }
        Err(EngineError::Abandoned)
    }
}

/// Accumulates token bytes and releases the longest valid UTF-8 prefix.
///
/// Multi-byte characters are often split across tokens, so a single token's
/// bytes cannot be decoded on their own.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns whatever complete text is now available.
    ///
    /// Each invalid sequence becomes one U+FFFD; an incomplete sequence at the
    /// end stays buffered for the next token.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut consumed = 0;
        while consumed < self.pending.len() {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid_up_to + invalid;
                        }
                        None => {
                            consumed += valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        non_empty(text)
    }

    /// Returns the buffered tail, replacing invalid bytes
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        non_empty(text)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
