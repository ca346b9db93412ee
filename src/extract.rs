use crate::chunker::LogChunk;
use crate::prompt::OutputSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed service reply: {0}")]
    MalformedReply(String),
    #[error("service not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ExtractionError {
    fn from(e: reqwest::Error) -> Self {
        ExtractionError::Transport(e.to_string())
    }
}

/// One request to the extraction service.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub session_id: &'a str,
    pub instructions: &'a str,
    pub input: &'a str,
}

/// The external reasoning boundary. Implementations own whatever
/// conversation memory they keep, keyed by `session_id`.
pub trait ExtractionService: Send {
    fn name(&self) -> &str;
    fn complete(&mut self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError>;

    /// Forget whatever the service keeps for `session_id`.
    fn end_session(&mut self, _session_id: &str) {}
}

impl<S: ExtractionService + ?Sized> ExtractionService for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn complete(&mut self, request: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        (**self).complete(request)
    }
    fn end_session(&mut self, session_id: &str) {
        (**self).end_session(session_id)
    }
}

/// Unparsed service output for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawModelResponse {
    pub chunk_index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// Fresh session per chunk so chunks never see each other.
    #[default]
    PerChunk,
    /// One session for the whole run (interactive use).
    Shared,
}

impl FromStr for SessionStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "per_chunk" | "chunk" => Ok(SessionStrategy::PerChunk),
            "shared" => Ok(SessionStrategy::Shared),
            other => Err(format!("unknown session strategy '{other}' (expected per_chunk | shared)")),
        }
    }
}

impl fmt::Display for SessionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStrategy::PerChunk => "per_chunk",
            SessionStrategy::Shared => "shared",
        })
    }
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sends chunks to an `ExtractionService` one at a time.
pub struct ExtractionClient<S> {
    service: S,
    run_id: String,
    sessions: SessionStrategy,
    schema: OutputSchema,
}

impl<S: ExtractionService> ExtractionClient<S> {
    pub fn new(service: S, run_id: impl Into<String>, sessions: SessionStrategy, schema: OutputSchema) -> Self {
        Self { service, run_id: run_id.into(), sessions, schema }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn schema(&self) -> OutputSchema {
        self.schema
    }

    pub fn session_for(&self, chunk_index: usize) -> String {
        match self.sessions {
            SessionStrategy::PerChunk => format!("{}-chunk-{}", self.run_id, chunk_index),
            SessionStrategy::Shared => self.run_id.clone(),
        }
    }

    pub fn extract(&mut self, chunk: &LogChunk) -> Result<RawModelResponse, ExtractionError> {
        let session_id = self.session_for(chunk.index);
        let request = ExtractionRequest {
            session_id: &session_id,
            instructions: self.schema.instructions(),
            input: &chunk.text,
        };
        debug!(chunk = chunk.index, session = %session_id, service = self.service.name(), "extracting");
        let result = self.service.complete(&request);
        // Per-chunk sessions are never reused.
        if self.sessions == SessionStrategy::PerChunk {
            self.service.end_session(&session_id);
        }
        Ok(RawModelResponse { chunk_index: chunk.index, text: result? })
    }

    pub fn into_service(self) -> S {
        self.service
    }
}
