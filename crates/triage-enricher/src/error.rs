//! Error types for the enrichment pipeline.

use thiserror::Error;
use triage_core::dead_letter::FailureKind;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Infrastructure failures that stop a worker from finishing a message.
///
/// When one of these escapes [`crate::pipeline::Pipeline::process`] the source
/// offset has not been committed and the message will be delivered again.
#[derive(Debug, Error)]
pub enum Error {
  #[error("configuration error: {0}")]
  Config(String),

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("event source error: {0}")]
  Source(#[source] BoxError),

  #[error("dead-letter log error: {0}")]
  DeadLetter(#[source] BoxError),

  #[error("{operation} timed out")]
  Timeout { operation: &'static str },

  #[error(transparent)]
  Core(#[from] triage_core::Error),

  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An unrecoverable per-message failure, destined for the dead-letter log.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
  pub kind:          FailureKind,
  pub message:       String,
  pub attempts:      u32,
  pub last_response: Option<String>,
}

impl Failure {
  pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
    Self { kind, message: message.into(), attempts, last_response: None }
  }

  pub fn with_response(mut self, response: impl Into<String>) -> Self {
    self.last_response = Some(response.into());
    self
  }
}

impl std::fmt::Display for Failure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} after {} attempt(s): {}", self.kind, self.attempts, self.message)
  }
}

impl std::error::Error for Failure {}
