//! External capabilities: text embedding, candidate reranking and
//! generative-model invocation.
//!
//! Implementations are constructed once per process and shared by every
//! partition worker; they must be stateless with respect to individual
//! requests.

use std::{future::Future, time::Duration};

use thiserror::Error;

/// Failure reported by an embedding or model provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
  #[error("rate limited by provider")]
  RateLimited { retry_after: Option<Duration> },

  #[error("provider request timed out")]
  Timeout,

  #[error("provider unavailable: {0}")]
  Unavailable(String),

  /// The provider refused the request; repeating it will not help.
  #[error("provider rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },

  /// The provider's envelope (not the model text) could not be understood.
  #[error("malformed provider response: {0}")]
  Malformed(String),
}

impl ProviderError {
  /// Whether a plain backoff-and-retry may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::RateLimited { .. } | Self::Timeout | Self::Unavailable(_)
    )
  }

  /// Server-suggested wait before the next attempt, if any.
  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      Self::RateLimited { retry_after } => *retry_after,
      _ => None,
    }
  }
}

/// A request to the generative model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
  /// Role, output-schema instruction and knowledge-base context.
  pub system:     String,
  /// Ticket fields, plus corrective feedback on retries.
  pub user:       String,
  pub max_tokens: u32,
}

/// Turns text into a fixed-length vector.
pub trait Embedder: Send + Sync {
  fn dimension(&self) -> usize;

  fn embed<'a>(
    &'a self,
    text: &'a str,
  ) -> impl Future<Output = Result<Vec<f32>, ProviderError>> + Send + 'a;
}

/// Invokes the generative model and returns its raw, untrusted text.
pub trait Generator: Send + Sync {
  fn name(&self) -> &'static str;

  fn generate<'a>(
    &'a self,
    request: &'a ModelRequest,
  ) -> impl Future<Output = Result<String, ProviderError>> + Send + 'a;
}

/// Rescores retrieval candidates against the query.
///
/// Returns one score per passage, in input order; higher is more relevant.
/// Scores are only compared with each other.
pub trait Reranker: Send + Sync {
  fn name(&self) -> &'static str;

  fn score<'a>(
    &'a self,
    query: &'a str,
    passages: &'a [String],
  ) -> impl Future<Output = Result<Vec<f32>, ProviderError>> + Send + 'a;
}
