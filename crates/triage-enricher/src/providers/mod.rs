//! Concrete [`Generator`], [`Embedder`] and [`Reranker`] implementations,
//! and the configuration-selected wrappers the binary runs with.

mod anthropic;
mod embedding;
mod rerank;
mod stub;

use std::time::Duration;

pub use anthropic::AnthropicGenerator;
pub use embedding::{HashingEmbedder, HttpEmbedder};
pub use rerank::{HttpReranker, LexicalReranker, NoopReranker};
pub use stub::StubGenerator;

use reqwest::{StatusCode, header::HeaderMap};
use triage_core::provider::{Embedder, Generator, ModelRequest, ProviderError, Reranker};

use crate::{
  Result,
  config::{
    EmbeddingConfig, EmbeddingProvider, ModelConfig, ModelProvider, RerankConfig, RerankProvider,
  },
};

// ─── HTTP error classification ───────────────────────────────────────────────

/// Map a non-success HTTP response onto a [`ProviderError`].
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: String) -> ProviderError {
  match status.as_u16() {
    429 => ProviderError::RateLimited { retry_after: retry_after(headers) },
    408 | 529 => ProviderError::Unavailable(format!("{status}: {body}")),
    code if status.is_server_error() => ProviderError::Unavailable(format!("{code}: {body}")),
    code => ProviderError::Rejected { status: code, message: body },
  }
}

/// Transport-level failure (no response received).
pub(crate) fn classify_transport(error: reqwest::Error) -> ProviderError {
  if error.is_timeout() {
    ProviderError::Timeout
  } else {
    ProviderError::Unavailable(error.to_string())
  }
}

/// `retry-after` in whole seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
  headers
    .get(reqwest::header::RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}

// ─── Configured providers ────────────────────────────────────────────────────

/// The generator chosen by `model.provider`.
pub enum ConfiguredGenerator {
  Anthropic(AnthropicGenerator),
  Stub(StubGenerator),
}

impl ConfiguredGenerator {
  pub fn from_config(config: &ModelConfig) -> Result<Self> {
    Ok(match config.provider {
      ModelProvider::Anthropic => Self::Anthropic(AnthropicGenerator::new(config)?),
      ModelProvider::Stub => Self::Stub(StubGenerator),
    })
  }
}

impl Generator for ConfiguredGenerator {
  fn name(&self) -> &'static str {
    match self {
      Self::Anthropic(g) => g.name(),
      Self::Stub(g) => g.name(),
    }
  }

  async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
    match self {
      Self::Anthropic(g) => g.generate(request).await,
      Self::Stub(g) => g.generate(request).await,
    }
  }
}

/// The embedder chosen by `embedding.provider`.
pub enum ConfiguredEmbedder {
  Hashing(HashingEmbedder),
  Http(HttpEmbedder),
}

impl ConfiguredEmbedder {
  pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
    Ok(match config.provider {
      EmbeddingProvider::Hashing => Self::Hashing(HashingEmbedder::new(config.dimension)),
      EmbeddingProvider::Http => Self::Http(HttpEmbedder::new(config)?),
    })
  }
}

impl Embedder for ConfiguredEmbedder {
  fn dimension(&self) -> usize {
    match self {
      Self::Hashing(e) => e.dimension(),
      Self::Http(e) => e.dimension(),
    }
  }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
    match self {
      Self::Hashing(e) => e.embed(text).await,
      Self::Http(e) => e.embed(text).await,
    }
  }
}

/// The reranker chosen by `retrieval.rerank.provider`.
pub enum ConfiguredReranker {
  None(NoopReranker),
  Lexical(LexicalReranker),
  Http(HttpReranker),
}

impl ConfiguredReranker {
  pub fn from_config(config: &RerankConfig) -> Result<Self> {
    Ok(match config.provider {
      RerankProvider::None => Self::None(NoopReranker),
      RerankProvider::Lexical => Self::Lexical(LexicalReranker),
      RerankProvider::Http => Self::Http(HttpReranker::new(config)?),
    })
  }
}

impl Reranker for ConfiguredReranker {
  fn name(&self) -> &'static str {
    match self {
      Self::None(r) => r.name(),
      Self::Lexical(r) => r.name(),
      Self::Http(r) => r.name(),
    }
  }

  async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, ProviderError> {
    match self {
      Self::None(r) => r.score(query, passages).await,
      Self::Lexical(r) => r.score(query, passages).await,
      Self::Http(r) => r.score(query, passages).await,
    }
  }
}
