//! Runtime configuration.
//!
//! Loaded from an optional TOML file layered under environment variables
//! prefixed with `TRIAGE_`, using `__` to descend into sections
//! (e.g. `TRIAGE_MODEL__PROVIDER=stub`).

use std::{path::{Path, PathBuf}, time::Duration};

use serde::Deserialize;

use crate::{Error, Result, retry::Backoff};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// SQLite file holding tickets, the dedup ledger and the knowledge base.
  pub database_path:    PathBuf,
  /// SQLite file holding the partitioned event log.
  pub log_path:         PathBuf,
  pub group_id:         String,
  pub topics:           TopicsConfig,
  /// How long an idle partition worker sleeps before polling again.
  pub poll_interval_ms: u64,
  pub store_timeout_ms: u64,
  pub retrieval:        RetrievalConfig,
  pub model:            ModelConfig,
  pub embedding:        EmbeddingConfig,
  pub retry:            RetryConfig,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      database_path:    PathBuf::from("triage.db"),
      log_path:         PathBuf::from("triage-log.db"),
      group_id:         "support-enricher".into(),
      topics:           TopicsConfig::default(),
      poll_interval_ms: 500,
      store_timeout_ms: 5_000,
      retrieval:        RetrievalConfig::default(),
      model:            ModelConfig::default(),
      embedding:        EmbeddingConfig::default(),
      retry:            RetryConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
  pub input:                  String,
  pub output:                 String,
  pub dead_letter:            String,
  pub input_partitions:       u32,
  pub output_partitions:      u32,
  pub dead_letter_partitions: u32,
}

impl Default for TopicsConfig {
  fn default() -> Self {
    Self {
      input:                  "tickets.raw".into(),
      output:                 "tickets.enriched".into(),
      dead_letter:            "tickets.dlq".into(),
      input_partitions:       4,
      output_partitions:      4,
      dead_letter_partitions: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
  pub top_k:             usize,
  /// Size of the first-stage pool handed to the reranker.
  pub candidates:        usize,
  pub max_context_chars: usize,
  /// Weight of keyword overlap in the blended score; 0 disables it.
  pub keyword_weight:    f32,
  pub rerank:            RerankConfig,
}

impl Default for RetrievalConfig {
  fn default() -> Self {
    Self {
      top_k:             6,
      candidates:        20,
      max_context_chars: 4_000,
      keyword_weight:    0.2,
      rerank:            RerankConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankProvider {
  /// Keep the first-stage order.
  None,
  Lexical,
  Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
  pub provider:     RerankProvider,
  /// Base URL of a cross-encoder server exposing `POST /rerank`.
  pub base_url:     String,
  pub api_key:      Option<String>,
  pub model:        String,
  pub timeout_secs: u64,
}

impl Default for RerankConfig {
  fn default() -> Self {
    Self {
      provider:     RerankProvider::None,
      base_url:     "http://localhost:8080".into(),
      api_key:      None,
      model:        "cross-encoder/ms-marco-MiniLM-L-6-v2".into(),
      timeout_secs: 10,
    }
  }
}

impl RerankConfig {
  pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
  Anthropic,
  Stub,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
  pub provider:        ModelProvider,
  pub base_url:        String,
  /// Falls back to `ANTHROPIC_API_KEY`; required only when the workers run
  /// against the anthropic provider.
  pub api_key:         Option<String>,
  pub model:           String,
  pub max_tokens:      u32,
  pub timeout_secs:    u64,
  pub reply_max_words: usize,
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      provider:        ModelProvider::Anthropic,
      base_url:        "https://api.anthropic.com".into(),
      api_key:         None,
      model:           "claude-sonnet-4-5-20250929".into(),
      max_tokens:      600,
      timeout_secs:    30,
      reply_max_words: 140,
    }
  }
}

impl ModelConfig {
  pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
  Hashing,
  Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  pub provider:     EmbeddingProvider,
  pub base_url:     String,
  pub api_key:      Option<String>,
  pub model:        String,
  pub dimension:    usize,
  pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      provider:     EmbeddingProvider::Hashing,
      base_url:     "https://api.openai.com/v1".into(),
      api_key:      None,
      model:        "text-embedding-3-small".into(),
      dimension:    384,
      timeout_secs: 10,
    }
  }
}

impl EmbeddingConfig {
  pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

/// One backoff policy as written in configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffConfig {
  pub base_ms:      u64,
  pub max_ms:       u64,
  pub max_attempts: u32,
}

impl From<BackoffConfig> for Backoff {
  fn from(c: BackoffConfig) -> Self {
    Backoff {
      base:         Duration::from_millis(c.base_ms),
      max:          Duration::from_millis(c.max_ms),
      max_attempts: c.max_attempts,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Model calls per message while the reply keeps failing validation.
  pub schema_attempts: u32,
  pub transient:       BackoffConfig,
  pub persistence:     BackoffConfig,
  pub publish:         BackoffConfig,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      schema_attempts: 3,
      transient:       BackoffConfig { base_ms: 500, max_ms: 20_000, max_attempts: 5 },
      persistence:     BackoffConfig { base_ms: 200, max_ms: 5_000, max_attempts: 3 },
      publish:         BackoffConfig { base_ms: 200, max_ms: 5_000, max_attempts: 5 },
    }
  }
}

impl Settings {
  /// Read `path` (if it exists) and the environment, then validate.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
      builder = builder.add_source(config::File::from(path).required(false));
    }
    let settings = builder
      .add_source(
        config::Environment::with_prefix("TRIAGE")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .map_err(|e| Error::Config(e.to_string()))?;

    let mut settings: Settings = settings
      .try_deserialize()
      .map_err(|e| Error::Config(e.to_string()))?;

    if settings.model.api_key.is_none() {
      settings.model.api_key = std::env::var("ANTHROPIC_API_KEY").ok();
    }

    settings.validate()?;
    Ok(settings)
  }

  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: &str| Err(Error::Config(msg.to_owned()));

    if self.group_id.trim().is_empty() {
      return invalid("group_id must not be empty");
    }
    for (name, topic) in [
      ("topics.input", &self.topics.input),
      ("topics.output", &self.topics.output),
      ("topics.dead_letter", &self.topics.dead_letter),
    ] {
      if topic.trim().is_empty() {
        return Err(Error::Config(format!("{name} must not be empty")));
      }
    }
    if self.topics.input_partitions == 0
      || self.topics.output_partitions == 0
      || self.topics.dead_letter_partitions == 0
    {
      return invalid("topic partition counts must be at least 1");
    }
    if self.store_timeout_ms == 0 {
      return invalid("store_timeout_ms must be positive");
    }
    if self.retrieval.top_k == 0 {
      return invalid("retrieval.top_k must be at least 1");
    }
    if self.retrieval.candidates < self.retrieval.top_k {
      return invalid("retrieval.candidates must be at least retrieval.top_k");
    }
    if !(0.0..=1.0).contains(&self.retrieval.keyword_weight) {
      return invalid("retrieval.keyword_weight must be within [0, 1]");
    }
    if self.model.reply_max_words == 0 {
      return invalid("model.reply_max_words must be at least 1");
    }
    if self.model.timeout_secs == 0
      || self.embedding.timeout_secs == 0
      || self.retrieval.rerank.timeout_secs == 0
    {
      return invalid("provider timeouts must be positive");
    }
    if self.embedding.dimension == 0 {
      return invalid("embedding.dimension must be at least 1");
    }
    if self.retry.schema_attempts == 0 {
      return invalid("retry.schema_attempts must be at least 1");
    }
    for (name, policy) in [
      ("retry.transient", self.retry.transient),
      ("retry.persistence", self.retry.persistence),
      ("retry.publish", self.retry.publish),
    ] {
      if policy.max_attempts == 0 {
        return Err(Error::Config(format!("{name}.max_attempts must be at least 1")));
      }
      if policy.base_ms > policy.max_ms {
        return Err(Error::Config(format!("{name}.base_ms exceeds max_ms")));
      }
    }
    Ok(())
  }

  pub fn store_timeout(&self) -> Duration { Duration::from_millis(self.store_timeout_ms) }

  pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
}
