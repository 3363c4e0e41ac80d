//! Embedders: an OpenAI-compatible HTTP client and an offline
//! feature-hashing fallback.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use triage_core::provider::{Embedder, ProviderError};

use super::{classify_status, classify_transport};
use crate::{Error, Result, config::EmbeddingConfig};

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// Client for a `POST {base_url}/embeddings` endpoint.
#[derive(Clone)]
pub struct HttpEmbedder {
  client:    Client,
  base_url:  String,
  api_key:   Option<String>,
  model:     String,
  dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
  model: &'a str,
  input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
  embedding: Vec<f32>,
}

impl HttpEmbedder {
  pub fn new(config: &EmbeddingConfig) -> Result<Self> {
    let client = Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_owned(),
      api_key: config.api_key.clone(),
      model: config.model.clone(),
      dimension: config.dimension,
    })
  }
}

impl Embedder for HttpEmbedder {
  fn dimension(&self) -> usize { self.dimension }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
    let mut req = self
      .client
      .post(format!("{}/embeddings", self.base_url))
      .json(&EmbeddingRequest { model: &self.model, input: text });
    if let Some(key) = &self.api_key {
      req = req.bearer_auth(key);
    }

    let resp = req.send().await.map_err(classify_transport)?;
    let status = resp.status();
    if !status.is_success() {
      let headers = resp.headers().clone();
      let body = resp.text().await.unwrap_or_default();
      return Err(classify_status(status, &headers, body));
    }

    let parsed: EmbeddingResponse = resp
      .json()
      .await
      .map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let vector = parsed
      .data
      .into_iter()
      .next()
      .map(|d| d.embedding)
      .ok_or_else(|| ProviderError::Malformed("response contained no embeddings".into()))?;

    if vector.len() != self.dimension {
      return Err(ProviderError::Malformed(format!(
        "expected {} dimensions, got {}",
        self.dimension,
        vector.len()
      )));
    }
    Ok(vector)
  }
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed into a signed bucket; the
/// result is L2-normalised. Texts sharing vocabulary land close together,
/// which is enough for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
  dimension: usize,
}

impl HashingEmbedder {
  pub fn new(dimension: usize) -> Self { Self { dimension: dimension.max(1) } }

  pub fn embed_sync(&self, text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; self.dimension];
    let tokens = text
      .split(|c: char| !c.is_alphanumeric())
      .filter(|t| t.chars().count() >= 2)
      .map(str::to_lowercase);

    for token in tokens {
      let digest = Sha256::digest(token.as_bytes());
      let mut prefix = [0u8; 8];
      prefix.copy_from_slice(&digest[..8]);
      let bucket = (u64::from_le_bytes(prefix) % self.dimension as u64) as usize;
      let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
      vector[bucket] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
      vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
  }
}

impl Embedder for HashingEmbedder {
  fn dimension(&self) -> usize { self.dimension }

  async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
    Ok(self.embed_sync(text))
  }
}
