//! Rerankers: a pass-through, an offline term-frequency scorer, and a client
//! for a cross-encoder server.

use std::collections::{BTreeMap, BTreeSet};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use triage_core::{
  kb::terms,
  provider::{ProviderError, Reranker},
};

use super::{classify_status, classify_transport};
use crate::{Error, Result, config::RerankConfig};

// ─── No-op ───────────────────────────────────────────────────────────────────

/// Scores every passage equally, leaving the first-stage order intact.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReranker;

impl Reranker for NoopReranker {
  fn name(&self) -> &'static str { "none" }

  async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, ProviderError> {
    Ok(vec![0.0; passages.len()])
  }
}

// ─── Lexical ─────────────────────────────────────────────────────────────────

const SATURATION: f32 = 1.2;

/// Saturating term-frequency overlap, in `[0, 1]`.
///
/// Each distinct query term contributes `tf / (tf + k)`, so a passage that
/// repeats a term gains on one that mentions it once, with diminishing
/// returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalReranker;

impl LexicalReranker {
  pub fn score_sync(&self, query: &str, passage: &str) -> f32 {
    let wanted: BTreeSet<String> = terms(query).collect();
    if wanted.is_empty() {
      return 0.0;
    }

    let mut tf: BTreeMap<String, u32> = BTreeMap::new();
    for term in terms(passage).filter(|t| wanted.contains(t)) {
      *tf.entry(term).or_default() += 1;
    }
    let total: f32 = tf
      .values()
      .map(|&n| {
        let n = n as f32;
        n / (n + SATURATION)
      })
      .sum();
    total / wanted.len() as f32
  }
}

impl Reranker for LexicalReranker {
  fn name(&self) -> &'static str { "lexical" }

  async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, ProviderError> {
    Ok(passages.iter().map(|p| self.score_sync(query, p)).collect())
  }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// Client for a `POST {base_url}/rerank` cross-encoder endpoint.
///
/// Sends `{query, texts}` and expects `[{index, score}]`, the shape served
/// by text-embeddings-inference.
#[derive(Clone)]
pub struct HttpReranker {
  client:   Client,
  base_url: String,
  api_key:  Option<String>,
  model:    String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
  model: &'a str,
  query: &'a str,
  texts: &'a [String],
}

#[derive(Deserialize)]
struct RerankedText {
  index: usize,
  score: f32,
}

impl HttpReranker {
  pub fn new(config: &RerankConfig) -> Result<Self> {
    let client = Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_owned(),
      api_key: config.api_key.clone(),
      model: config.model.clone(),
    })
  }
}

impl Reranker for HttpReranker {
  fn name(&self) -> &'static str { "http" }

  async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, ProviderError> {
    if passages.is_empty() {
      return Ok(Vec::new());
    }

    let mut req = self
      .client
      .post(format!("{}/rerank", self.base_url))
      .json(&RerankRequest { model: &self.model, query, texts: passages });
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

    let ranked: Vec<RerankedText> = resp
      .json()
      .await
      .map_err(|e| ProviderError::Malformed(e.to_string()))?;

    // Results arrive sorted by score; put them back in input order.
    let mut scores: Vec<Option<f32>> = vec![None; passages.len()];
    for item in ranked {
      let slot = scores.get_mut(item.index).ok_or_else(|| {
        ProviderError::Malformed(format!("rerank index {} out of range", item.index))
      })?;
      *slot = Some(item.score);
    }
    scores
      .into_iter()
      .enumerate()
      .map(|(i, s)| s.ok_or_else(|| ProviderError::Malformed(format!("no score for text {i}"))))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method, path},
  };

  use super::*;

  fn passages(texts: &[&str]) -> Vec<String> { texts.iter().map(|t| t.to_string()).collect() }

  #[tokio::test]
  async fn noop_scores_are_all_equal() {
    let scores = NoopReranker.score("anything", &passages(&["a", "b", "c"])).await.unwrap();
    assert_eq!(scores, vec![0.0; 3]);
  }

  #[test]
  fn lexical_rewards_repeated_query_terms() {
    let once = LexicalReranker.score_sync("password reset", "reset from settings");
    let twice = LexicalReranker.score_sync(
      "password reset",
      "password reset: open the password reset page",
    );
    let none = LexicalReranker.score_sync("password reset", "invoices are emailed monthly");
    assert!(twice > once);
    assert!(once > none);
    assert_eq!(none, 0.0);
    assert!(twice < 1.0);
  }

  #[test]
  fn lexical_ignores_stopword_queries() {
    assert_eq!(LexicalReranker.score_sync("the and", "the and the"), 0.0);
  }

  #[tokio::test]
  async fn http_scores_return_in_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rerank"))
      .and(body_partial_json(serde_json::json!({ "query": "reset password" })))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
        { "index": 1, "score": 0.9 },
        { "index": 0, "score": 0.2 },
      ])))
      .expect(1)
      .mount(&server)
      .await;

    let reranker =
      HttpReranker::new(&RerankConfig { base_url: server.uri(), ..RerankConfig::default() })
        .unwrap();
    let scores = reranker
      .score("reset password", &passages(&["billing", "password help"]))
      .await
      .unwrap();
    assert_eq!(scores, vec![0.2, 0.9]);
  }

  #[tokio::test]
  async fn http_rejects_incomplete_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(serde_json::json!([{ "index": 0, "score": 0.5 }])),
      )
      .mount(&server)
      .await;

    let reranker =
      HttpReranker::new(&RerankConfig { base_url: server.uri(), ..RerankConfig::default() })
        .unwrap();
    assert!(matches!(
      reranker.score("q", &passages(&["a", "b"])).await,
      Err(ProviderError::Malformed(_))
    ));
  }

  #[tokio::test]
  async fn http_maps_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(502))
      .mount(&server)
      .await;

    let reranker =
      HttpReranker::new(&RerankConfig { base_url: server.uri(), ..RerankConfig::default() })
        .unwrap();
    assert!(reranker.score("q", &passages(&["a"])).await.unwrap_err().is_transient());
  }
}
