//! Knowledge-base retrieval: embedding similarity blended with keyword
//! overlap picks a candidate pool, a reranker reorders it, and the result is
//! cut to top-K and a character budget.

use std::{collections::BTreeSet, time::Duration};

use tracing::{debug, warn};
use triage_core::{
  enrichment::Citation,
  kb::{ChunkId, KbChunk, keywords},
  provider::{Embedder, Reranker},
  store::KnowledgeBase,
};

use crate::config::RetrievalConfig;

/// A chunk selected for the prompt, possibly truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
  pub chunk_id:     ChunkId,
  pub title:        String,
  pub heading_path: Option<String>,
  pub content:      String,
  /// First-stage blended score.
  pub score:        f32,
}

/// The ranked context supplied to the model. Citations may only point here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
  pub chunks: Vec<RetrievedChunk>,
}

impl RetrievedContext {
  pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

  /// One citation per chunk, in rank order.
  pub fn citations(&self) -> Vec<Citation> {
    self.chunks.iter().map(RetrievedChunk::citation).collect()
  }

  pub fn get(&self, chunk_id: ChunkId) -> Option<&RetrievedChunk> {
    self.chunks.iter().find(|c| c.chunk_id == chunk_id)
  }

  /// Total characters of chunk content.
  pub fn content_chars(&self) -> usize {
    self.chunks.iter().map(|c| c.content.chars().count()).sum()
  }
}

impl RetrievedChunk {
  pub fn citation(&self) -> Citation {
    Citation {
      chunk_id:     self.chunk_id,
      title:        self.title.clone(),
      heading_path: self.heading_path.clone(),
    }
  }
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Cosine similarity; 0 when either vector is zero or the lengths differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
  if a.len() != b.len() || a.is_empty() {
    return 0.0;
  }
  let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
  for (x, y) in a.iter().zip(b) {
    dot += x * y;
    na += x * x;
    nb += y * y;
  }
  if na == 0.0 || nb == 0.0 {
    return 0.0;
  }
  dot / (na.sqrt() * nb.sqrt())
}

/// Fraction of query terms that also occur in the chunk.
pub fn keyword_overlap(query: &BTreeSet<String>, chunk: &BTreeSet<String>) -> f32 {
  if query.is_empty() {
    return 0.0;
  }
  let shared = query.intersection(chunk).count();
  shared as f32 / query.len() as f32
}

/// Blend-score every chunk and keep the best `limit`, highest first; ties go
/// to the lower chunk id.
pub fn candidates<'a>(
  chunks: &'a [KbChunk],
  query_vec: &[f32],
  query_terms: &BTreeSet<String>,
  keyword_weight: f32,
  limit: usize,
) -> Vec<(f32, &'a KbChunk)> {
  let w = keyword_weight.clamp(0.0, 1.0);

  let mut scored: Vec<(f32, &KbChunk)> = chunks
    .iter()
    .map(|chunk| {
      let semantic = cosine(query_vec, &chunk.embedding);
      let lexical = if w > 0.0 { keyword_overlap(query_terms, &chunk.keywords) } else { 0.0 };
      ((1.0 - w) * semantic + w * lexical, chunk)
    })
    .collect();

  scored.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then(a.chunk_id.cmp(&b.chunk_id)));
  scored.truncate(limit);
  scored
}

/// The text a reranker sees for a chunk.
pub fn passage(chunk: &KbChunk) -> String {
  [Some(chunk.title.as_str()), chunk.heading_path.as_deref(), Some(chunk.content.as_str())]
    .into_iter()
    .flatten()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("\n")
}

/// Reorder `ranked` by `scores`, highest first. The sort is stable, so equal
/// scores keep their first-stage order.
pub fn reorder<'a>(ranked: Vec<(f32, &'a KbChunk)>, scores: &[f32]) -> Vec<(f32, &'a KbChunk)> {
  let mut paired: Vec<_> = ranked.into_iter().zip(scores.iter().copied()).collect();
  paired.sort_by(|(_, a), (_, b)| b.total_cmp(a));
  paired.into_iter().map(|(entry, _)| entry).collect()
}

/// Take up to `top_k` chunks in order while their content fits the character
/// budget. The first chunk that overflows is truncated to what is left and
/// selection stops.
pub fn select(
  ranked: Vec<(f32, &KbChunk)>,
  top_k: usize,
  max_context_chars: usize,
) -> RetrievedContext {
  let mut selected = Vec::new();
  let mut used = 0usize;
  for (score, chunk) in ranked.into_iter().take(top_k) {
    let remaining = max_context_chars.saturating_sub(used);
    if remaining == 0 {
      break;
    }
    let len = chunk.content.chars().count();
    let overflows = len > remaining;
    let content: String = if overflows {
      chunk.content.chars().take(remaining).collect()
    } else {
      chunk.content.clone()
    };

    used += content.chars().count();
    selected.push(RetrievedChunk {
      chunk_id:     chunk.chunk_id,
      title:        chunk.title.clone(),
      heading_path: chunk.heading_path.clone(),
      content,
      score,
    });
    if overflows {
      break;
    }
  }

  RetrievedContext { chunks: selected }
}

/// Score, rank and select without a rerank stage.
pub fn rank(
  chunks: &[KbChunk],
  query_vec: &[f32],
  query_terms: &BTreeSet<String>,
  config: &RetrievalConfig,
) -> RetrievedContext {
  let ranked = candidates(chunks, query_vec, query_terms, config.keyword_weight, config.top_k);
  select(ranked, config.top_k, config.max_context_chars)
}

// ─── Retriever ───────────────────────────────────────────────────────────────

/// Loads the corpus, embeds the query, ranks a candidate pool, reranks it
/// and selects the context.
///
/// Every failure degrades to an empty context: enrichment proceeds without
/// knowledge-base grounding rather than failing the message.
#[derive(Debug, Clone)]
pub struct Retriever {
  config:        RetrievalConfig,
  store_timeout: Duration,
  embed_timeout: Duration,
}

impl Retriever {
  pub fn new(config: RetrievalConfig, store_timeout: Duration, embed_timeout: Duration) -> Self {
    Self { config, store_timeout, embed_timeout }
  }

  pub async fn retrieve<Kb, Em, Rr>(
    &self,
    kb: &Kb,
    embedder: &Em,
    reranker: &Rr,
    query: &str,
  ) -> RetrievedContext
  where
    Kb: KnowledgeBase,
    Em: Embedder,
    Rr: Reranker,
  {
    let chunks = match tokio::time::timeout(self.store_timeout, kb.load_chunks()).await {
      Ok(Ok(chunks)) => chunks,
      Ok(Err(e)) => {
        warn!(error = %e, "knowledge base unavailable; continuing without context");
        return RetrievedContext::default();
      }
      Err(_) => {
        warn!("knowledge base read timed out; continuing without context");
        return RetrievedContext::default();
      }
    };
    if chunks.is_empty() {
      debug!("knowledge base is empty");
      return RetrievedContext::default();
    }

    let query_vec = match tokio::time::timeout(self.embed_timeout, embedder.embed(query)).await {
      Ok(Ok(v)) => v,
      Ok(Err(e)) => {
        warn!(error = %e, "query embedding failed; continuing without context");
        return RetrievedContext::default();
      }
      Err(_) => {
        warn!("query embedding timed out; continuing without context");
        return RetrievedContext::default();
      }
    };

    let pool = candidates(
      &chunks,
      &query_vec,
      &keywords(query),
      self.config.keyword_weight,
      self.config.candidates.max(self.config.top_k),
    );
    let pool_size = pool.len();
    let ranked = self.rerank(reranker, query, pool).await;

    let context = select(ranked, self.config.top_k, self.config.max_context_chars);
    debug!(
      corpus = chunks.len(),
      candidates = pool_size,
      reranker = reranker.name(),
      selected = context.chunks.len(),
      chars = context.content_chars(),
      "retrieved context"
    );
    context
  }

  /// A failed rerank keeps the first-stage order.
  async fn rerank<'a, Rr: Reranker>(
    &self,
    reranker: &Rr,
    query: &str,
    pool: Vec<(f32, &'a KbChunk)>,
  ) -> Vec<(f32, &'a KbChunk)> {
    if pool.len() < 2 {
      return pool;
    }
    let passages: Vec<String> = pool.iter().map(|(_, chunk)| passage(chunk)).collect();

    match tokio::time::timeout(self.config.rerank.timeout(), reranker.score(query, &passages))
      .await
    {
      Ok(Ok(scores)) if scores.len() == pool.len() => reorder(pool, &scores),
      Ok(Ok(scores)) => {
        warn!(
          expected = pool.len(),
          got = scores.len(),
          "reranker returned the wrong number of scores; keeping retrieval order"
        );
        pool
      }
      Ok(Err(e)) => {
        warn!(error = %e, "rerank failed; keeping retrieval order");
        pool
      }
      Err(_) => {
        warn!("rerank timed out; keeping retrieval order");
        pool
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use triage_core::provider::ProviderError;

  use super::*;
  use crate::providers::NoopReranker;

  struct Corpus(Vec<KbChunk>);

  impl KnowledgeBase for Corpus {
    type Error = std::io::Error;

    async fn load_chunks(&self) -> Result<Vec<KbChunk>, std::io::Error> { Ok(self.0.clone()) }
  }

  struct Fixed(Vec<f32>);

  impl Embedder for Fixed {
    fn dimension(&self) -> usize { self.0.len() }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> { Ok(self.0.clone()) }
  }

  /// Prefers longer passages.
  struct ByLength;

  impl Reranker for ByLength {
    fn name(&self) -> &'static str { "by-length" }

    async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, ProviderError> {
      Ok(passages.iter().map(|p| p.len() as f32).collect())
    }
  }

  struct Broken;

  impl Reranker for Broken {
    fn name(&self) -> &'static str { "broken" }

    async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, ProviderError> {
      Err(ProviderError::Unavailable("503".into()))
    }
  }

  fn retriever(top_k: usize, candidates: usize) -> Retriever {
    let config = RetrievalConfig {
      top_k,
      candidates,
      keyword_weight: 0.0,
      ..RetrievalConfig::default()
    };
    Retriever::new(config, Duration::from_secs(1), Duration::from_secs(1))
  }

  /// Five equally similar chunks with content lengths 1..=5.
  fn corpus() -> Corpus {
    Corpus(
      (1..=5)
        .map(|i| chunk(i, vec![1.0], &"x".repeat(i as usize)))
        .collect(),
    )
  }

  fn ids(ctx: &RetrievedContext) -> Vec<ChunkId> { ctx.chunks.iter().map(|c| c.chunk_id).collect() }

  fn chunk(id: ChunkId, embedding: Vec<f32>, content: &str) -> KbChunk {
    KbChunk {
      chunk_id: id,
      doc_id: 1,
      title: format!("Doc {id}"),
      heading_path: None,
      content: content.into(),
      embedding,
      keywords: keywords(content),
    }
  }

  fn config(top_k: usize, max_context_chars: usize, keyword_weight: f32) -> RetrievalConfig {
    RetrievalConfig { top_k, max_context_chars, keyword_weight, ..RetrievalConfig::default() }
  }

  #[test]
  fn cosine_handles_degenerate_vectors() {
    assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
    assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
  }

  #[test]
  fn ranks_by_score_then_lower_id() {
    let chunks = vec![
      chunk(3, vec![1.0, 0.0], "alpha"),
      chunk(1, vec![0.0, 1.0], "beta"),
      chunk(2, vec![1.0, 0.0], "gamma"),
    ];
    let ctx = rank(&chunks, &[1.0, 0.0], &BTreeSet::new(), &config(6, 4_000, 0.0));
    let ids: Vec<_> = ctx.chunks.iter().map(|c| c.chunk_id).collect();
    assert_eq!(ids, vec![2, 3, 1]);
  }

  #[test]
  fn keyword_weight_breaks_semantic_ties() {
    let chunks = vec![
      chunk(1, vec![1.0, 0.0], "invoices are emailed monthly"),
      chunk(2, vec![1.0, 0.0], "reset password from the login page"),
    ];
    let terms = keywords("cannot login invalid password");
    let ctx = rank(&chunks, &[1.0, 0.0], &terms, &config(1, 4_000, 0.3));
    assert_eq!(ctx.chunks[0].chunk_id, 2);
  }

  #[test]
  fn respects_top_k() {
    let chunks: Vec<_> = (1..=10).map(|i| chunk(i, vec![1.0], "x")).collect();
    let ctx = rank(&chunks, &[1.0], &BTreeSet::new(), &config(6, 4_000, 0.0));
    assert_eq!(ctx.chunks.len(), 6);
  }

  #[test]
  fn truncates_the_overflowing_chunk_and_stops() {
    let chunks = vec![
      chunk(1, vec![1.0], &"a".repeat(60)),
      chunk(2, vec![1.0], &"b".repeat(60)),
      chunk(3, vec![1.0], &"c".repeat(10)),
    ];
    let ctx = rank(&chunks, &[1.0], &BTreeSet::new(), &config(6, 100, 0.0));
    assert_eq!(ctx.chunks.len(), 2);
    assert_eq!(ctx.chunks[1].content, "b".repeat(40));
    assert_eq!(ctx.content_chars(), 100);
  }

  #[test]
  fn budget_counts_characters_not_bytes() {
    let chunks = vec![chunk(1, vec![1.0], &"é".repeat(10))];
    let ctx = rank(&chunks, &[1.0], &BTreeSet::new(), &config(6, 4, 0.0));
    assert_eq!(ctx.chunks[0].content, "éééé");
  }

  #[test]
  fn zero_budget_selects_nothing() {
    let chunks = vec![chunk(1, vec![1.0], "content")];
    assert!(rank(&chunks, &[1.0], &BTreeSet::new(), &config(6, 0, 0.0)).is_empty());
  }

  #[test]
  fn citations_follow_rank_order() {
    let chunks = vec![chunk(5, vec![0.0, 1.0], "x"), chunk(9, vec![1.0, 0.0], "y")];
    let ctx = rank(&chunks, &[1.0, 0.0], &BTreeSet::new(), &config(6, 4_000, 0.0));
    let ids: Vec<_> = ctx.citations().into_iter().map(|c| c.chunk_id).collect();
    assert_eq!(ids, vec![9, 5]);
    assert_eq!(ctx.get(5).map(|c| c.title.as_str()), Some("Doc 5"));
  }

  #[tokio::test]
  async fn reranker_reorders_within_the_candidate_pool() {
    let ctx = retriever(2, 3).retrieve(&corpus(), &Fixed(vec![1.0]), &ByLength, "q").await;
    // Chunks 4 and 5 are longer but fall outside the three-chunk pool.
    assert_eq!(ids(&ctx), vec![3, 2]);
  }

  #[tokio::test]
  async fn noop_reranker_keeps_retrieval_order() {
    let ctx = retriever(2, 5).retrieve(&corpus(), &Fixed(vec![1.0]), &NoopReranker, "q").await;
    assert_eq!(ids(&ctx), vec![1, 2]);
  }

  #[tokio::test]
  async fn failed_rerank_keeps_retrieval_order() {
    let ctx = retriever(2, 5).retrieve(&corpus(), &Fixed(vec![1.0]), &Broken, "q").await;
    assert_eq!(ids(&ctx), vec![1, 2]);
  }

  #[tokio::test]
  async fn character_cap_applies_after_reranking() {
    let mut r = retriever(3, 5);
    r.config.max_context_chars = 7;
    let ctx = r.retrieve(&corpus(), &Fixed(vec![1.0]), &ByLength, "q").await;
    assert_eq!(ids(&ctx), vec![5, 4]);
    assert_eq!(ctx.chunks[1].content, "xx");
  }

  #[test]
  fn passage_joins_title_heading_and_content() {
    let mut c = chunk(1, vec![1.0], "body");
    c.heading_path = Some("Accounts > Passwords".into());
    assert_eq!(passage(&c), "Doc 1\nAccounts > Passwords\nbody");
    c.heading_path = None;
    assert_eq!(passage(&c), "Doc 1\nbody");
  }
}
