//! Knowledge-base chunks as seen by the pipeline.
//!
//! Chunks are written by an external ingestion process and are read-only
//! here. Each chunk carries its embedding and a precomputed keyword set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Identifier of a knowledge-base chunk. Lower ids win ranking ties.
pub type ChunkId = i64;

/// A retrievable unit of knowledge-base content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbChunk {
  pub chunk_id:     ChunkId,
  pub doc_id:       i64,
  /// Title of the owning document.
  pub title:        String,
  /// Breadcrumb of section headings, e.g. `"Accounts > Passwords"`.
  pub heading_path: Option<String>,
  pub content:      String,
  pub embedding:    Vec<f32>,
  /// Normalised keyword index; see [`keywords`].
  pub keywords:     BTreeSet<String>,
}

const STOPWORDS: &[&str] = &[
  "the", "and", "for", "are", "but", "not", "you", "your", "with", "this",
  "that", "have", "has", "had", "was", "were", "from", "they", "them", "can",
  "cannot", "our", "out", "all", "any", "get", "got", "into", "its", "just",
  "than", "then", "there", "what", "when", "which", "will", "would", "could",
  "should", "been", "being", "also", "after", "before", "about",
];

/// Lowercase alphanumeric runs of at least three characters, minus
/// stopwords, in text order and with repeats.
pub fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|t| t.chars().count() >= 3)
    .map(str::to_lowercase)
    .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

/// The keyword set used for hybrid ranking: the distinct [`terms`] of `text`.
pub fn keywords(text: &str) -> BTreeSet<String> { terms(text).collect() }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keywords_are_normalised() {
    let terms = keywords("Cannot LOGIN: invalid password, try a reset!");
    let expected: BTreeSet<String> = ["login", "invalid", "password", "try", "reset"]
      .into_iter()
      .map(String::from)
      .collect();
    assert_eq!(terms, expected);
  }

  #[test]
  fn terms_keep_repeats() {
    let found: Vec<String> = terms("Reset the password, then reset again").collect();
    assert_eq!(found, ["reset", "password", "reset", "again"]);
  }

  #[test]
  fn keywords_of_empty_text() {
    assert!(keywords("  ").is_empty());
  }
}
