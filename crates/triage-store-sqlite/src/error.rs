//! Error type for `triage-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] triage_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value outside its enumeration.
  #[error("unexpected {column} value: {value:?}")]
  Decode { column: &'static str, value: String },

  #[error("invalid embedding: {0}")]
  InvalidEmbedding(String),

  #[error("unknown topic: {0}")]
  UnknownTopic(String),

  #[error("topic {topic} has no partition {partition}")]
  InvalidPartition { topic: String, partition: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
