//! Error types for `triage-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// An inbound ticket event failed structural or semantic validation.
  #[error("invalid ticket event: {0}")]
  InvalidEvent(String),

  #[error("unsupported schema version: {0}")]
  UnsupportedSchemaVersion(u32),

  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
