//! Dead-letter records for messages the pipeline could not process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::log::OffsetToken;

/// Classification of an unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
  /// Malformed or unversioned input; rejected before deduplication.
  ValidationError,
  /// Timeouts, rate limits or unavailability outlasting the transient budget.
  TransientProviderError,
  /// The provider refused the request outright.
  ProviderError,
  /// Model output still invalid after the corrective-retry budget.
  SchemaViolationError,
  /// The enrichment transaction failed beyond the persistence budget.
  PersistenceError,
  /// The enrichment committed but could not be published.
  PublishError,
}

impl FailureKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::ValidationError => "ValidationError",
      Self::TransientProviderError => "TransientProviderError",
      Self::ProviderError => "ProviderError",
      Self::SchemaViolationError => "SchemaViolationError",
      Self::PersistenceError => "PersistenceError",
      Self::PublishError => "PublishError",
    }
  }
}

impl std::fmt::Display for FailureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An append-only record on the dead-letter log. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
  /// The original payload, decoded lossily as UTF-8.
  pub payload:       String,
  pub failure_kind:  FailureKind,
  pub message:       String,
  pub attempts:      u32,
  pub failed_at:     DateTime<Utc>,
  /// Where the original record sat on the input log.
  pub source:        OffsetToken,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub event_id:      Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ticket_id:     Option<String>,
  /// The last raw model reply (schema violations) or the unpublished
  /// enriched event (publish failures).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_response: Option<String>,
}

impl DeadLetterRecord {
  /// The ticket id to key the record by, falling back to a best-effort parse
  /// of the payload.
  pub fn routing_key(&self) -> String {
    if let Some(ticket_id) = &self.ticket_id {
      return ticket_id.clone();
    }
    serde_json::from_str::<serde_json::Value>(&self.payload)
      .ok()
      .and_then(|v| v.get("ticket_id").and_then(|t| t.as_str()).map(str::to_owned))
      .unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(payload: &str, ticket_id: Option<&str>) -> DeadLetterRecord {
    DeadLetterRecord {
      payload:       payload.into(),
      failure_kind:  FailureKind::ValidationError,
      message:       "bad".into(),
      attempts:      1,
      failed_at:     Utc::now(),
      source:        OffsetToken { topic: "in".into(), partition: 0, offset: 7 },
      event_id:      None,
      ticket_id:     ticket_id.map(str::to_owned),
      last_response: None,
    }
  }

  #[test]
  fn failure_kind_serialises_by_name() {
    let json = serde_json::to_value(FailureKind::SchemaViolationError).unwrap();
    assert_eq!(json, serde_json::json!("SchemaViolationError"));
    assert_eq!(FailureKind::PersistenceError.to_string(), "PersistenceError");
  }

  #[test]
  fn routing_key_prefers_known_ticket() {
    assert_eq!(record("{}", Some("T9")).routing_key(), "T9");
    assert_eq!(record(r#"{"ticket_id":"T-100"}"#, None).routing_key(), "T-100");
    assert_eq!(record("\u{fffd}garbage", None).routing_key(), "");
  }
}
