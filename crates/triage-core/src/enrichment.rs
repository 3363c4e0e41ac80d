//! Enrichment results: the validated output of the generative model and the
//! event published downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{kb::ChunkId, ticket::TicketEvent};

/// The output event schema version.
pub const ENRICHED_EVENT_SCHEMA_VERSION: u32 = 1;

// ─── Category ────────────────────────────────────────────────────────────────

/// The fixed set of ticket categories the model may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
  TechnicalIssue,
  AccountAccess,
  Billing,
  Integration,
  Notifications,
  DataRefresh,
  Exports,
  FeatureRequest,
  SecurityIncident,
  General,
}

impl Category {
  pub const ALL: [Category; 10] = [
    Self::TechnicalIssue,
    Self::AccountAccess,
    Self::Billing,
    Self::Integration,
    Self::Notifications,
    Self::DataRefresh,
    Self::Exports,
    Self::FeatureRequest,
    Self::SecurityIncident,
    Self::General,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::TechnicalIssue => "technical_issue",
      Self::AccountAccess => "account_access",
      Self::Billing => "billing",
      Self::Integration => "integration",
      Self::Notifications => "notifications",
      Self::DataRefresh => "data_refresh",
      Self::Exports => "exports",
      Self::FeatureRequest => "feature_request",
      Self::SecurityIncident => "security_incident",
      Self::General => "general",
    }
  }

  /// Match a label against the enumeration, ignoring case and surrounding
  /// whitespace only.
  pub fn from_label(label: &str) -> Option<Self> {
    let needle = label.trim().to_ascii_lowercase();
    Self::ALL.into_iter().find(|c| c.as_str() == needle)
  }
}

// ─── Sentiment ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
  Positive,
  Neutral,
  Negative,
}

impl Sentiment {
  pub const ALL: [Sentiment; 3] = [Self::Positive, Self::Neutral, Self::Negative];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Positive => "positive",
      Self::Neutral => "neutral",
      Self::Negative => "negative",
    }
  }

  pub fn from_label(label: &str) -> Option<Self> {
    let needle = label.trim().to_ascii_lowercase();
    Self::ALL.into_iter().find(|s| s.as_str() == needle)
  }
}

// ─── Citation ────────────────────────────────────────────────────────────────

/// A provenance pointer into the knowledge base.
///
/// Only ever built from chunks that were part of the retrieved context; the
/// model contributes the chunk id, never the title or heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
  pub chunk_id:     ChunkId,
  pub title:        String,
  pub heading_path: Option<String>,
}

// ─── Risk ────────────────────────────────────────────────────────────────────

/// Clamp a parsed risk score into `[0, 1]`. NaN maps to 0; infinities clamp to
/// the nearer bound.
pub fn clamp_risk(risk: f64) -> f64 {
  if risk.is_nan() {
    return 0.0;
  }
  risk.clamp(0.0, 1.0)
}

/// Trim `text` to at most `max_words` whitespace-separated words, appending
/// an ellipsis when anything was cut.
pub fn trim_reply(text: &str, max_words: usize) -> String {
  let words: Vec<&str> = text.split_whitespace().collect();
  if words.len() <= max_words {
    return text.trim().to_owned();
  }
  format!("{}…", words[..max_words].join(" "))
}

// ─── EnrichedFields ──────────────────────────────────────────────────────────

/// Model output that has passed the validation gate. Constructing one from raw
/// provider text is only possible through the response validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFields {
  pub summary:         String,
  pub category:        Category,
  pub sentiment:       Sentiment,
  /// Always within `[0, 1]`.
  pub risk:            f64,
  pub suggested_reply: String,
  pub citations:       Vec<Citation>,
}

// ─── EnrichedEvent ───────────────────────────────────────────────────────────

/// The outbound event published after a successful enrichment commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
  pub schema_version:  u32,
  pub event_id:        String,
  pub ticket_id:       String,
  #[serde(rename = "ts")]
  pub timestamp:       DateTime<Utc>,
  pub summary:         String,
  pub category:        Category,
  pub sentiment:       Sentiment,
  pub risk:            f64,
  pub suggested_reply: String,
  #[serde(default)]
  pub citations:       Vec<Citation>,
}

impl EnrichedEvent {
  pub fn new(ticket: &TicketEvent, fields: &EnrichedFields, at: DateTime<Utc>) -> Self {
    Self {
      schema_version:  ENRICHED_EVENT_SCHEMA_VERSION,
      event_id:        ticket.event_id.clone(),
      ticket_id:       ticket.ticket_id.clone(),
      timestamp:       at,
      summary:         fields.summary.clone(),
      category:        fields.category,
      sentiment:       fields.sentiment,
      risk:            clamp_risk(fields.risk),
      suggested_reply: fields.suggested_reply.clone(),
      citations:       fields.citations.clone(),
    }
  }
}
