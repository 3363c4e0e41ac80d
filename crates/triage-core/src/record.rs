//! Durable records: the per-ticket read model and the dedup ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  enrichment::{Category, Citation, EnrichedFields, Sentiment},
  ticket::{Channel, Priority},
};

/// Where a ticket is in its enrichment lifecycle.
///
/// The pipeline only ever moves a ticket from `Pending` to `Enriched`.
/// `Failed` is reserved for operator tooling; dead-lettering an event does not
/// change the ticket's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
  Pending,
  Enriched,
  Failed,
}

impl TicketStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Enriched => "enriched",
      Self::Failed => "failed",
    }
  }
}

/// Latest known state of a ticket. One row per `ticket_id`; the most recently
/// committed enrichment wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTicketRecord {
  pub ticket_id:       String,
  pub last_event_id:   Option<String>,
  pub subject:         String,
  pub body:            String,
  pub channel:         Channel,
  pub priority:        Priority,
  pub customer_id:     Option<String>,
  pub status:          TicketStatus,
  pub summary:         Option<String>,
  pub category:        Option<Category>,
  pub sentiment:       Option<Sentiment>,
  pub risk:            Option<f64>,
  pub suggested_reply: Option<String>,
  pub citations:       Vec<Citation>,
  pub created_at:      DateTime<Utc>,
  pub updated_at:      DateTime<Utc>,
}

impl EnrichedTicketRecord {
  /// The enrichment stored for `event_id`, if that event is the one the row
  /// was last enriched by.
  pub fn enrichment_for(&self, event_id: &str) -> Option<EnrichedFields> {
    if self.status != TicketStatus::Enriched || self.last_event_id.as_deref() != Some(event_id) {
      return None;
    }
    Some(EnrichedFields {
      summary:         self.summary.clone()?,
      category:        self.category?,
      sentiment:       self.sentiment?,
      risk:            self.risk?,
      suggested_reply: self.suggested_reply.clone()?,
      citations:       self.citations.clone(),
    })
  }
}

/// Dedup ledger entry. Written once per accepted event, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
  pub event_id:     String,
  pub processed_at: DateTime<Utc>,
}
