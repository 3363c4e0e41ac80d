//! Inbound ticket events and their validation.
//!
//! A [`TicketEvent`] is produced upstream and consumed exactly once by the
//! pipeline. It is never mutated. Validation happens before deduplication so
//! malformed payloads never consume a ledger slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Schema versions of the input event this crate understands.
pub const SUPPORTED_SCHEMA_VERSIONS: &[u32] = &[1];

/// The current input schema version, used when producing new events.
pub const TICKET_EVENT_SCHEMA_VERSION: u32 = 1;

// ─── Enumerations ────────────────────────────────────────────────────────────

/// The channel through which a ticket was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
  Email,
  Chat,
  Phone,
}

impl Channel {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Email => "email",
      Self::Chat => "chat",
      Self::Phone => "phone",
    }
  }
}

/// Customer-declared urgency of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Normal,
  High,
  Critical,
}

impl Priority {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Normal => "normal",
      Self::High => "high",
      Self::Critical => "critical",
    }
  }
}

// ─── TicketEvent ─────────────────────────────────────────────────────────────

/// One inbound submission or update for a support ticket.
///
/// Unknown fields are ignored so producers may add optional fields without a
/// version bump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEvent {
  pub schema_version: u32,
  /// Globally unique; the idempotency key.
  pub event_id:       String,
  /// Shared by every event that concerns the same ticket.
  pub ticket_id:      String,
  #[serde(rename = "ts")]
  pub timestamp:      DateTime<Utc>,
  pub subject:        String,
  pub body:           String,
  pub channel:        Channel,
  pub priority:       Priority,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub customer_id:    Option<String>,
}

impl TicketEvent {
  /// Parse and validate a raw payload taken off the input log.
  ///
  /// The schema version is checked before the remaining fields so that a
  /// future-version payload is reported as such rather than as a field
  /// mismatch.
  pub fn parse(raw: &[u8]) -> Result<Self> {
    let value: serde_json::Value = serde_json::from_slice(raw)
      .map_err(|e| Error::InvalidEvent(format!("payload is not valid JSON: {e}")))?;

    if !value.is_object() {
      return Err(Error::InvalidEvent("payload is not a JSON object".into()));
    }

    let version = value
      .get("schema_version")
      .ok_or_else(|| Error::InvalidEvent("missing field `schema_version`".into()))?
      .as_u64()
      .and_then(|v| u32::try_from(v).ok())
      .ok_or_else(|| {
        Error::InvalidEvent("`schema_version` must be a non-negative integer".into())
      })?;

    if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
      return Err(Error::UnsupportedSchemaVersion(version));
    }

    let event: TicketEvent =
      serde_json::from_value(value).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    event.validate()?;
    Ok(event)
  }

  /// Checks that serde cannot express on its own.
  pub fn validate(&self) -> Result<()> {
    if self.event_id.trim().is_empty() {
      return Err(Error::InvalidEvent("`event_id` must not be empty".into()));
    }
    if self.ticket_id.trim().is_empty() {
      return Err(Error::InvalidEvent("`ticket_id` must not be empty".into()));
    }
    Ok(())
  }

  /// The text the retriever embeds and matches against the knowledge base.
  pub fn query_text(&self) -> String {
    format!("{}\n\n{}", self.subject.trim(), self.body.trim())
      .trim()
      .to_owned()
  }
}
