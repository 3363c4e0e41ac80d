//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. Enumerations are stored as
//! their snake_case labels. Citations and keyword sets are compact JSON;
//! embeddings are little-endian `f32` blobs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use triage_core::{
  enrichment::{Category, Citation, Sentiment},
  kb::KbChunk,
  record::{EnrichedTicketRecord, TicketStatus},
  ticket::{Channel, Priority},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enumerations ────────────────────────────────────────────────────────────

pub fn decode_channel(s: &str) -> Result<Channel> {
  match s {
    "email" => Ok(Channel::Email),
    "chat" => Ok(Channel::Chat),
    "phone" => Ok(Channel::Phone),
    other => Err(Error::Decode { column: "channel", value: other.to_owned() }),
  }
}

pub fn decode_priority(s: &str) -> Result<Priority> {
  match s {
    "low" => Ok(Priority::Low),
    "normal" => Ok(Priority::Normal),
    "high" => Ok(Priority::High),
    "critical" => Ok(Priority::Critical),
    other => Err(Error::Decode { column: "priority", value: other.to_owned() }),
  }
}

pub fn decode_status(s: &str) -> Result<TicketStatus> {
  match s {
    "pending" => Ok(TicketStatus::Pending),
    "enriched" => Ok(TicketStatus::Enriched),
    "failed" => Ok(TicketStatus::Failed),
    other => Err(Error::Decode { column: "status", value: other.to_owned() }),
  }
}

pub fn decode_category(s: &str) -> Result<Category> {
  Category::from_label(s)
    .ok_or_else(|| Error::Decode { column: "category", value: s.to_owned() })
}

pub fn decode_sentiment(s: &str) -> Result<Sentiment> {
  Sentiment::from_label(s)
    .ok_or_else(|| Error::Decode { column: "sentiment", value: s.to_owned() })
}

// ─── JSON columns ────────────────────────────────────────────────────────────

pub fn encode_citations(citations: &[Citation]) -> Result<String> {
  Ok(serde_json::to_string(citations)?)
}

pub fn decode_citations(s: &str) -> Result<Vec<Citation>> {
  Ok(serde_json::from_str(s)?)
}

pub fn encode_keywords(keywords: &BTreeSet<String>) -> Result<String> {
  Ok(serde_json::to_string(keywords)?)
}

pub fn decode_keywords(s: &str) -> Result<BTreeSet<String>> {
  Ok(serde_json::from_str(s)?)
}

// ─── Embedding ───────────────────────────────────────────────────────────────

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
  vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
  if blob.len() % 4 != 0 {
    return Err(Error::InvalidEmbedding(format!(
      "blob length {} is not a multiple of 4",
      blob.len()
    )));
  }
  let vector: Vec<f32> = blob
    .chunks_exact(4)
    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    .collect();
  if vector.iter().any(|v| !v.is_finite()) {
    return Err(Error::InvalidEmbedding("contains non-finite values".into()));
  }
  Ok(vector)
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from an `enriched_tickets` row.
pub struct RawTicket {
  pub ticket_id:       String,
  pub last_event_id:   Option<String>,
  pub subject:         String,
  pub body:            String,
  pub channel:         String,
  pub priority:        String,
  pub customer_id:     Option<String>,
  pub status:          String,
  pub summary:         Option<String>,
  pub category:        Option<String>,
  pub sentiment:       Option<String>,
  pub risk:            Option<f64>,
  pub suggested_reply: Option<String>,
  pub citations:       String,
  pub created_at:      String,
  pub updated_at:      String,
}

impl RawTicket {
  pub const COLUMNS: &'static str = "ticket_id, last_event_id, subject, body, channel, \
     priority, customer_id, status, summary, category, sentiment, risk, \
     suggested_reply, citations, created_at, updated_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      ticket_id:       row.get(0)?,
      last_event_id:   row.get(1)?,
      subject:         row.get(2)?,
      body:            row.get(3)?,
      channel:         row.get(4)?,
      priority:        row.get(5)?,
      customer_id:     row.get(6)?,
      status:          row.get(7)?,
      summary:         row.get(8)?,
      category:        row.get(9)?,
      sentiment:       row.get(10)?,
      risk:            row.get(11)?,
      suggested_reply: row.get(12)?,
      citations:       row.get(13)?,
      created_at:      row.get(14)?,
      updated_at:      row.get(15)?,
    })
  }

  pub fn into_record(self) -> Result<EnrichedTicketRecord> {
    Ok(EnrichedTicketRecord {
      ticket_id:       self.ticket_id,
      last_event_id:   self.last_event_id,
      subject:         self.subject,
      body:            self.body,
      channel:         decode_channel(&self.channel)?,
      priority:        decode_priority(&self.priority)?,
      customer_id:     self.customer_id,
      status:          decode_status(&self.status)?,
      summary:         self.summary,
      category:        self.category.as_deref().map(decode_category).transpose()?,
      sentiment:       self.sentiment.as_deref().map(decode_sentiment).transpose()?,
      risk:            self.risk,
      suggested_reply: self.suggested_reply,
      citations:       decode_citations(&self.citations)?,
      created_at:      decode_dt(&self.created_at)?,
      updated_at:      decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values read from a `kb_chunks` row joined with its document.
pub struct RawChunk {
  pub chunk_id:     i64,
  pub doc_id:       i64,
  pub title:        String,
  pub heading_path: Option<String>,
  pub content:      String,
  pub embedding:    Vec<u8>,
  pub keywords:     String,
}

impl RawChunk {
  pub fn into_chunk(self) -> Result<KbChunk> {
    Ok(KbChunk {
      chunk_id:     self.chunk_id,
      doc_id:       self.doc_id,
      title:        self.title,
      heading_path: self.heading_path,
      content:      self.content,
      embedding:    decode_embedding(&self.embedding)?,
      keywords:     decode_keywords(&self.keywords)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn embedding_blob_roundtrip_and_rejects_ragged_blob() {
    let v = vec![0.25_f32, -1.0, 3.5];
    assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
    assert!(decode_embedding(&[0, 1, 2]).is_err());
    assert!(decode_embedding(&f32::NAN.to_le_bytes()).is_err());
  }

  #[test]
  fn unknown_status_is_a_decode_error() {
    assert!(matches!(
      decode_status("archived"),
      Err(Error::Decode { column: "status", .. })
    ));
  }
}
