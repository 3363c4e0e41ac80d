//! Dead-letter record construction, inspection and operator replay.

use chrono::{DateTime, Utc};
use triage_core::{
  dead_letter::DeadLetterRecord,
  log::{Delivery, OffsetToken},
  ticket::TicketEvent,
};
use triage_store_sqlite::SqliteLog;

use crate::{Error, Failure, Result};

/// Build the record for a message that failed with `failure`.
///
/// `ticket` is the parsed event when parsing got that far; otherwise the
/// identifiers are recovered from the payload on a best-effort basis.
pub fn record(
  delivery: &Delivery,
  ticket: Option<&TicketEvent>,
  failure: &Failure,
  at: DateTime<Utc>,
) -> DeadLetterRecord {
  let payload = String::from_utf8_lossy(&delivery.payload).into_owned();
  let (event_id, ticket_id) = match ticket {
    Some(t) => (Some(t.event_id.clone()), Some(t.ticket_id.clone())),
    None => salvage_ids(&payload),
  };

  DeadLetterRecord {
    payload,
    failure_kind: failure.kind,
    message: failure.message.clone(),
    attempts: failure.attempts,
    failed_at: at,
    source: delivery.token.clone(),
    event_id,
    ticket_id,
    last_response: failure.last_response.clone(),
  }
}

fn salvage_ids(payload: &str) -> (Option<String>, Option<String>) {
  let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
    return (None, None);
  };
  let field = |name: &str| {
    value
      .get(name)
      .and_then(|v| v.as_str())
      .filter(|s| !s.trim().is_empty())
      .map(str::to_owned)
  };
  (field("event_id"), field("ticket_id"))
}

/// A dead-letter record together with its position on the dead-letter log.
#[derive(Debug, Clone)]
pub struct StoredDeadLetter {
  pub position: OffsetToken,
  pub record:   DeadLetterRecord,
}

/// Read up to `limit` dead letters from every partition of `topic`.
pub async fn list(log: &SqliteLog, topic: &str, limit: usize) -> Result<Vec<StoredDeadLetter>> {
  let partitions = log
    .partitions(topic)
    .await
    .map_err(|e| Error::DeadLetter(Box::new(e)))?;

  let mut out = Vec::new();
  for partition in 0..partitions {
    let remaining = limit.saturating_sub(out.len());
    if remaining == 0 {
      break;
    }
    let deliveries = log
      .read(topic, partition, 0, remaining)
      .await
      .map_err(|e| Error::DeadLetter(Box::new(e)))?;
    for delivery in deliveries {
      let record: DeadLetterRecord = serde_json::from_slice(&delivery.payload)?;
      out.push(StoredDeadLetter { position: delivery.token, record });
    }
  }
  Ok(out)
}

/// Re-append the original payload of the dead letter at `partition`/`offset`
/// to `input_topic`. Returns the new position on the input log.
pub async fn replay(
  log: &SqliteLog,
  dead_letter_topic: &str,
  partition: u32,
  offset: u64,
  input_topic: &str,
) -> Result<OffsetToken> {
  let delivery = log
    .read(dead_letter_topic, partition, offset, 1)
    .await
    .map_err(|e| Error::DeadLetter(Box::new(e)))?
    .into_iter()
    .find(|d| d.token.offset == offset)
    .ok_or_else(|| {
      Error::DeadLetter(
        format!("no dead letter at {dead_letter_topic}/{partition}@{offset}").into(),
      )
    })?;

  let record: DeadLetterRecord = serde_json::from_slice(&delivery.payload)?;
  let token = log
    .append(input_topic, &record.routing_key(), record.payload.into_bytes())
    .await
    .map_err(|e| Error::Source(Box::new(e)))?;

  tracing::info!(
    from = %format!("{dead_letter_topic}/{partition}@{offset}"),
    to_partition = token.partition,
    to_offset = token.offset,
    "replayed dead letter"
  );
  Ok(token)
}
