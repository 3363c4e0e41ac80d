//! The `TicketStore` and `KnowledgeBase` traits.
//!
//! Both are implemented by storage backends (e.g. `triage-store-sqlite`). The
//! pipeline depends on these abstractions, not on any concrete backend.

use std::future::Future;

use crate::{
  enrichment::EnrichedFields,
  kb::KbChunk,
  record::{EnrichedTicketRecord, ProcessedEventRecord},
  ticket::TicketEvent,
};

/// Result of [`TicketStore::commit_enrichment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
  /// The ledger entry and the ticket upsert were committed together.
  Committed,
  /// Another delivery of the same event committed first; nothing was written.
  AlreadyProcessed,
}

/// Durable storage for the dedup ledger and the per-ticket read model.
///
/// All methods return `Send` futures so one store can be shared by every
/// partition worker.
pub trait TicketStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Dedup ledger ──────────────────────────────────────────────────────

  /// Whether `event_id` already has a ledger entry.
  fn is_processed<'a>(
    &'a self,
    event_id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  fn get_processed<'a>(
    &'a self,
    event_id: &'a str,
  ) -> impl Future<Output = Result<Option<ProcessedEventRecord>, Self::Error>> + Send + 'a;

  // ── Ticket records ────────────────────────────────────────────────────

  /// Create a `pending` record for the event's ticket unless one exists.
  /// Never modifies an existing record.
  fn register_pending<'a>(
    &'a self,
    ticket: &'a TicketEvent,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Atomically insert the ledger entry for `ticket.event_id` and upsert the
  /// ticket record with `fields`.
  ///
  /// Either both writes are durable when this returns `Committed`, or
  /// neither is.
  fn commit_enrichment<'a>(
    &'a self,
    ticket: &'a TicketEvent,
    fields: &'a EnrichedFields,
  ) -> impl Future<Output = Result<CommitOutcome, Self::Error>> + Send + 'a;

  fn get_ticket<'a>(
    &'a self,
    ticket_id: &'a str,
  ) -> impl Future<Output = Result<Option<EnrichedTicketRecord>, Self::Error>> + Send + 'a;
}

/// Read-only access to knowledge-base chunks.
pub trait KnowledgeBase: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Every chunk with a usable embedding, in ascending `chunk_id` order.
  fn load_chunks(
    &self,
  ) -> impl Future<Output = Result<Vec<KbChunk>, Self::Error>> + Send + '_;
}
