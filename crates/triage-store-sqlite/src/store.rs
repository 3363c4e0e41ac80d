//! [`SqliteStore`]: the SQLite implementation of [`TicketStore`] and
//! [`KnowledgeBase`].

use std::path::Path;

use chrono::Utc;
use rusqlite::OptionalExtension as _;
use tracing::{debug, warn};

use triage_core::{
  enrichment::{EnrichedFields, clamp_risk},
  kb::{ChunkId, KbChunk, keywords},
  record::{EnrichedTicketRecord, ProcessedEventRecord},
  store::{CommitOutcome, KnowledgeBase, TicketStore},
  ticket::TicketEvent,
};

use crate::{
  Result,
  encode::{
    RawChunk, RawTicket, decode_dt, encode_citations, encode_dt, encode_embedding,
    encode_keywords,
  },
  schema::STORE_SCHEMA,
};

// ─── Ingestion inputs ────────────────────────────────────────────────────────

/// A knowledge-base document, as written by ingestion tooling.
#[derive(Debug, Clone)]
pub struct NewDocument {
  pub title:      String,
  pub source:     Option<String>,
  pub source_url: Option<String>,
}

/// A chunk of a knowledge-base document, as written by ingestion tooling.
#[derive(Debug, Clone)]
pub struct NewChunk {
  pub doc_id:       i64,
  pub chunk_index:  i64,
  pub heading_path: Option<String>,
  pub content:      String,
  /// Chunks without an embedding are never retrieved.
  pub embedding:    Option<Vec<f32>>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Ticket records, the dedup ledger and the knowledge base in one SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Every
/// operation is a single call on the connection thread, so nothing holds the
/// connection across provider calls.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Knowledge-base writes (ingestion tooling) ─────────────────────────

  pub async fn add_document(&self, doc: NewDocument) -> Result<i64> {
    let at_str = encode_dt(Utc::now());

    let doc_id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO kb_documents (title, source, source_url, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![doc.title, doc.source, doc.source_url, at_str],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(doc_id)
  }

  /// Insert a chunk; its keyword index is derived from heading and content.
  pub async fn add_chunk(&self, chunk: NewChunk) -> Result<ChunkId> {
    let terms = keywords(&format!(
      "{} {}",
      chunk.heading_path.as_deref().unwrap_or_default(),
      chunk.content
    ));
    let keywords_str  = encode_keywords(&terms)?;
    let embedding_blob = chunk.embedding.as_deref().map(encode_embedding);

    let chunk_id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO kb_chunks (doc_id, chunk_index, heading_path, content, embedding, keywords)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          rusqlite::params![
            chunk.doc_id,
            chunk.chunk_index,
            chunk.heading_path,
            chunk.content,
            embedding_blob,
            keywords_str,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(chunk_id)
  }
}

// ─── TicketStore impl ────────────────────────────────────────────────────────

impl TicketStore for SqliteStore {
  type Error = crate::Error;

  // ── Dedup ledger ──────────────────────────────────────────────────────────

  async fn is_processed(&self, event_id: &str) -> Result<bool> {
    let id = event_id.to_owned();

    let found = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM processed_events WHERE event_id = ?1",
              rusqlite::params![id],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;

    Ok(found)
  }

  async fn get_processed(&self, event_id: &str) -> Result<Option<ProcessedEventRecord>> {
    let id = event_id.to_owned();

    let raw: Option<(String, String)> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT event_id, processed_at FROM processed_events WHERE event_id = ?1",
              rusqlite::params![id],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;

    raw
      .map(|(event_id, at)| {
        Ok(ProcessedEventRecord { event_id, processed_at: decode_dt(&at)? })
      })
      .transpose()
  }

  // ── Ticket records ────────────────────────────────────────────────────────

  async fn register_pending(&self, ticket: &TicketEvent) -> Result<()> {
    let ticket_id   = ticket.ticket_id.clone();
    let subject     = ticket.subject.clone();
    let body        = ticket.body.clone();
    let channel     = ticket.channel.as_str();
    let priority    = ticket.priority.as_str();
    let customer_id = ticket.customer_id.clone();
    let at_str      = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO enriched_tickets (
             ticket_id, subject, body, channel, priority, customer_id,
             status, created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)
           ON CONFLICT (ticket_id) DO NOTHING",
          rusqlite::params![ticket_id, subject, body, channel, priority, customer_id, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  async fn commit_enrichment(
    &self,
    ticket: &TicketEvent,
    fields: &EnrichedFields,
  ) -> Result<CommitOutcome> {
    let event_id        = ticket.event_id.clone();
    let ticket_id       = ticket.ticket_id.clone();
    let subject         = ticket.subject.clone();
    let body            = ticket.body.clone();
    let channel         = ticket.channel.as_str();
    let priority        = ticket.priority.as_str();
    let customer_id     = ticket.customer_id.clone();
    let summary         = fields.summary.clone();
    let category        = fields.category.as_str();
    let sentiment       = fields.sentiment.as_str();
    let risk            = clamp_risk(fields.risk);
    let suggested_reply = fields.suggested_reply.clone();
    let citations_str   = encode_citations(&fields.citations)?;
    let at_str          = encode_dt(Utc::now());

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        // The ledger insert is the idempotency commit point. Losing the race
        // drops the transaction, rolling back nothing but itself.
        let inserted = tx.execute(
          "INSERT INTO processed_events (event_id, processed_at) VALUES (?1, ?2)
           ON CONFLICT (event_id) DO NOTHING",
          rusqlite::params![event_id, at_str],
        )?;
        if inserted == 0 {
          return Ok(CommitOutcome::AlreadyProcessed);
        }

        tx.execute(
          "INSERT INTO enriched_tickets (
             ticket_id, last_event_id, subject, body, channel, priority, customer_id,
             status, summary, category, sentiment, risk, suggested_reply, citations,
             created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'enriched', ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
           ON CONFLICT (ticket_id) DO UPDATE SET
             last_event_id   = excluded.last_event_id,
             status          = 'enriched',
             summary         = excluded.summary,
             category        = excluded.category,
             sentiment       = excluded.sentiment,
             risk            = excluded.risk,
             suggested_reply = excluded.suggested_reply,
             citations       = excluded.citations,
             updated_at      = excluded.updated_at",
          rusqlite::params![
            ticket_id,
            event_id,
            subject,
            body,
            channel,
            priority,
            customer_id,
            summary,
            category,
            sentiment,
            risk,
            suggested_reply,
            citations_str,
            at_str,
          ],
        )?;

        tx.commit()?;
        Ok(CommitOutcome::Committed)
      })
      .await?;

    debug!(
      event_id = %ticket.event_id,
      ticket_id = %ticket.ticket_id,
      ?outcome,
      "enrichment transaction finished"
    );
    Ok(outcome)
  }

  async fn get_ticket(&self, ticket_id: &str) -> Result<Option<EnrichedTicketRecord>> {
    let id = ticket_id.to_owned();

    let raw: Option<RawTicket> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM enriched_tickets WHERE ticket_id = ?1",
                RawTicket::COLUMNS
              ),
              rusqlite::params![id],
              RawTicket::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawTicket::into_record).transpose()
  }
}

// ─── KnowledgeBase impl ──────────────────────────────────────────────────────

impl KnowledgeBase for SqliteStore {
  type Error = crate::Error;

  async fn load_chunks(&self) -> Result<Vec<KbChunk>> {
    let raws: Vec<RawChunk> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT c.chunk_id, c.doc_id, d.title, c.heading_path, c.content,
                  c.embedding, c.keywords
           FROM kb_chunks c
           JOIN kb_documents d ON d.doc_id = c.doc_id
           WHERE c.embedding IS NOT NULL
           ORDER BY c.chunk_id ASC",
        )?;

        let rows = stmt
          .query_map([], |row| {
            Ok(RawChunk {
              chunk_id:     row.get(0)?,
              doc_id:       row.get(1)?,
              title:        row.get(2)?,
              heading_path: row.get(3)?,
              content:      row.get(4)?,
              embedding:    row.get(5)?,
              keywords:     row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
      })
      .await?;

    // Undecodable rows are skipped, not fatal.
    Ok(
      raws
        .into_iter()
        .filter_map(|raw| {
          let chunk_id = raw.chunk_id;
          raw
            .into_chunk()
            .inspect_err(|e| warn!(chunk_id, error = %e, "skipping undecodable chunk"))
            .ok()
        })
        .collect(),
    )
  }
}
