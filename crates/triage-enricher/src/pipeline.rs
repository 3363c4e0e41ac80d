//! The enrichment pipeline: one sequential worker per source partition.
//!
//! For each delivery a worker runs
//! parse → dedup → register pending → retrieve → enrich → commit → publish
//! and only then commits the source offset. Unrecoverable per-message
//! failures are written to the dead-letter log before the offset moves.
//! Infrastructure failures leave the offset untouched so the message is
//! delivered again; the ledger short-circuits anything already committed.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};
use triage_core::{
  dead_letter::FailureKind,
  enrichment::{EnrichedEvent, EnrichedFields},
  log::{Delivery, EventSink, EventSource, OffsetToken},
  provider::{Embedder, Generator, Reranker},
  store::{CommitOutcome, KnowledgeBase, TicketStore},
  ticket::TicketEvent,
};

use crate::{
  Error, Failure, Result,
  config::Settings,
  dead_letter,
  prompt::PromptBuilder,
  respond::ResponseBuilder,
  retrieve::Retriever,
  retry::Backoff,
  validate::ResponseValidator,
};

/// What happened to one delivery. Every variant means the offset was
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Enriched,
  /// The event id was already in the ledger; nothing was written.
  Duplicate,
  DeadLettered(FailureKind),
}

/// The store's view of one event after a commit with an unknown outcome.
enum Recorded {
  Absent,
  /// Committed, and the ticket row still carries this event's enrichment.
  Current(EnrichedFields),
  /// Committed, but a later event has since overwritten the row.
  Superseded,
}

impl Recorded {
  fn into_fields(self) -> Option<EnrichedFields> {
    match self {
      Self::Current(fields) => Some(fields),
      Self::Absent | Self::Superseded => None,
    }
  }
}

/// The injected capabilities a pipeline runs against.
pub struct Collaborators<St, Kb, Em, Rr, Ge, Src, Snk> {
  pub store:        Arc<St>,
  pub kb:           Arc<Kb>,
  pub embedder:     Arc<Em>,
  pub reranker:     Arc<Rr>,
  pub generator:    Arc<Ge>,
  pub source:       Arc<Src>,
  pub output:       Arc<Snk>,
  pub dead_letters: Arc<Snk>,
}

pub struct Pipeline<St, Kb, Em, Rr, Ge, Src, Snk> {
  store:         Arc<St>,
  kb:            Arc<Kb>,
  embedder:      Arc<Em>,
  reranker:      Arc<Rr>,
  generator:     Arc<Ge>,
  source:        Arc<Src>,
  output:        Arc<Snk>,
  dead_letters:  Arc<Snk>,
  retriever:     Retriever,
  responder:     ResponseBuilder,
  persistence:   Backoff,
  publish:       Backoff,
  store_timeout: Duration,
  poll_interval: Duration,
}

impl<St, Kb, Em, Rr, Ge, Src, Snk> Pipeline<St, Kb, Em, Rr, Ge, Src, Snk>
where
  St: TicketStore + 'static,
  Kb: KnowledgeBase + 'static,
  Em: Embedder + 'static,
  Rr: Reranker + 'static,
  Ge: Generator + 'static,
  Src: EventSource + 'static,
  Snk: EventSink + 'static,
{
  pub fn new(parts: Collaborators<St, Kb, Em, Rr, Ge, Src, Snk>, settings: &Settings) -> Self {
    let responder = ResponseBuilder {
      prompt:          PromptBuilder::new(settings.model.max_tokens, settings.model.reply_max_words),
      validator:       ResponseValidator::new(settings.model.reply_max_words),
      schema_attempts: settings.retry.schema_attempts,
      transient:       settings.retry.transient.into(),
      call_timeout:    settings.model.timeout(),
    };

    Self {
      store:         parts.store,
      kb:            parts.kb,
      embedder:      parts.embedder,
      reranker:      parts.reranker,
      generator:     parts.generator,
      source:        parts.source,
      output:        parts.output,
      dead_letters:  parts.dead_letters,
      retriever:     Retriever::new(
        settings.retrieval.clone(),
        settings.store_timeout(),
        settings.embedding.timeout(),
      ),
      responder,
      persistence:   settings.retry.persistence.into(),
      publish:       settings.retry.publish.into(),
      store_timeout: settings.store_timeout(),
      poll_interval: settings.poll_interval(),
    }
  }

  // ── Workers ───────────────────────────────────────────────────────────

  /// Run one worker per partition until `shutdown` flips to `true`.
  ///
  /// Shutdown is observed between messages; a message in flight always
  /// finishes (or is left uncommitted) first.
  pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
    let partitions = self.source.partitions();
    info!(partitions, "starting partition workers");

    let mut workers = JoinSet::new();
    for partition in 0..partitions {
      let pipeline = Arc::clone(&self);
      let shutdown = shutdown.clone();
      workers.spawn(async move { pipeline.worker(partition, shutdown).await });
    }

    while let Some(joined) = workers.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "partition worker panicked");
      }
    }
    info!("all partition workers stopped");
  }

  async fn worker(&self, partition: u32, mut shutdown: watch::Receiver<bool>) {
    debug!(partition, "partition worker started");
    loop {
      if *shutdown.borrow() {
        break;
      }

      let idle = match self.step(partition).await {
        Ok(Some(_)) => false,
        Ok(None) => true,
        Err(e) => {
          error!(partition, error = %e, "message left uncommitted; it will be redelivered");
          true
        }
      };

      if idle {
        tokio::select! {
          _ = tokio::time::sleep(self.poll_interval) => {}
          changed = shutdown.changed() => {
            if changed.is_err() {
              break;
            }
          }
        }
      }
    }
    debug!(partition, "partition worker stopped");
  }

  /// Fetch and process the next message on `partition`, if any.
  pub async fn step(&self, partition: u32) -> Result<Option<Outcome>> {
    let next = tokio::time::timeout(self.store_timeout, self.source.next(partition))
      .await
      .map_err(|_| Error::Timeout { operation: "fetch" })?
      .map_err(|e| Error::Source(Box::new(e)))?;

    match next {
      Some(delivery) => self.process(delivery).await.map(Some),
      None => Ok(None),
    }
  }

  // ── Per-message protocol ──────────────────────────────────────────────

  /// Process one delivery to completion.
  ///
  /// `Ok` means the offset has been committed. `Err` means it has not.
  pub async fn process(&self, delivery: Delivery) -> Result<Outcome> {
    let token = &delivery.token;

    let ticket = match TicketEvent::parse(&delivery.payload) {
      Ok(ticket) => ticket,
      Err(e) => {
        let failure = Failure::new(FailureKind::ValidationError, e.to_string(), 1);
        return self.dead_letter(&delivery, None, failure).await;
      }
    };

    if self.store_call("is_processed", self.store.is_processed(&ticket.event_id)).await? {
      info!(
        event_id = %ticket.event_id,
        partition = token.partition,
        offset = token.offset,
        "duplicate event skipped"
      );
      self.commit_offset(token).await?;
      return Ok(Outcome::Duplicate);
    }

    self
      .store_call("register_pending", self.store.register_pending(&ticket))
      .await?;

    let fields = match self.enrich_and_commit(&ticket).await {
      Ok(Some(fields)) => fields,
      Ok(None) => {
        info!(event_id = %ticket.event_id, "event already committed; skipping");
        self.commit_offset(token).await?;
        return Ok(Outcome::Duplicate);
      }
      Err(failure) => return self.dead_letter(&delivery, Some(&ticket), failure).await,
    };

    let event = EnrichedEvent::new(&ticket, &fields, Utc::now());
    if let Err(failure) = self.publish_enriched(&event).await {
      return self.dead_letter(&delivery, Some(&ticket), failure).await;
    }

    self.commit_offset(token).await?;
    info!(
      event_id = %ticket.event_id,
      ticket_id = %ticket.ticket_id,
      category = fields.category.as_str(),
      risk = fields.risk,
      citations = fields.citations.len(),
      partition = token.partition,
      offset = token.offset,
      "ticket enriched"
    );
    Ok(Outcome::Enriched)
  }

  /// Retrieve, enrich and commit, retrying the whole unit on store failure.
  ///
  /// Returns the fields to publish, or `Ok(None)` when the event is already
  /// in the ledger with nothing of ours left to publish.
  async fn enrich_and_commit(
    &self,
    ticket: &TicketEvent,
  ) -> Result<Option<EnrichedFields>, Failure> {
    let mut attempt = 0;
    let mut timed_out = false;

    loop {
      attempt += 1;

      let context = self
        .retriever
        .retrieve(&*self.kb, &*self.embedder, &*self.reranker, &ticket.query_text())
        .await;
      let fields = self.responder.enrich(&*self.generator, ticket, &context).await?;

      let error = match self
        .store_call("commit_enrichment", self.store.commit_enrichment(ticket, &fields))
        .await
      {
        Ok(CommitOutcome::Committed) => return Ok(Some(fields)),
        // Landed after our check; the store's copy is the one to publish.
        Ok(CommitOutcome::AlreadyProcessed) if timed_out => match self.recorded(ticket).await {
          Ok(recorded) => return Ok(recorded.into_fields()),
          Err(error) => error,
        },
        Ok(CommitOutcome::AlreadyProcessed) => return Ok(None),
        Err(error) => error,
      };

      // A timed-out transaction may still have landed. If it did, the store
      // holds the enrichment; never re-run the model over it.
      if matches!(error, Error::Timeout { .. }) {
        timed_out = true;
        match self.recorded(ticket).await {
          Ok(Recorded::Absent) => {}
          Ok(recorded) => {
            info!(event_id = %ticket.event_id, "timed-out commit had landed");
            return Ok(recorded.into_fields());
          }
          Err(e) => warn!(event_id = %ticket.event_id, error = %e, "could not check the ledger"),
        }
      }

      if !self.persistence.can_retry(attempt) {
        return Err(Failure::new(FailureKind::PersistenceError, error.to_string(), attempt));
      }
      let delay = self.persistence.delay(attempt, None);
      warn!(
        event_id = %ticket.event_id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        %error,
        "enrichment commit failed; retrying from retrieval"
      );
      tokio::time::sleep(delay).await;
    }
  }

  /// What the store holds for `ticket`'s event.
  async fn recorded(&self, ticket: &TicketEvent) -> Result<Recorded> {
    if !self.store_call("is_processed", self.store.is_processed(&ticket.event_id)).await? {
      return Ok(Recorded::Absent);
    }
    let row = self
      .store_call("get_ticket", self.store.get_ticket(&ticket.ticket_id))
      .await?;
    Ok(match row.and_then(|r| r.enrichment_for(&ticket.event_id)) {
      Some(fields) => Recorded::Current(fields),
      None => Recorded::Superseded,
    })
  }

  async fn publish_enriched(&self, event: &EnrichedEvent) -> Result<OffsetToken, Failure> {
    let payload = serde_json::to_vec(event)
      .map_err(|e| Failure::new(FailureKind::PublishError, e.to_string(), 1))?;

    let mut attempt = 0;
    loop {
      attempt += 1;
      let message = match tokio::time::timeout(
        self.store_timeout,
        self.output.publish(&event.ticket_id, payload.clone()),
      )
      .await
      {
        Ok(Ok(token)) => {
          debug!(
            event_id = %event.event_id,
            partition = token.partition,
            offset = token.offset,
            "enriched event published"
          );
          return Ok(token);
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => "publish timed out".to_owned(),
      };

      if !self.publish.can_retry(attempt) {
        let body = String::from_utf8_lossy(&payload).into_owned();
        return Err(
          Failure::new(FailureKind::PublishError, message, attempt).with_response(body),
        );
      }
      let delay = self.publish.delay(attempt, None);
      warn!(event_id = %event.event_id, attempt, %message, "publish failed; retrying");
      tokio::time::sleep(delay).await;
    }
  }

  /// Write a dead letter, then commit the source offset.
  ///
  /// If the dead-letter write fails the offset stays put.
  async fn dead_letter(
    &self,
    delivery: &Delivery,
    ticket: Option<&TicketEvent>,
    failure: Failure,
  ) -> Result<Outcome> {
    let record = dead_letter::record(delivery, ticket, &failure, Utc::now());
    let payload = serde_json::to_vec(&record)?;

    tokio::time::timeout(
      self.store_timeout,
      self.dead_letters.publish(&record.routing_key(), payload),
    )
    .await
    .map_err(|_| Error::Timeout { operation: "dead-letter publish" })?
    .map_err(|e| Error::DeadLetter(Box::new(e)))?;

    warn!(
      event_id = record.event_id.as_deref().unwrap_or("-"),
      ticket_id = record.ticket_id.as_deref().unwrap_or("-"),
      failure_kind = %failure.kind,
      attempts = failure.attempts,
      partition = delivery.token.partition,
      offset = delivery.token.offset,
      message = %failure.message,
      "message dead-lettered"
    );

    self.commit_offset(&delivery.token).await?;
    Ok(Outcome::DeadLettered(failure.kind))
  }

  async fn commit_offset(&self, token: &OffsetToken) -> Result<()> {
    tokio::time::timeout(self.store_timeout, self.source.commit(token))
      .await
      .map_err(|_| Error::Timeout { operation: "offset commit" })?
      .map_err(|e| Error::Source(Box::new(e)))
  }

  async fn store_call<T, E>(
    &self,
    operation: &'static str,
    call: impl Future<Output = std::result::Result<T, E>>,
  ) -> Result<T>
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    match tokio::time::timeout(self.store_timeout, call).await {
      Ok(result) => result.map_err(|e| Error::Store(Box::new(e))),
      Err(_) => Err(Error::Timeout { operation }),
    }
  }
}
