//! End-to-end pipeline behaviour against in-memory SQLite stores and logs.

use std::{
  sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
  },
  time::Duration,
};

use tokio::sync::Notify;

use triage_core::{
  dead_letter::{DeadLetterRecord, FailureKind},
  enrichment::{EnrichedEvent, EnrichedFields},
  log::{Delivery, EventSink, EventSource, OffsetToken},
  provider::{Generator, ModelRequest, ProviderError},
  record::{EnrichedTicketRecord, ProcessedEventRecord, TicketStatus},
  store::{CommitOutcome, TicketStore},
  ticket::TicketEvent,
};
use triage_enricher::{
  Collaborators, Outcome, Pipeline,
  config::{BackoffConfig, ModelProvider, Settings},
  providers::{HashingEmbedder, NoopReranker, StubGenerator},
};
use triage_store_sqlite::{LogConsumer, LogProducer, NewChunk, NewDocument, SqliteLog, SqliteStore};

const IN: &str = "tickets.raw";
const OUT: &str = "tickets.enriched";
const DLQ: &str = "tickets.dlq";
const GROUP: &str = "enricher";
const DIM: usize = 64;

// ─── Fakes ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum TestError {
  #[error("injected failure")]
  Injected,
  #[error(transparent)]
  Store(#[from] triage_store_sqlite::Error),
}

/// Consume one unit from `budget`; `true` means "fail this call".
fn take_failure(budget: &AtomicU32) -> bool {
  budget
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
    .is_ok()
}

/// Replies with scripted results in order, repeating the last one.
struct Scripted {
  replies:  Mutex<Vec<Result<String, ProviderError>>>,
  requests: Mutex<Vec<ModelRequest>>,
}

impl Scripted {
  fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
    Self { replies: Mutex::new(replies), requests: Mutex::new(Vec::new()) }
  }

  fn always(reply: &str) -> Self { Self::new(vec![Ok(reply.to_owned())]) }

  fn calls(&self) -> usize { self.requests.lock().unwrap().len() }
}

impl Generator for Scripted {
  fn name(&self) -> &'static str { "scripted" }

  async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
    self.requests.lock().unwrap().push(request.clone());
    let mut replies = self.replies.lock().unwrap();
    if replies.len() > 1 { replies.remove(0) } else { replies[0].clone() }
  }
}

/// A store whose enrichment commits fail a set number of times.
struct FlakyStore {
  inner:           SqliteStore,
  commit_failures: AtomicU32,
}

impl TicketStore for FlakyStore {
  type Error = TestError;

  async fn is_processed(&self, event_id: &str) -> Result<bool, TestError> {
    Ok(self.inner.is_processed(event_id).await?)
  }

  async fn get_processed(&self, event_id: &str) -> Result<Option<ProcessedEventRecord>, TestError> {
    Ok(self.inner.get_processed(event_id).await?)
  }

  async fn register_pending(&self, ticket: &TicketEvent) -> Result<(), TestError> {
    Ok(self.inner.register_pending(ticket).await?)
  }

  async fn commit_enrichment(
    &self,
    ticket: &TicketEvent,
    fields: &EnrichedFields,
  ) -> Result<CommitOutcome, TestError> {
    if take_failure(&self.commit_failures) {
      return Err(TestError::Injected);
    }
    Ok(self.inner.commit_enrichment(ticket, fields).await?)
  }

  async fn get_ticket(&self, ticket_id: &str) -> Result<Option<EnrichedTicketRecord>, TestError> {
    Ok(self.inner.get_ticket(ticket_id).await?)
  }
}

/// A store whose first enrichment commit lands and then stalls past the
/// caller's timeout. Later commits stall without landing.
struct StallingStore {
  inner:   SqliteStore,
  stall:   Duration,
  commits: AtomicU32,
}

impl TicketStore for StallingStore {
  type Error = TestError;

  async fn is_processed(&self, event_id: &str) -> Result<bool, TestError> {
    Ok(self.inner.is_processed(event_id).await?)
  }

  async fn get_processed(&self, event_id: &str) -> Result<Option<ProcessedEventRecord>, TestError> {
    Ok(self.inner.get_processed(event_id).await?)
  }

  async fn register_pending(&self, ticket: &TicketEvent) -> Result<(), TestError> {
    Ok(self.inner.register_pending(ticket).await?)
  }

  async fn commit_enrichment(
    &self,
    ticket: &TicketEvent,
    fields: &EnrichedFields,
  ) -> Result<CommitOutcome, TestError> {
    if self.commits.fetch_add(1, Ordering::SeqCst) == 0 {
      let outcome = self.inner.commit_enrichment(ticket, fields).await?;
      tokio::time::sleep(self.stall).await;
      return Ok(outcome);
    }
    tokio::time::sleep(self.stall).await;
    Err(TestError::Injected)
  }

  async fn get_ticket(&self, ticket_id: &str) -> Result<Option<EnrichedTicketRecord>, TestError> {
    Ok(self.inner.get_ticket(ticket_id).await?)
  }
}

/// Wraps the stub generator; each call announces itself and then waits to be
/// released.
#[derive(Default)]
struct Gated {
  entered: Notify,
  release: Notify,
}

impl Generator for Gated {
  fn name(&self) -> &'static str { "gated" }

  async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
    self.entered.notify_one();
    self.release.notified().await;
    StubGenerator.generate(request).await
  }
}

/// A consumer whose offset commits fail a set number of times, as if the
/// process died between the database commit and the acknowledgement.
struct FlakySource {
  inner:           LogConsumer,
  commit_failures: AtomicU32,
}

impl EventSource for FlakySource {
  type Error = TestError;

  fn partitions(&self) -> u32 { self.inner.partitions() }

  async fn next(&self, partition: u32) -> Result<Option<Delivery>, TestError> {
    Ok(self.inner.next(partition).await?)
  }

  async fn commit(&self, token: &OffsetToken) -> Result<(), TestError> {
    if take_failure(&self.commit_failures) {
      return Err(TestError::Injected);
    }
    Ok(self.inner.commit(token).await?)
  }
}

/// A producer whose appends fail a set number of times.
struct FlakySink {
  inner:    LogProducer,
  failures: AtomicU32,
}

impl FlakySink {
  fn reliable(inner: LogProducer) -> Self { Self { inner, failures: AtomicU32::new(0) } }

  fn failing(inner: LogProducer, failures: u32) -> Self {
    Self { inner, failures: AtomicU32::new(failures) }
  }
}

impl EventSink for FlakySink {
  type Error = TestError;

  async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<OffsetToken, TestError> {
    if take_failure(&self.failures) {
      return Err(TestError::Injected);
    }
    Ok(self.inner.publish(key, payload).await?)
  }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
  store: SqliteStore,
  log:   SqliteLog,
}

type TestPipeline<St, Ge, Src> =
  Pipeline<St, SqliteStore, HashingEmbedder, NoopReranker, Ge, Src, FlakySink>;

impl Harness {
  async fn new() -> Self {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let log = SqliteLog::open_in_memory().await.unwrap();
    log.create_topic(IN, 1).await.unwrap();
    log.create_topic(OUT, 1).await.unwrap();
    log.create_topic(DLQ, 1).await.unwrap();
    Self { store, log }
  }

  async fn consumer(&self) -> LogConsumer { self.log.consumer(GROUP, IN).await.unwrap() }

  fn sink(&self, topic: &str) -> FlakySink { FlakySink::reliable(self.log.producer(topic)) }

  fn pipeline<St, Ge, Src>(
    &self,
    store: St,
    generator: Ge,
    source: Src,
    output: FlakySink,
    dead_letters: FlakySink,
    settings: &Settings,
  ) -> TestPipeline<St, Ge, Src>
  where
    St: TicketStore + 'static,
    Ge: Generator + 'static,
    Src: EventSource + 'static,
  {
    Pipeline::new(
      Collaborators {
        store:        Arc::new(store),
        kb:           Arc::new(self.store.clone()),
        embedder:     Arc::new(HashingEmbedder::new(DIM)),
        reranker:     Arc::new(NoopReranker),
        generator:    Arc::new(generator),
        source:       Arc::new(source),
        output:       Arc::new(output),
        dead_letters: Arc::new(dead_letters),
      },
      settings,
    )
  }

  /// Shared store and generator handles, reliable logs.
  async fn assemble<St, Ge>(
    &self,
    store: Arc<St>,
    generator: Arc<Ge>,
    settings: &Settings,
  ) -> TestPipeline<St, Ge, LogConsumer>
  where
    St: TicketStore + 'static,
    Ge: Generator + 'static,
  {
    let consumer = self.consumer().await;
    Pipeline::new(
      Collaborators {
        store,
        kb:           Arc::new(self.store.clone()),
        embedder:     Arc::new(HashingEmbedder::new(DIM)),
        reranker:     Arc::new(NoopReranker),
        generator,
        source:       Arc::new(consumer),
        output:       Arc::new(self.sink(OUT)),
        dead_letters: Arc::new(self.sink(DLQ)),
      },
      settings,
    )
  }

  /// The common case: real store, reliable logs.
  async fn simple<Ge: Generator + 'static>(
    &self,
    generator: Ge,
    settings: &Settings,
  ) -> TestPipeline<SqliteStore, Ge, LogConsumer> {
    let consumer = self.consumer().await;
    self.pipeline(
      self.store.clone(),
      generator,
      consumer,
      self.sink(OUT),
      self.sink(DLQ),
      settings,
    )
  }

  async fn submit(&self, event_id: &str, ticket_id: &str, subject: &str, body: &str) {
    let payload = serde_json::json!({
      "schema_version": 1,
      "event_id":       event_id,
      "ticket_id":      ticket_id,
      "ts":             "2026-01-28T10:00:00Z",
      "subject":        subject,
      "body":           body,
      "channel":        "email",
      "priority":       "high",
    });
    self.submit_raw(ticket_id, serde_json::to_vec(&payload).unwrap()).await;
  }

  async fn submit_raw(&self, key: &str, payload: Vec<u8>) {
    self.log.append(IN, key, payload).await.unwrap();
  }

  async fn add_chunk(&self, title: &str, heading: &str, content: &str) -> i64 {
    let doc_id = self
      .store
      .add_document(NewDocument { title: title.into(), source: None, source_url: None })
      .await
      .unwrap();
    self
      .store
      .add_chunk(NewChunk {
        doc_id,
        chunk_index: 0,
        heading_path: Some(heading.into()),
        content: content.into(),
        embedding: Some(HashingEmbedder::new(DIM).embed_sync(content)),
      })
      .await
      .unwrap()
  }

  async fn published(&self) -> Vec<EnrichedEvent> {
    self
      .log
      .read(OUT, 0, 0, 100)
      .await
      .unwrap()
      .iter()
      .map(|d| serde_json::from_slice(&d.payload).unwrap())
      .collect()
  }

  async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
    self
      .log
      .read(DLQ, 0, 0, 100)
      .await
      .unwrap()
      .iter()
      .map(|d| serde_json::from_slice(&d.payload).unwrap())
      .collect()
  }

  async fn committed(&self) -> u64 { self.log.committed(GROUP, IN, 0).await.unwrap() }

  async fn ticket(&self, ticket_id: &str) -> Option<EnrichedTicketRecord> {
    self.store.get_ticket(ticket_id).await.unwrap()
  }
}

fn settings() -> Settings {
  let mut s = Settings::default();
  s.model.provider = ModelProvider::Stub;
  s.embedding.dimension = DIM;
  s.poll_interval_ms = 10;
  let instant = BackoffConfig { base_ms: 0, max_ms: 0, max_attempts: 3 };
  s.retry.transient = instant;
  s.retry.persistence = instant;
  s.retry.publish = instant;
  s
}

fn valid_reply(citations: &[i64]) -> String {
  serde_json::json!({
    "summary": "Customer cannot log in after password change.",
    "category": "account_access",
    "sentiment": "negative",
    "risk": 0.55,
    "suggested_reply": "Sorry for the trouble. Please reset your password from the login page.",
    "citations": citations,
  })
  .to_string()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn enriches_a_new_ticket() {
  let h = Harness::new().await;
  h.add_chunk("Account FAQ", "Passwords", "Reset your password from the login page.").await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let pipeline = h.simple(StubGenerator, &settings()).await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));

  let record = h.ticket("T1").await.unwrap();
  assert_eq!(record.status, TicketStatus::Enriched);
  assert_eq!(record.last_event_id.as_deref(), Some("e1"));
  assert!(record.category.is_some());
  let risk = record.risk.unwrap();
  assert!((0.0..=1.0).contains(&risk));
  assert!(!record.summary.unwrap().is_empty());

  assert!(h.store.is_processed("e1").await.unwrap());
  let published = h.published().await;
  assert_eq!(published.len(), 1);
  assert_eq!(published[0].event_id, "e1");
  assert_eq!(published[0].schema_version, 1);
  assert_eq!(h.committed().await, 1);
  assert!(h.dead_letters().await.is_empty());

  assert_eq!(pipeline.step(0).await.unwrap(), None);
}

#[tokio::test]
async fn redelivered_event_is_skipped() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let pipeline = h.simple(StubGenerator, &settings()).await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));
  let before = h.ticket("T1").await.unwrap();
  let ledger = h.store.get_processed("e1").await.unwrap().unwrap();

  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Duplicate));
  assert_eq!(h.ticket("T1").await.unwrap(), before);
  assert_eq!(h.store.get_processed("e1").await.unwrap().unwrap(), ledger);
  assert_eq!(h.published().await.len(), 1);
  assert_eq!(h.committed().await, 2);
}

#[tokio::test]
async fn schema_violations_exhaust_into_the_dead_letter_log() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Scripted::always(r#"{"summary": "ok"}"#);
  let pipeline = h.simple(generator, &settings()).await;
  assert_eq!(
    pipeline.step(0).await.unwrap(),
    Some(Outcome::DeadLettered(FailureKind::SchemaViolationError))
  );

  let dead = h.dead_letters().await;
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0].failure_kind, FailureKind::SchemaViolationError);
  assert_eq!(dead[0].attempts, 3);
  assert_eq!(dead[0].event_id.as_deref(), Some("e1"));
  assert_eq!(dead[0].last_response.as_deref(), Some(r#"{"summary": "ok"}"#));
  assert!(dead[0].payload.contains("Cannot login"));

  assert!(!h.store.is_processed("e1").await.unwrap());
  assert_eq!(h.ticket("T1").await.unwrap().status, TicketStatus::Pending);
  assert!(h.published().await.is_empty());
  assert_eq!(h.committed().await, 1);
}

#[tokio::test]
async fn empty_knowledge_base_still_enriches() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Export is empty", "the csv download has no rows").await;

  let pipeline = h.simple(StubGenerator, &settings()).await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));

  let record = h.ticket("T1").await.unwrap();
  assert!(record.citations.is_empty());
  assert!(!record.summary.unwrap().is_empty());
  assert!(record.category.is_some());
  assert!(record.risk.is_some());
  assert!(h.published().await[0].citations.is_empty());
}

// ─── Properties ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn citations_only_reference_supplied_chunks() {
  let h = Harness::new().await;
  let faq = h.add_chunk("Account FAQ", "Passwords", "Reset your password from the login page.").await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Scripted::always(&valid_reply(&[faq, 9_999]));
  let pipeline = h.simple(generator, &settings()).await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));

  let record = h.ticket("T1").await.unwrap();
  assert_eq!(record.citations.len(), 1);
  assert_eq!(record.citations[0].chunk_id, faq);
  assert_eq!(record.citations[0].title, "Account FAQ");
  assert_eq!(record.citations[0].heading_path.as_deref(), Some("Passwords"));
}

#[tokio::test]
async fn context_respects_top_k_and_character_cap() {
  let h = Harness::new().await;
  for i in 0..5 {
    h.add_chunk(&format!("Doc {i}"), "Section", &"password reset ".repeat(20)).await;
  }
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let mut s = settings();
  s.retrieval.top_k = 3;
  s.retrieval.max_context_chars = 400;

  let generator = Arc::new(Scripted::always(&valid_reply(&[])));
  let consumer = h.consumer().await;
  let pipeline = Pipeline::new(
    Collaborators {
      store:        Arc::new(h.store.clone()),
      kb:           Arc::new(h.store.clone()),
      embedder:     Arc::new(HashingEmbedder::new(DIM)),
      reranker:     Arc::new(NoopReranker),
      generator:    Arc::clone(&generator),
      source:       Arc::new(consumer),
      output:       Arc::new(h.sink(OUT)),
      dead_letters: Arc::new(h.sink(DLQ)),
    },
    &s,
  );
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));

  let requests = generator.requests.lock().unwrap();
  let system = &requests[0].system;
  let tags = system.matches("\n\n[chunk:").count();
  // 300 characters, then the second chunk truncated to the remaining 100.
  assert_eq!(tags, 2);
}

#[tokio::test]
async fn later_events_overwrite_the_ticket_record() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;
  h.submit("e2", "T1", "Invoice question", "charged twice on my invoice").await;

  let pipeline = h.simple(StubGenerator, &settings()).await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));
  let first = h.ticket("T1").await.unwrap();
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));
  let second = h.ticket("T1").await.unwrap();

  assert_eq!(second.last_event_id.as_deref(), Some("e2"));
  assert_eq!(second.subject, "Cannot login");
  assert_eq!(second.created_at, first.created_at);
  assert_ne!(second.summary, first.summary);
  assert!(h.store.is_processed("e1").await.unwrap());
  assert!(h.store.is_processed("e2").await.unwrap());
}

// ─── Failure paths ───────────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_input_is_dead_lettered_without_a_ledger_entry() {
  let h = Harness::new().await;
  h.submit_raw("T1", b"not json at all".to_vec()).await;
  h.submit_raw(
    "T2",
    br#"{"schema_version":1,"event_id":"e2","ticket_id":"T2","ts":"2026-01-28T10:00:00Z",
        "subject":"s","body":"b","channel":"fax","priority":"high"}"#
      .to_vec(),
  )
  .await;
  h.submit_raw(
    "T3",
    br#"{"schema_version":2,"event_id":"e3","ticket_id":"T3"}"#.to_vec(),
  )
  .await;

  let pipeline = h.simple(StubGenerator, &settings()).await;
  for _ in 0..3 {
    assert_eq!(
      pipeline.step(0).await.unwrap(),
      Some(Outcome::DeadLettered(FailureKind::ValidationError))
    );
  }
  assert_eq!(pipeline.step(0).await.unwrap(), None);

  let dead = h.dead_letters().await;
  assert_eq!(dead.len(), 3);
  assert!(dead.iter().all(|d| d.failure_kind == FailureKind::ValidationError && d.attempts == 1));
  assert_eq!(dead[0].payload, "not json at all");
  assert_eq!(dead[1].event_id.as_deref(), Some("e2"));
  assert_eq!(dead[2].ticket_id.as_deref(), Some("T3"));
  assert!(dead[2].message.contains('2'));

  assert!(!h.store.is_processed("e2").await.unwrap());
  assert!(h.ticket("T2").await.is_none());
  assert_eq!(h.committed().await, 3);
}

#[tokio::test]
async fn crash_between_commit_and_ack_is_absorbed_by_the_ledger() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let source = FlakySource { inner: h.consumer().await, commit_failures: AtomicU32::new(1) };
  let pipeline = h.pipeline(
    h.store.clone(),
    StubGenerator,
    source,
    h.sink(OUT),
    h.sink(DLQ),
    &settings(),
  );

  assert!(pipeline.step(0).await.is_err());
  assert!(h.store.is_processed("e1").await.unwrap());
  assert_eq!(h.committed().await, 0);

  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Duplicate));
  assert_eq!(h.committed().await, 1);
  assert_eq!(h.published().await.len(), 1);
}

#[tokio::test]
async fn persistent_store_failure_is_dead_lettered() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let store = FlakyStore { inner: h.store.clone(), commit_failures: AtomicU32::new(u32::MAX) };
  let generator = Arc::new(Scripted::always(&valid_reply(&[])));
  let consumer = h.consumer().await;
  let pipeline = Pipeline::new(
    Collaborators {
      store:        Arc::new(store),
      kb:           Arc::new(h.store.clone()),
      embedder:     Arc::new(HashingEmbedder::new(DIM)),
      reranker:     Arc::new(NoopReranker),
      generator:    Arc::clone(&generator),
      source:       Arc::new(consumer),
      output:       Arc::new(h.sink(OUT)),
      dead_letters: Arc::new(h.sink(DLQ)),
    },
    &settings(),
  );

  assert_eq!(
    pipeline.step(0).await.unwrap(),
    Some(Outcome::DeadLettered(FailureKind::PersistenceError))
  );
  // Each persistence attempt restarts from retrieval and asks the model again.
  assert_eq!(generator.calls(), 3);

  let dead = h.dead_letters().await;
  assert_eq!(dead[0].failure_kind, FailureKind::PersistenceError);
  assert_eq!(dead[0].attempts, 3);
  assert!(!h.store.is_processed("e1").await.unwrap());
  assert_eq!(h.ticket("T1").await.unwrap().status, TicketStatus::Pending);
  assert_eq!(h.committed().await, 1);
}

#[tokio::test]
async fn transient_store_failure_recovers() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let store = FlakyStore { inner: h.store.clone(), commit_failures: AtomicU32::new(1) };
  let consumer = h.consumer().await;
  let pipeline =
    h.pipeline(store, StubGenerator, consumer, h.sink(OUT), h.sink(DLQ), &settings());

  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));
  assert!(h.dead_letters().await.is_empty());
}

#[tokio::test]
async fn rate_limit_then_success() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Scripted::new(vec![
    Err(ProviderError::RateLimited { retry_after: Some(Duration::from_millis(5)) }),
    Err(ProviderError::Timeout),
    Ok(valid_reply(&[])),
  ]);
  let pipeline = h.simple(generator, &settings()).await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));
}

#[tokio::test]
async fn exhausted_transient_budget_is_dead_lettered() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Scripted::new(vec![Err(ProviderError::Unavailable("503".into()))]);
  let pipeline = h.simple(generator, &settings()).await;
  assert_eq!(
    pipeline.step(0).await.unwrap(),
    Some(Outcome::DeadLettered(FailureKind::TransientProviderError))
  );
  assert_eq!(h.dead_letters().await[0].attempts, 3);
}

#[tokio::test]
async fn provider_rejection_is_not_retried() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Scripted::new(vec![Err(ProviderError::Rejected {
    status:  401,
    message: "invalid x-api-key".into(),
  })]);
  let pipeline = h.simple(generator, &settings()).await;
  assert_eq!(
    pipeline.step(0).await.unwrap(),
    Some(Outcome::DeadLettered(FailureKind::ProviderError))
  );
  let dead = h.dead_letters().await;
  assert_eq!(dead[0].attempts, 1);
  assert!(dead[0].message.contains("401"));
}

#[tokio::test]
async fn publish_failure_keeps_the_committed_enrichment() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let consumer = h.consumer().await;
  let pipeline = h.pipeline(
    h.store.clone(),
    StubGenerator,
    consumer,
    FlakySink::failing(h.log.producer(OUT), u32::MAX),
    h.sink(DLQ),
    &settings(),
  );
  assert_eq!(
    pipeline.step(0).await.unwrap(),
    Some(Outcome::DeadLettered(FailureKind::PublishError))
  );

  assert_eq!(h.ticket("T1").await.unwrap().status, TicketStatus::Enriched);
  assert!(h.store.is_processed("e1").await.unwrap());

  let dead = h.dead_letters().await;
  assert_eq!(dead[0].attempts, 3);
  let unpublished: EnrichedEvent =
    serde_json::from_str(dead[0].last_response.as_deref().unwrap()).unwrap();
  assert_eq!(unpublished.event_id, "e1");
  assert_eq!(h.committed().await, 1);
}

#[tokio::test]
async fn failed_dead_letter_write_leaves_the_offset() {
  let h = Harness::new().await;
  h.submit_raw("T1", b"{".to_vec()).await;

  let consumer = h.consumer().await;
  let pipeline = h.pipeline(
    h.store.clone(),
    StubGenerator,
    consumer,
    h.sink(OUT),
    FlakySink::failing(h.log.producer(DLQ), 1),
    &settings(),
  );

  assert!(pipeline.step(0).await.is_err());
  assert_eq!(h.committed().await, 0);

  assert_eq!(
    pipeline.step(0).await.unwrap(),
    Some(Outcome::DeadLettered(FailureKind::ValidationError))
  );
  assert_eq!(h.dead_letters().await.len(), 1);
  assert_eq!(h.committed().await, 1);
}

fn reply_with_summary(summary: &str) -> String {
  let mut reply: serde_json::Value = serde_json::from_str(&valid_reply(&[])).unwrap();
  reply["summary"] = summary.into();
  reply.to_string()
}

fn stalling(h: &Harness) -> StallingStore {
  StallingStore {
    inner:   h.store.clone(),
    stall:   Duration::from_millis(300),
    commits: AtomicU32::new(0),
  }
}

fn short_store_timeout() -> Settings {
  let mut s = settings();
  s.store_timeout_ms = 100;
  s
}

#[tokio::test]
async fn landed_commit_is_published_as_stored() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Arc::new(Scripted::new(vec![
    Ok(reply_with_summary("first")),
    Ok(reply_with_summary("second")),
    Ok(reply_with_summary("third")),
  ]));
  let pipeline = h
    .assemble(Arc::new(stalling(&h)), Arc::clone(&generator), &short_store_timeout())
    .await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));

  assert_eq!(generator.calls(), 1);
  assert_eq!(h.ticket("T1").await.unwrap().summary.as_deref(), Some("first"));
  let published = h.published().await;
  assert_eq!(published.len(), 1);
  assert_eq!(published[0].summary, "first");
  assert_eq!(h.committed().await, 1);
}

#[tokio::test]
async fn landed_commit_is_not_dead_lettered_by_a_later_bad_reply() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;

  let generator = Arc::new(Scripted::new(vec![
    Ok(valid_reply(&[])),
    Ok(r#"{"summary": "ok"}"#.to_owned()),
  ]));
  let pipeline = h
    .assemble(Arc::new(stalling(&h)), Arc::clone(&generator), &short_store_timeout())
    .await;
  assert_eq!(pipeline.step(0).await.unwrap(), Some(Outcome::Enriched));

  assert!(h.dead_letters().await.is_empty());
  assert_eq!(h.ticket("T1").await.unwrap().status, TicketStatus::Enriched);
  assert_eq!(h.published().await.len(), 1);
  assert_eq!(h.committed().await, 1);
}

// ─── Workers ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn workers_drain_partitions_and_stop_on_shutdown() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let log = SqliteLog::open_in_memory().await.unwrap();
  log.create_topic(IN, 3).await.unwrap();
  log.create_topic(OUT, 3).await.unwrap();
  log.create_topic(DLQ, 1).await.unwrap();
  let h = Harness { store, log };

  for i in 0..9 {
    h.submit(&format!("e{i}"), &format!("T{i}"), "Cannot login", "invalid password").await;
  }

  let pipeline = Arc::new(h.simple(StubGenerator, &settings()).await);
  let (tx, rx) = tokio::sync::watch::channel(false);
  let running = tokio::spawn(Arc::clone(&pipeline).run(rx));

  tokio::time::timeout(Duration::from_secs(10), async {
    loop {
      let mut done = true;
      for i in 0..9 {
        done &= h.store.is_processed(&format!("e{i}")).await.unwrap();
      }
      if done {
        break;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  })
  .await
  .expect("all events processed");

  tx.send(true).unwrap();
  tokio::time::timeout(Duration::from_secs(5), running)
    .await
    .expect("workers stop after shutdown")
    .unwrap();

  let mut committed = 0;
  for partition in 0..3 {
    committed += h.log.committed(GROUP, IN, partition).await.unwrap();
  }
  assert_eq!(committed, 9);
}

#[tokio::test]
async fn shutdown_lets_the_in_flight_message_finish() {
  let h = Harness::new().await;
  h.submit("e1", "T1", "Cannot login", "invalid password").await;
  h.submit("e2", "T1", "Still locked out", "invalid password again").await;

  let gate = Arc::new(Gated::default());
  let pipeline = Arc::new(
    h.assemble(Arc::new(h.store.clone()), Arc::clone(&gate), &settings()).await,
  );
  let (tx, rx) = tokio::sync::watch::channel(false);
  let running = tokio::spawn(Arc::clone(&pipeline).run(rx));

  tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
    .await
    .expect("model call started");
  tx.send(true).unwrap();

  // Nothing is acknowledged while the model call is outstanding.
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(h.committed().await, 0);
  assert!(!h.store.is_processed("e1").await.unwrap());

  gate.release.notify_one();
  tokio::time::timeout(Duration::from_secs(5), running)
    .await
    .expect("worker stops after the in-flight message")
    .unwrap();

  let record = h.ticket("T1").await.unwrap();
  assert_eq!(record.status, TicketStatus::Enriched);
  assert_eq!(record.last_event_id.as_deref(), Some("e1"));
  assert_eq!(h.published().await.len(), 1);
  assert_eq!(h.committed().await, 1);
  assert!(!h.store.is_processed("e2").await.unwrap());
}
