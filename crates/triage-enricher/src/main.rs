//! `triage`: runs the enrichment workers and offers a few operator commands.
//!
//! Reads `config.toml` (or the path given with `--config`) layered under
//! `TRIAGE_*` environment variables.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use triage_core::ticket::{TICKET_EVENT_SCHEMA_VERSION, TicketEvent};
use triage_enricher::{
  Collaborators, Pipeline,
  config::Settings,
  dead_letter,
  providers::{ConfiguredEmbedder, ConfiguredGenerator, ConfiguredReranker},
};
use triage_store_sqlite::{SqliteLog, SqliteStore};

#[derive(Parser)]
#[command(author, version, about = "Support-ticket enrichment pipeline")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run one worker per input partition until interrupted.
  Run,

  /// Append a new ticket event to the input topic.
  Submit {
    #[arg(long)]
    ticket_id:   String,
    #[arg(long)]
    subject:     String,
    #[arg(long)]
    body:        String,
    #[arg(long, default_value = "email")]
    channel:     String,
    #[arg(long, default_value = "normal")]
    priority:    String,
    #[arg(long)]
    customer_id: Option<String>,
    /// Defaults to a fresh UUID.
    #[arg(long)]
    event_id:    Option<String>,
  },

  /// List dead-lettered messages.
  DeadLetters {
    #[arg(long, default_value_t = 50)]
    limit: usize,
  },

  /// Re-append a dead-lettered payload to the input topic.
  Replay {
    #[arg(long)]
    partition: u32,
    #[arg(long)]
    offset:    u64,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let settings = Settings::load(Some(&cli.config)).context("failed to load configuration")?;

  let log_path = expand_tilde(&settings.log_path);
  let log = SqliteLog::open(&log_path)
    .await
    .with_context(|| format!("failed to open event log at {log_path:?}"))?;
  ensure_topics(&log, &settings).await?;

  match cli.command {
    Command::Run => run(settings, log).await,
    Command::Submit { ticket_id, subject, body, channel, priority, customer_id, event_id } => {
      let payload = serde_json::json!({
        "schema_version": TICKET_EVENT_SCHEMA_VERSION,
        "event_id":       event_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        "ticket_id":      ticket_id,
        "ts":             Utc::now(),
        "subject":        subject,
        "body":           body,
        "channel":        channel,
        "priority":       priority,
        "customer_id":    customer_id,
      });
      let bytes = serde_json::to_vec(&payload)?;
      let ticket = TicketEvent::parse(&bytes).context("ticket event is invalid")?;

      let token = log
        .append(&settings.topics.input, &ticket.ticket_id, bytes)
        .await
        .context("failed to append ticket event")?;
      println!(
        "submitted event {} for ticket {} at {}/{}@{}",
        ticket.event_id, ticket.ticket_id, token.topic, token.partition, token.offset
      );
      Ok(())
    }
    Command::DeadLetters { limit } => {
      let records = dead_letter::list(&log, &settings.topics.dead_letter, limit).await?;
      if records.is_empty() {
        println!("no dead letters");
      }
      for stored in records {
        let r = &stored.record;
        println!(
          "{}@{}  {}  attempts={}  event={}  ticket={}  {}",
          stored.position.partition,
          stored.position.offset,
          r.failure_kind,
          r.attempts,
          r.event_id.as_deref().unwrap_or("-"),
          r.ticket_id.as_deref().unwrap_or("-"),
          r.message,
        );
      }
      Ok(())
    }
    Command::Replay { partition, offset } => {
      let token = dead_letter::replay(
        &log,
        &settings.topics.dead_letter,
        partition,
        offset,
        &settings.topics.input,
      )
      .await?;
      println!("replayed to {}/{}@{}", token.topic, token.partition, token.offset);
      Ok(())
    }
  }
}

async fn ensure_topics(log: &SqliteLog, settings: &Settings) -> anyhow::Result<()> {
  let topics = &settings.topics;
  for (name, partitions) in [
    (&topics.input, topics.input_partitions),
    (&topics.output, topics.output_partitions),
    (&topics.dead_letter, topics.dead_letter_partitions),
  ] {
    log
      .create_topic(name, partitions)
      .await
      .with_context(|| format!("failed to create topic {name}"))?;
  }
  Ok(())
}

async fn run(settings: Settings, log: SqliteLog) -> anyhow::Result<()> {
  let db_path = expand_tilde(&settings.database_path);
  let store = Arc::new(
    SqliteStore::open(&db_path)
      .await
      .with_context(|| format!("failed to open store at {db_path:?}"))?,
  );

  let generator =
    ConfiguredGenerator::from_config(&settings.model).context("failed to build model client")?;
  let embedder = ConfiguredEmbedder::from_config(&settings.embedding)
    .context("failed to build embedding client")?;
  let reranker = ConfiguredReranker::from_config(&settings.retrieval.rerank)
    .context("failed to build reranker")?;

  let source = log
    .consumer(&settings.group_id, &settings.topics.input)
    .await
    .context("failed to join consumer group")?;

  let pipeline = Arc::new(Pipeline::new(
    Collaborators {
      kb:           Arc::clone(&store),
      store,
      embedder:     Arc::new(embedder),
      reranker:     Arc::new(reranker),
      generator:    Arc::new(generator),
      source:       Arc::new(source),
      output:       Arc::new(log.producer(&settings.topics.output)),
      dead_letters: Arc::new(log.producer(&settings.topics.dead_letter)),
    },
    &settings,
  ));

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("shutdown requested; finishing in-flight messages");
      shutdown_tx.send(true).ok();
    }
  });

  tracing::info!(
    group = %settings.group_id,
    input = %settings.topics.input,
    model = settings.model.model.as_str(),
    "enricher running"
  );
  pipeline.run(shutdown_rx).await;
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
