//! [`SqliteLog`]: a durable partitioned log kept in SQLite.
//!
//! Topics are created with a fixed partition count. Records are routed to a
//! partition by a stable hash of their key, so every record for one ticket
//! lands on the same partition and keeps its order. Consumer groups track a
//! committed next-offset per partition; [`SqliteLog::fetch`] always returns the
//! record at that position, which makes uncommitted records reappear.

use std::path::Path;

use chrono::Utc;
use rusqlite::OptionalExtension as _;
use sha2::{Digest, Sha256};

use triage_core::log::{Delivery, EventSink, EventSource, OffsetToken};

use crate::{Error, Result, encode::encode_dt, schema::LOG_SCHEMA};

/// Stable partition assignment for `key`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
  let digest = Sha256::digest(key.as_bytes());
  let mut prefix = [0u8; 8];
  prefix.copy_from_slice(&digest[..8]);
  (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

fn to_i64(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }

fn to_u64(value: i64) -> u64 { u64::try_from(value).unwrap_or(0) }

// ─── Log ─────────────────────────────────────────────────────────────────────

/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteLog {
  conn: tokio_rusqlite::Connection,
}

impl SqliteLog {
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let log = Self { conn };
    log.init_schema().await?;
    Ok(log)
  }

  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let log = Self { conn };
    log.init_schema().await?;
    Ok(log)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Create `topic` if it does not exist and return its partition count.
  ///
  /// An existing topic keeps the partition count it was created with.
  pub async fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32> {
    let name = topic.to_owned();
    let requested = partitions.max(1);

    let stored: u32 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO topics (name, partitions) VALUES (?1, ?2)
           ON CONFLICT (name) DO NOTHING",
          rusqlite::params![name, requested],
        )?;
        Ok(conn.query_row(
          "SELECT partitions FROM topics WHERE name = ?1",
          rusqlite::params![name],
          |row| row.get(0),
        )?)
      })
      .await?;

    if stored != requested {
      tracing::warn!(topic, requested, stored, "topic exists with a different partition count");
    }
    Ok(stored)
  }

  pub async fn partitions(&self, topic: &str) -> Result<u32> {
    let name = topic.to_owned();

    let stored: Option<u32> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT partitions FROM topics WHERE name = ?1",
              rusqlite::params![name],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    stored.ok_or_else(|| Error::UnknownTopic(topic.to_owned()))
  }

  /// Append a record to the partition chosen by `key`.
  pub async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<OffsetToken> {
    let partitions = self.partitions(topic).await?;
    let partition  = partition_for(key, partitions);
    let name       = topic.to_owned();
    let key_str    = key.to_owned();
    let at_str     = encode_dt(Utc::now());

    let offset: i64 = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
          "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM log_records
           WHERE topic = ?1 AND partition_no = ?2",
          rusqlite::params![name, partition],
          |row| row.get(0),
        )?;
        tx.execute(
          "INSERT INTO log_records (topic, partition_no, log_offset, record_key, payload, appended_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          rusqlite::params![name, partition, next, key_str, payload, at_str],
        )?;
        tx.commit()?;
        Ok(next)
      })
      .await?;

    Ok(OffsetToken { topic: topic.to_owned(), partition, offset: to_u64(offset) })
  }

  /// The record at the group's committed position on `partition`, if any.
  pub async fn fetch(&self, group: &str, topic: &str, partition: u32) -> Result<Option<Delivery>> {
    let group_id = group.to_owned();
    let name     = topic.to_owned();

    let row: Option<(i64, Option<String>, Vec<u8>)> = self
      .conn
      .call(move |conn| {
        let next: i64 = conn
          .query_row(
            "SELECT next_offset FROM consumer_offsets
             WHERE group_id = ?1 AND topic = ?2 AND partition_no = ?3",
            rusqlite::params![group_id, name, partition],
            |row| row.get(0),
          )
          .optional()?
          .unwrap_or(0);

        Ok(
          conn
            .query_row(
              "SELECT log_offset, record_key, payload FROM log_records
               WHERE topic = ?1 AND partition_no = ?2 AND log_offset >= ?3
               ORDER BY log_offset ASC
               LIMIT 1",
              rusqlite::params![name, partition, next],
              |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?,
        )
      })
      .await?;

    Ok(row.map(|(offset, key, payload)| Delivery {
      token: OffsetToken { topic: topic.to_owned(), partition, offset: to_u64(offset) },
      key,
      payload,
    }))
  }

  /// Move the group's position past `token`. Never moves backwards.
  pub async fn commit(&self, group: &str, token: &OffsetToken) -> Result<()> {
    let group_id  = group.to_owned();
    let name      = token.topic.clone();
    let partition = token.partition;
    let next      = to_i64(token.offset).saturating_add(1);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO consumer_offsets (group_id, topic, partition_no, next_offset)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (group_id, topic, partition_no) DO UPDATE SET
             next_offset = MAX(next_offset, excluded.next_offset)",
          rusqlite::params![group_id, name, partition, next],
        )?;
        Ok(())
      })
      .await?;

    Ok(())
  }

  /// The group's committed next-offset on `partition`.
  pub async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<u64> {
    let group_id = group.to_owned();
    let name     = topic.to_owned();

    let next: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT next_offset FROM consumer_offsets
               WHERE group_id = ?1 AND topic = ?2 AND partition_no = ?3",
              rusqlite::params![group_id, name, partition],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    Ok(next.map(to_u64).unwrap_or(0))
  }

  /// Read up to `limit` records from `partition` starting at `from`,
  /// independent of any consumer group.
  pub async fn read(
    &self,
    topic: &str,
    partition: u32,
    from: u64,
    limit: usize,
  ) -> Result<Vec<Delivery>> {
    let partitions = self.partitions(topic).await?;
    if partition >= partitions {
      return Err(Error::InvalidPartition { topic: topic.to_owned(), partition });
    }

    let name      = topic.to_owned();
    let from_i64  = to_i64(from);
    let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);

    let rows: Vec<(i64, Option<String>, Vec<u8>)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT log_offset, record_key, payload FROM log_records
           WHERE topic = ?1 AND partition_no = ?2 AND log_offset >= ?3
           ORDER BY log_offset ASC
           LIMIT ?4",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![name, partition, from_i64, limit_i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(
      rows
        .into_iter()
        .map(|(offset, key, payload)| Delivery {
          token: OffsetToken { topic: topic.to_owned(), partition, offset: to_u64(offset) },
          key,
          payload,
        })
        .collect(),
    )
  }

  /// A consumer for `topic` in consumer group `group`.
  pub async fn consumer(&self, group: &str, topic: &str) -> Result<LogConsumer> {
    let partitions = self.partitions(topic).await?;
    Ok(LogConsumer {
      log: self.clone(),
      group: group.to_owned(),
      topic: topic.to_owned(),
      partitions,
    })
  }

  pub fn producer(&self, topic: &str) -> LogProducer {
    LogProducer { log: self.clone(), topic: topic.to_owned() }
  }
}

// ─── EventSource / EventSink adapters ────────────────────────────────────────

/// One consumer group's view of one topic.
#[derive(Clone)]
pub struct LogConsumer {
  log:        SqliteLog,
  group:      String,
  topic:      String,
  partitions: u32,
}

impl EventSource for LogConsumer {
  type Error = Error;

  fn partitions(&self) -> u32 { self.partitions }

  async fn next(&self, partition: u32) -> Result<Option<Delivery>> {
    if partition >= self.partitions {
      return Err(Error::InvalidPartition { topic: self.topic.clone(), partition });
    }
    self.log.fetch(&self.group, &self.topic, partition).await
  }

  async fn commit(&self, token: &OffsetToken) -> Result<()> {
    self.log.commit(&self.group, token).await
  }
}

/// Appends to a single topic.
#[derive(Clone)]
pub struct LogProducer {
  log:   SqliteLog,
  topic: String,
}

impl EventSink for LogProducer {
  type Error = Error;

  async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<OffsetToken> {
    self.log.append(&self.topic, key, payload).await
  }
}
