//! Partitioned log abstractions: where ticket events come from and where
//! enriched events and dead letters go.
//!
//! Delivery is at-least-once. A consumer's position only moves when the
//! pipeline calls [`EventSource::commit`]; anything delivered but not committed
//! is delivered again.

use std::future::Future;

use serde::{Deserialize, Serialize};

/// Position of one record within a topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetToken {
  pub topic:     String,
  pub partition: u32,
  pub offset:    u64,
}

/// A record handed to the pipeline together with the token needed to commit
/// it.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub token:   OffsetToken,
  pub key:     Option<String>,
  pub payload: Vec<u8>,
}

/// Ordered-per-partition source of raw ticket events.
pub trait EventSource: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Number of partitions; one worker is run per partition.
  fn partitions(&self) -> u32;

  /// The next uncommitted record on `partition`, or `None` when caught up.
  ///
  /// Calling this twice without a commit in between returns the same record.
  fn next(
    &self,
    partition: u32,
  ) -> impl Future<Output = Result<Option<Delivery>, Self::Error>> + Send + '_;

  /// Advance the consumer position past `token`.
  fn commit<'a>(
    &'a self,
    token: &'a OffsetToken,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Append-only destination log.
pub trait EventSink: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Append `payload` under `key`; records with equal keys keep their order.
  fn publish<'a>(
    &'a self,
    key: &'a str,
    payload: Vec<u8>,
  ) -> impl Future<Output = Result<OffsetToken, Self::Error>> + Send + 'a;
}
