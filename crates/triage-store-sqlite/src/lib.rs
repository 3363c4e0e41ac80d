//! SQLite backends for the Triage pipeline: the ticket store (dedup ledger,
//! ticket records, knowledge-base chunks) and a partitioned event log.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime.

mod encode;
mod schema;

pub mod error;
pub mod log;
pub mod store;

pub use error::{Error, Result};
pub use log::{LogConsumer, LogProducer, SqliteLog};
pub use store::{NewChunk, NewDocument, SqliteStore};
