//! The Triage enrichment service.
//!
//! Consumes ticket events from a partitioned log, grounds them in the
//! knowledge base, asks a generative model for a structured classification,
//! and commits the result exactly once per event before publishing it.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod respond;
pub mod retrieve;
pub mod retry;
pub mod validate;

pub use error::{Error, Failure, Result};
pub use pipeline::{Collaborators, Outcome, Pipeline};
