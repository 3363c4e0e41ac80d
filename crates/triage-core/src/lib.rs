//! Core types and trait definitions for the Triage enrichment pipeline.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! Storage backends, log transports and model providers implement the traits
//! defined here; the pipeline depends only on those abstractions.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod dead_letter;
pub mod enrichment;
pub mod error;
pub mod kb;
pub mod log;
pub mod provider;
pub mod record;
pub mod store;
pub mod ticket;

pub use error::{Error, Result};
