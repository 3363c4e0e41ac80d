//! Exponential backoff with jitter.
//!
//! Each retry budget in the pipeline (transient provider errors, persistence,
//! publishing) owns its own [`Backoff`]; the loops that use them live next to
//! the operation they retry.

use std::time::Duration;

use rand_core::{OsRng, RngCore as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub base:         Duration,
  pub max:          Duration,
  /// Total attempts, including the first.
  pub max_attempts: u32,
}

impl Backoff {
  pub const fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
    Self { base, max, max_attempts }
  }

  /// Whether another attempt is allowed after `attempt` attempts have failed.
  pub fn can_retry(&self, attempt: u32) -> bool { attempt < self.max_attempts }

  /// Delay before the retry that follows failed attempt number `attempt`
  /// (1-based).
  ///
  /// The exponential ceiling is `base * 2^(attempt-1)` capped at `max`; the
  /// actual delay is drawn uniformly from its upper half. A server-supplied
  /// `retry_after` is a lower bound.
  pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let ceiling = self.base.saturating_mul(1 << shift).min(self.max);

    let half = ceiling / 2;
    let span = u64::try_from(half.as_nanos()).unwrap_or(u64::MAX);
    let jitter = if span == 0 {
      Duration::ZERO
    } else {
      Duration::from_nanos(OsRng.next_u64() % span.saturating_add(1))
    };

    let delay = (ceiling - half) + jitter;
    match retry_after {
      Some(hint) => delay.max(hint),
      None => delay,
    }
  }
}
