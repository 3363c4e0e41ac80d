//! Drives the generative model until it produces a reply that passes the
//! validation gate.
//!
//! Two independent budgets apply. A reply that fails validation is retried
//! with corrective feedback up to `schema_attempts` times. A transient
//! provider failure is retried with plain backoff inside a single schema
//! attempt and does not consume schema attempts.

use std::time::Duration;

use tracing::{debug, warn};
use triage_core::{
  dead_letter::FailureKind,
  enrichment::EnrichedFields,
  provider::{Generator, ModelRequest, ProviderError},
  ticket::TicketEvent,
};

use crate::{
  Failure,
  prompt::PromptBuilder,
  retrieve::RetrievedContext,
  retry::Backoff,
  validate::{ResponseValidator, Validation},
};

#[derive(Debug, Clone)]
pub struct ResponseBuilder {
  pub prompt:          PromptBuilder,
  pub validator:       ResponseValidator,
  pub schema_attempts: u32,
  pub transient:       Backoff,
  /// Upper bound on a single provider call.
  pub call_timeout:    Duration,
}

impl ResponseBuilder {
  /// Produce validated fields for `ticket` or the failure to dead-letter.
  pub async fn enrich<Ge: Generator>(
    &self,
    generator: &Ge,
    ticket: &TicketEvent,
    context: &RetrievedContext,
  ) -> Result<EnrichedFields, Failure> {
    let attempts = self.schema_attempts.max(1);
    let mut feedback: Option<String> = None;
    let mut last_raw = String::new();

    for attempt in 1..=attempts {
      let request = self.prompt.build(ticket, context, feedback.as_deref());
      let raw = self.generate(generator, &request).await?;

      match self.validator.validate(&raw, context) {
        Validation::Valid(fields) => {
          debug!(
            event_id = %ticket.event_id,
            attempt,
            category = fields.category.as_str(),
            citations = fields.citations.len(),
            "model reply accepted"
          );
          return Ok(fields);
        }
        Validation::Invalid(reason) => {
          warn!(event_id = %ticket.event_id, attempt, %reason, "model reply rejected");
          feedback = Some(reason);
          last_raw = raw;
        }
      }
    }

    let reason = feedback.unwrap_or_default();
    Err(
      Failure::new(
        FailureKind::SchemaViolationError,
        format!("model reply failed validation: {reason}"),
        attempts,
      )
      .with_response(last_raw),
    )
  }

  /// One logical model call, retried with backoff on transient errors.
  async fn generate<Ge: Generator>(
    &self,
    generator: &Ge,
    request: &ModelRequest,
  ) -> Result<String, Failure> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      let result = match tokio::time::timeout(self.call_timeout, generator.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout),
      };

      let error = match result {
        Ok(text) => return Ok(text),
        Err(error) => error,
      };

      if !error.is_transient() {
        return Err(Failure::new(FailureKind::ProviderError, error.to_string(), attempt));
      }
      if !self.transient.can_retry(attempt) {
        return Err(Failure::new(
          FailureKind::TransientProviderError,
          error.to_string(),
          attempt,
        ));
      }

      let delay = self.transient.delay(attempt, error.retry_after());
      warn!(
        provider = generator.name(),
        attempt,
        delay_ms = delay.as_millis() as u64,
        %error,
        "transient provider error; backing off"
      );
      tokio::time::sleep(delay).await;
    }
  }
}
