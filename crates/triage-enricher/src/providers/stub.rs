//! A deterministic, offline stand-in for the generative model.
//!
//! Classifies by keyword, cites the first context chunk and always answers
//! with schema-valid JSON. Useful for local runs and end-to-end tests.

use serde_json::Value;
use triage_core::{
  enrichment::{Category, Sentiment},
  provider::{Generator, ModelRequest, ProviderError},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct StubGenerator;

/// Ordered: the first rule whose any keyword appears wins.
const CATEGORY_RULES: &[(Category, &[&str])] = &[
  (Category::SecurityIncident, &["security", "breach", "phishing", "compromised", "suspicious"]),
  (Category::Billing, &["billing", "invoice", "refund", "charge", "payment"]),
  (Category::DataRefresh, &["refresh", "stale", "sync"]),
  (Category::Exports, &["export", "csv", "download"]),
  (Category::FeatureRequest, &["feature", "roadmap", "would love", "suggestion"]),
  (Category::Integration, &["oauth", "api key", "integration", "webhook"]),
  (Category::Notifications, &["alert", "notification", "slack", "email digest"]),
  (Category::AccountAccess, &["login", "log in", "password", "account", "access", "locked", "2fa"]),
  (Category::TechnicalIssue, &["error", "crash", "bug", "broken", "fails", "failing", "timeout"]),
];

const NEGATIVE: &[&str] = &[
  "cannot", "can't", "unable", "invalid", "broken", "angry", "frustrated", "urgent", "error",
  "fail", "still",
];
const POSITIVE: &[&str] = &["thanks", "thank you", "great", "love", "appreciate"];

fn classify(text: &str) -> Category {
  CATEGORY_RULES
    .iter()
    .find(|(_, words)| words.iter().any(|w| text.contains(w)))
    .map(|(category, _)| *category)
    .unwrap_or(Category::General)
}

fn sentiment(text: &str) -> Sentiment {
  if NEGATIVE.iter().any(|w| text.contains(w)) {
    Sentiment::Negative
  } else if POSITIVE.iter().any(|w| text.contains(w)) {
    Sentiment::Positive
  } else {
    Sentiment::Neutral
  }
}

fn risk(category: Category, sentiment: Sentiment, priority: &str) -> f64 {
  let base: f64 = match category {
    Category::SecurityIncident => 0.85,
    Category::AccountAccess | Category::Billing => 0.45,
    Category::TechnicalIssue | Category::Integration | Category::DataRefresh => 0.4,
    _ => 0.2,
  };
  let bump = match priority {
    "critical" => 0.3,
    "high" => 0.15,
    _ => 0.0,
  } + if sentiment == Sentiment::Negative { 0.1 } else { 0.0 };
  (base + bump).min(1.0)
}

/// The ticket object the prompt carries in its user turn.
fn ticket_fields(user: &str) -> Option<Value> {
  let start = user.find('{')?;
  serde_json::Deserializer::from_str(&user[start..])
    .into_iter::<Value>()
    .next()?
    .ok()
}

/// The id in the first numeric `[chunk:<id>]` tag of the system prompt.
fn first_chunk_id(system: &str) -> Option<i64> {
  system.match_indices("[chunk:").find_map(|(at, tag)| {
    let rest = &system[at + tag.len()..];
    rest[..rest.find(']')?].parse().ok()
  })
}

impl Generator for StubGenerator {
  fn name(&self) -> &'static str { "stub" }

  async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
    let ticket = ticket_fields(&request.user).unwrap_or(Value::Null);
    let field = |name: &str| ticket.get(name).and_then(Value::as_str).unwrap_or("").to_owned();
    let subject = field("subject");
    let body = field("body");
    let priority = field("priority");

    let text = format!("{subject} {body}").to_lowercase();
    let category = classify(&text);
    let sentiment = sentiment(&text);

    let summary = if subject.trim().is_empty() {
      "Customer contacted support.".to_owned()
    } else {
      format!("Customer reports: {}.", subject.trim().trim_end_matches('.'))
    };
    let citations: Vec<i64> = first_chunk_id(&request.system).into_iter().collect();
    let reply = format!(
      "Thanks for reaching out about \"{}\". \
       - We are looking into this now. \
       - Please share any error messages or screenshots. \
       Could you confirm when this first started?",
      subject.trim()
    );

    Ok(
      serde_json::json!({
        "summary":         summary,
        "category":        category.as_str(),
        "sentiment":       sentiment.as_str(),
        "risk":            risk(category, sentiment, &priority),
        "suggested_reply": reply,
        "citations":       citations,
      })
      .to_string(),
    )
  }
}
