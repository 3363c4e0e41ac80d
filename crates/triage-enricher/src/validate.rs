//! The validation gate between raw model text and [`EnrichedFields`].
//!
//! Nothing the model returns reaches the store or the output log without
//! passing through [`ResponseValidator::validate`].

use serde_json::{Map, Value};
use triage_core::{
  enrichment::{Category, Citation, EnrichedFields, Sentiment, clamp_risk, trim_reply},
  kb::ChunkId,
};

use crate::retrieve::RetrievedContext;

/// Outcome of checking one model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
  Valid(EnrichedFields),
  /// Human-readable reason, fed back to the model on the next attempt.
  Invalid(String),
}

impl Validation {
  pub fn is_valid(&self) -> bool { matches!(self, Self::Valid(_)) }
}

/// Remove a surrounding markdown code fence, with or without a language tag.
pub fn strip_code_fence(raw: &str) -> &str {
  let text = raw.trim();
  let Some(rest) = text.strip_prefix("```") else {
    return text;
  };
  // Drop the info string (`json`, `JSON`, ...) on the opening line.
  let rest = match rest.find('\n') {
    Some(newline) if !rest[..newline].trim_start().starts_with('{') => &rest[newline + 1..],
    _ => rest,
  };
  rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone)]
pub struct ResponseValidator {
  pub reply_max_words: usize,
}

impl ResponseValidator {
  pub fn new(reply_max_words: usize) -> Self { Self { reply_max_words } }

  pub fn validate(&self, raw: &str, context: &RetrievedContext) -> Validation {
    match self.check(raw, context) {
      Ok(fields) => Validation::Valid(fields),
      Err(reason) => Validation::Invalid(reason),
    }
  }

  fn check(&self, raw: &str, context: &RetrievedContext) -> Result<EnrichedFields, String> {
    let text = strip_code_fence(raw);
    if text.is_empty() {
      return Err("reply was empty".into());
    }
    let value: Value =
      serde_json::from_str(text).map_err(|e| format!("reply is not valid JSON: {e}"))?;
    let object = value
      .as_object()
      .ok_or_else(|| "reply must be a JSON object".to_owned())?;

    let summary = non_empty_string(object, "summary")?;

    let category_label = string_field(object, "category")?;
    let category = Category::from_label(category_label)
      .ok_or_else(|| format!("`category` {category_label:?} is not an allowed category"))?;

    let sentiment_label = string_field(object, "sentiment")?;
    let sentiment = Sentiment::from_label(sentiment_label)
      .ok_or_else(|| format!("`sentiment` {sentiment_label:?} is not an allowed sentiment"))?;

    let risk = object
      .get("risk")
      .ok_or_else(|| "missing field `risk`".to_owned())?
      .as_f64()
      .ok_or_else(|| "`risk` must be a number".to_owned())?;

    let reply = non_empty_string(object, "suggested_reply")?;

    let citations = match object.get("citations") {
      None | Some(Value::Null) => Vec::new(),
      Some(Value::Array(items)) => cited_ids(items)?
        .into_iter()
        .filter_map(|id| context.get(id).map(|chunk| chunk.citation()))
        .collect(),
      Some(_) => return Err("`citations` must be an array of chunk ids".into()),
    };

    Ok(EnrichedFields {
      summary: summary.to_owned(),
      category,
      sentiment,
      risk: clamp_risk(risk),
      suggested_reply: trim_reply(reply, self.reply_max_words),
      citations: dedup(citations),
    })
  }
}

fn string_field<'a>(object: &'a Map<String, Value>, name: &str) -> Result<&'a str, String> {
  object
    .get(name)
    .ok_or_else(|| format!("missing field `{name}`"))?
    .as_str()
    .ok_or_else(|| format!("`{name}` must be a string"))
}

fn non_empty_string<'a>(object: &'a Map<String, Value>, name: &str) -> Result<&'a str, String> {
  let value = string_field(object, name)?.trim();
  if value.is_empty() {
    return Err(format!("`{name}` must not be empty"));
  }
  Ok(value)
}

/// Chunk ids as integers or `{"chunk_id": <integer>}` objects.
fn cited_ids(items: &[Value]) -> Result<Vec<ChunkId>, String> {
  items
    .iter()
    .map(|item| {
      let id = match item {
        Value::Object(o) => o.get("chunk_id"),
        other => Some(other),
      };
      id.and_then(Value::as_i64)
        .ok_or_else(|| format!("citation {item} is not a chunk id"))
    })
    .collect()
}

fn dedup(citations: Vec<Citation>) -> Vec<Citation> {
  let mut seen = std::collections::BTreeSet::new();
  citations.into_iter().filter(|c| seen.insert(c.chunk_id)).collect()
}
