//! Model request composition.

use triage_core::{
  enrichment::{Category, Sentiment},
  provider::ModelRequest,
  ticket::TicketEvent,
};

use crate::retrieve::RetrievedContext;

/// The JSON shape the model must return.
pub const OUTPUT_SCHEMA: &str = r#"{
  "summary": string,           // one or two sentences, non-empty
  "category": string,          // one of the allowed categories
  "sentiment": string,         // one of the allowed sentiments
  "risk": number,              // 0.0 (routine) to 1.0 (urgent / high impact)
  "suggested_reply": string,   // non-empty
  "citations": [number]        // chunk ids from KB Context that support the reply
}"#;

#[derive(Debug, Clone)]
pub struct PromptBuilder {
  pub max_tokens:      u32,
  pub reply_max_words: usize,
}

impl PromptBuilder {
  pub fn new(max_tokens: u32, reply_max_words: usize) -> Self {
    Self { max_tokens, reply_max_words }
  }

  /// Build the request for `ticket`. `feedback` is the reason the previous
  /// reply was rejected, if any.
  pub fn build(
    &self,
    ticket: &TicketEvent,
    context: &RetrievedContext,
    feedback: Option<&str>,
  ) -> ModelRequest {
    ModelRequest {
      system:     self.system(context),
      user:       self.user(ticket, feedback),
      max_tokens: self.max_tokens,
    }
  }

  fn system(&self, context: &RetrievedContext) -> String {
    let categories: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
    let sentiments: Vec<&str> = Sentiment::ALL.iter().map(|s| s.as_str()).collect();

    let mut system = format!(
      "You are a support operations assistant. \
       Use ONLY the KB Context when proposing troubleshooting steps or policy statements. \
       If the KB Context does not cover the issue, ask 1-2 clarifying questions and avoid guessing.\n\
       Allowed categories: {categories}.\n\
       Allowed sentiments: {sentiments}.\n\
       Return ONLY a JSON object, with no surrounding prose, of this form:\n{OUTPUT_SCHEMA}\n\
       Suggested reply format: one short acknowledgment, then 2-4 bullet steps, then a next-step ask. \
       Keep suggested_reply under {words} words. \
       Cite chunks by the number in their [chunk:<id>] tag; cite nothing if no chunk applies.",
      categories = categories.join(", "),
      sentiments = sentiments.join(", "),
      words = self.reply_max_words,
    );

    if context.is_empty() {
      system.push_str("\n\nKB Context: none available. Return \"citations\": [].");
    } else {
      system.push_str("\n\nKB Context:");
      for chunk in &context.chunks {
        let heading = chunk.heading_path.as_deref().unwrap_or("");
        system.push_str(&format!(
          "\n\n[chunk:{}] {} | {}\n{}",
          chunk.chunk_id,
          chunk.title,
          heading,
          chunk.content.trim()
        ));
      }
    }
    system
  }

  fn user(&self, ticket: &TicketEvent, feedback: Option<&str>) -> String {
    let fields = serde_json::json!({
      "ticket_id": ticket.ticket_id,
      "subject":   ticket.subject,
      "body":      ticket.body,
      "channel":   ticket.channel.as_str(),
      "priority":  ticket.priority.as_str(),
    });

    let mut user = format!("Ticket:\n{fields}");
    if let Some(reason) = feedback {
      user.push_str(&format!(
        "\n\nYour previous reply was rejected: {reason}. \
         Reply again with ONLY a JSON object matching the required form."
      ));
    }
    user
  }
}
