//! Anthropic Messages API client.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use triage_core::provider::{Generator, ModelRequest, ProviderError};

use super::{classify_status, classify_transport};
use crate::{Error, Result, config::ModelConfig};

const API_VERSION: &str = "2023-06-01";

/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct AnthropicGenerator {
  client:   Client,
  base_url: String,
  api_key:  String,
  model:    String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
  model:      &'a str,
  max_tokens: u32,
  system:     &'a str,
  messages:   [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
  role:    &'a str,
  content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
  #[serde(default)]
  content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  text: Option<String>,
}

impl AnthropicGenerator {
  pub fn new(config: &ModelConfig) -> Result<Self> {
    let api_key = config
      .api_key
      .clone()
      .ok_or_else(|| Error::Config("anthropic provider requires an API key".into()))?;
    let client = Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_owned(),
      api_key,
      model: config.model.clone(),
    })
  }
}

impl Generator for AnthropicGenerator {
  fn name(&self) -> &'static str { "anthropic" }

  async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
    let body = MessagesRequest {
      model:      &self.model,
      max_tokens: request.max_tokens,
      system:     &request.system,
      messages:   [Message { role: "user", content: &request.user }],
    };

    let resp = self
      .client
      .post(format!("{}/v1/messages", self.base_url))
      .header("x-api-key", &self.api_key)
      .header("anthropic-version", API_VERSION)
      .json(&body)
      .send()
      .await
      .map_err(classify_transport)?;

    let status = resp.status();
    if !status.is_success() {
      let headers = resp.headers().clone();
      let text = resp.text().await.unwrap_or_default();
      return Err(classify_status(status, &headers, text));
    }

    let parsed: MessagesResponse = resp
      .json()
      .await
      .map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let text: String = parsed
      .content
      .into_iter()
      .filter(|block| block.kind == "text")
      .filter_map(|block| block.text)
      .collect();

    if text.is_empty() {
      return Err(ProviderError::Malformed("response contained no text blocks".into()));
    }
    Ok(text)
  }
}
