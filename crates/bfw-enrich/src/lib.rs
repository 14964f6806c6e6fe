//! AI content generation for brands: description + dish recommendations.
//!
//! Responses must be strict JSON after fence stripping; the first sentence
//! of the description is screened against a banned-phrase blocklist. Any
//! violation or parse failure is retried exactly once, then surfaced as an
//! item-level failure for the batch loop to count.

use async_trait::async_trait;
use bfw_core::BrandContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "bfw-enrich";

pub const DEFAULT_MODEL: &str = "claude-haiku-4-5";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Stock marketing filler the site refuses to publish.
pub const DEFAULT_BANNED_PHRASES: &[&str] = &[
    "nestled in",
    "hidden gem",
    "culinary journey",
    "culinary adventure",
    "tantalize",
    "a testament to",
    "look no further",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub description: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("api status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("response missing required field `{0}`")]
    MissingField(&'static str),
    #[error("banned phrase {phrase:?} in opening sentence")]
    BannedPhrase { phrase: String },
    #[error("empty completion from model")]
    EmptyCompletion,
}

impl EnrichError {
    /// Violations worth one more attempt: bad JSON and policy failures.
    /// Transport/API errors go through the fetch-level backoff instead.
    fn retryable_once(&self) -> bool {
        matches!(
            self,
            EnrichError::InvalidJson(_)
                | EnrichError::MissingField(_)
                | EnrichError::BannedPhrase { .. }
                | EnrichError::EmptyCompletion
        )
    }
}

/// Seam for the completion call so validation and retry logic test
/// without network access.
#[async_trait]
pub trait ContentModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, EnrichError>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Anthropic Messages API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 1024,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ContentModel for AnthropicClient {
    async fn complete(&self, prompt: &str) -> Result<String, EnrichError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EnrichError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = resp.json().await?;
        let text = parsed
            .content
            .first()
            .map(|b| b.text.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(EnrichError::EmptyCompletion);
        }
        Ok(text)
    }
}

/// Strip a Markdown code fence (```json ... ```), when present, leaving
/// the inner payload.
pub fn strip_json_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn first_sentence(text: &str) -> &str {
    match text.find(['.', '!', '?']) {
        Some(idx) => &text[..=idx.min(text.len() - 1)],
        None => text,
    }
}

pub struct Enricher {
    model: Box<dyn ContentModel>,
    banned_phrases: Vec<String>,
}

impl Enricher {
    pub fn new(model: Box<dyn ContentModel>) -> Self {
        Self {
            model,
            banned_phrases: DEFAULT_BANNED_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_banned_phrases(mut self, phrases: Vec<String>) -> Self {
        self.banned_phrases = phrases;
        self
    }

    pub fn build_prompt(&self, ctx: &BrandContext) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "Write content for a Singapore restaurant directory page. Respond with only a JSON \
             object: {\"description\": string, \"recommendations\": [string]}. The description \
             is 2-3 factual sentences; recommendations name 3-5 dishes from the menu below. \
             Plain, concrete language.\n\n",
        );
        prompt.push_str(&format!("Brand: {}\n", ctx.name));
        if !ctx.cuisines.is_empty() {
            prompt.push_str(&format!("Cuisines: {}\n", ctx.cuisines.join(", ")));
        }
        if !ctx.location_summaries.is_empty() {
            prompt.push_str(&format!("Outlets: {}\n", ctx.location_summaries.join("; ")));
        }
        if !ctx.sample_menu_items.is_empty() {
            prompt.push_str(&format!("Menu items: {}\n", ctx.sample_menu_items.join(", ")));
        }
        prompt
    }

    /// Validate one completion against the schema and the blocklist.
    pub fn validate(&self, raw: &str) -> Result<GeneratedContent, EnrichError> {
        let payload = strip_json_fences(raw);
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| EnrichError::InvalidJson(e.to_string()))?;

        let description = value
            .get("description")
            .and_then(|d| d.as_str())
            .filter(|d| !d.trim().is_empty())
            .ok_or(EnrichError::MissingField("description"))?
            .trim()
            .to_string();
        let recommendations = value
            .get("recommendations")
            .and_then(|r| r.as_array())
            .ok_or(EnrichError::MissingField("recommendations"))?
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if recommendations.is_empty() {
            return Err(EnrichError::MissingField("recommendations"));
        }

        let opening = first_sentence(&description).to_ascii_lowercase();
        for phrase in &self.banned_phrases {
            if opening.contains(&phrase.to_ascii_lowercase()) {
                return Err(EnrichError::BannedPhrase {
                    phrase: phrase.clone(),
                });
            }
        }

        Ok(GeneratedContent {
            description,
            recommendations,
        })
    }

    /// Generate content for one brand. Parse/policy failures get exactly
    /// one retry; the second failure is the caller's to log and count.
    pub async fn generate(&self, ctx: &BrandContext) -> Result<GeneratedContent, EnrichError> {
        let prompt = self.build_prompt(ctx);
        let raw = self.model.complete(&prompt).await?;
        match self.validate(&raw) {
            Ok(content) => Ok(content),
            Err(err) if err.retryable_once() => {
                warn!(brand = %ctx.slug, %err, "first completion rejected, retrying once");
                let raw = self.model.complete(&prompt).await?;
                self.validate(&raw)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ctx() -> BrandContext {
        BrandContext {
            slug: "old-chang-kee".into(),
            name: "Old Chang Kee".into(),
            cuisines: vec!["Local".into(), "Snacks".into()],
            location_summaries: vec!["313 Somerset, #B3-01".into()],
            sample_menu_items: vec!["Curry'O".into(), "Sardine Puff".into()],
        }
    }

    struct ScriptedModel {
        responses: Mutex<Vec<&'static str>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<&'static str>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ContentModel for ScriptedModel {
        async fn complete(&self, _prompt: &str) -> Result<String, EnrichError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(EnrichError::EmptyCompletion);
            }
            Ok(responses.remove(0).to_string())
        }
    }

    #[async_trait]
    impl ContentModel for std::sync::Arc<ScriptedModel> {
        async fn complete(&self, prompt: &str) -> Result<String, EnrichError> {
            self.as_ref().complete(prompt).await
        }
    }

    const GOOD: &str = r#"{"description":"Old Chang Kee sells curry puffs and fried snacks across Singapore malls. Most outlets are takeaway kiosks.","recommendations":["Curry'O","Sardine Puff","Chicken Wing"]}"#;

    #[test]
    fn fence_stripping_handles_json_fences() {
        assert_eq!(strip_json_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn fenced_valid_response_parses() {
        let model = ScriptedModel::new(vec![]);
        let enricher = Enricher::new(Box::new(model));
        let fenced = format!("```json\n{GOOD}\n```");
        let content = enricher.validate(&fenced).unwrap();
        assert!(content.description.starts_with("Old Chang Kee"));
        assert_eq!(content.recommendations.len(), 3);
    }

    #[tokio::test]
    async fn banned_opening_is_retried_once_then_succeeds() {
        let bad = r#"{"description":"A hidden gem nestled in Somerset. Good puffs.","recommendations":["Curry'O"]}"#;
        let model = std::sync::Arc::new(ScriptedModel::new(vec![bad, GOOD]));
        let enricher = Enricher::new(Box::new(model.clone()));
        let content = enricher.generate(&ctx()).await.unwrap();
        assert!(content.description.starts_with("Old Chang Kee"));
        // Two completions: the rejected one and the retry.
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn second_violation_surfaces_the_failure() {
        let bad = r#"{"description":"A culinary journey awaits. Puffs.","recommendations":["Curry'O"]}"#;
        let enricher = Enricher::new(Box::new(ScriptedModel::new(vec![bad, bad])));
        let err = enricher.generate(&ctx()).await.unwrap_err();
        assert!(matches!(err, EnrichError::BannedPhrase { .. }));
    }

    #[tokio::test]
    async fn malformed_json_is_retried_once() {
        let enricher = Enricher::new(Box::new(ScriptedModel::new(vec!["not json", GOOD])));
        let content = enricher.generate(&ctx()).await.unwrap();
        assert_eq!(content.recommendations.len(), 3);
    }

    #[tokio::test]
    async fn missing_recommendations_is_a_schema_failure() {
        let no_recs = r#"{"description":"Fine puffs."}"#;
        let enricher = Enricher::new(Box::new(ScriptedModel::new(vec![no_recs, no_recs])));
        let err = enricher.generate(&ctx()).await.unwrap_err();
        assert!(matches!(err, EnrichError::MissingField("recommendations")));
    }

    #[test]
    fn banned_phrase_only_checked_in_first_sentence() {
        let enricher = Enricher::new(Box::new(ScriptedModel::new(vec![])));
        let later = r#"{"description":"Old Chang Kee sells puffs. It is a hidden gem.","recommendations":["Curry'O"]}"#;
        assert!(enricher.validate(later).is_ok());
    }
}
