//! Fact-extraction port and OpenAI-compatible client
//!
//! The HTTP extractor asks a chat model for a JSON array of short,
//! self-contained facts. Rolling summaries use the same endpoint with a
//! plain-text answer.

use crate::config::{resolve_api_key, ExtractionConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Distills durable facts from a user/assistant exchange.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Candidate fact strings, possibly empty.
    async fn extract(&self, user_message: &str, assistant_message: &str) -> Result<Vec<String>>;

    /// Fold newly stored facts into a rolling summary.
    async fn summarize(&self, previous: Option<&str>, new_facts: &[String]) -> Result<String>;
}

const EXTRACT_PROMPT: &str = "You extract durable facts about the user and their task from one \
chat exchange. Return ONLY a JSON array of short, self-contained statements. Return [] if \
nothing is worth remembering.";

const SUMMARY_PROMPT: &str = "You maintain a short running summary of a conversation. Merge the \
new facts into the previous summary. Answer with the updated summary only, in at most five \
sentences.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// `POST {base_url}/v1/chat/completions`
pub struct HttpFactExtractor {
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_facts: usize,
    http_client: reqwest::Client,
}

impl HttpFactExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: resolve_api_key(config.api_key_env.as_deref()),
            max_facts: config.max_facts,
            http_client: reqwest::Client::new(),
        }
    }

    async fn complete(&self, system: &str, user: String) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let mut req = self.http_client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::Degradable(format!(
                "Extraction API error {}: {}",
                status, body_text
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Degradable("No choices in extraction response".to_string()))
    }
}

/// Parse the model's answer into fact strings.
///
/// Tolerates prose or code fences around the array.
pub fn parse_fact_list(content: &str, max_facts: usize) -> Result<Vec<String>> {
    let start = content.find('[');
    let end = content.rfind(']');
    let slice = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => {
            return Err(Error::Degradable(format!(
                "Extraction answer is not a JSON array: {}",
                content.chars().take(80).collect::<String>()
            )))
        }
    };
    let facts: Vec<serde_json::Value> = serde_json::from_str(slice)
        .map_err(|e| Error::Degradable(format!("Malformed extraction answer: {}", e)))?;
    Ok(facts
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        })
        .take(max_facts)
        .collect())
}

#[async_trait]
impl FactExtractor for HttpFactExtractor {
    async fn extract(&self, user_message: &str, assistant_message: &str) -> Result<Vec<String>> {
        let prompt = format!("User:\n{}\n\nAssistant:\n{}", user_message, assistant_message);
        let content = self.complete(EXTRACT_PROMPT, prompt).await?;
        parse_fact_list(&content, self.max_facts)
    }

    async fn summarize(&self, previous: Option<&str>, new_facts: &[String]) -> Result<String> {
        let facts = new_facts
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Previous summary:\n{}\n\nNew facts:\n{}",
            previous.unwrap_or("(none)"),
            facts
        );
        let content = self.complete(SUMMARY_PROMPT, prompt).await?;
        Ok(content.trim().to_string())
    }
}
