use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::config::LlmConfig;
use crate::pipeline::{Rewriter, BEGIN_DELIMITER, END_DELIMITER};

/// Instructions sent with every rewrite request. The collaborator must return
/// the complete artifact, not a diff.
const SYSTEM_INSTRUCTIONS: &str = "You are rewriting the full source artifact of a \
self-modifying network agent. Rules: \
1. Always return the COMPLETE artifact source, never a fragment or a diff. \
2. Keep every existing capability: the command handling, the state store, the \
rewrite pipeline and the session server must survive the rewrite. \
3. Add the requested behavior as a natural extension of the existing code. \
4. If the current artifact carries #[BEGIN] and #[END] delimiters, preserve \
them and place the whole artifact between them. \
5. Keep the existing formatting and comments. \
6. Return only source code, with no commentary outside a code block.";

/// Errors from the rewrite collaborator boundary.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rewrite API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed rewrite response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("rewrite response contained no text content")]
    EmptyResponse,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// Client for the external rewrite collaborator, an Anthropic-compatible
/// messages API. The HTTP client carries a hard timeout so a stuck rewrite
/// call always resolves to a failure instead of blocking its session forever.
pub struct RewriteClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl RewriteClient {
    pub fn new(config: &LlmConfig, api_key: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .expect("failed to create HTTP client"),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        info!(
            model = %self.model,
            prompt_length = prompt.len(),
            "sending rewrite request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .and_then(|err| err.error.and_then(|e| e.message))
                .unwrap_or(body);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat_response: ChatResponse = serde_json::from_str(&body)?;

        let content = chat_response
            .content
            .iter()
            .filter_map(|block| {
                if block.content_type == "text" {
                    block.text.clone()
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        if let Some(usage) = chat_response.usage {
            info!(
                model = %self.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "rewrite response received"
            );
        }

        Ok(content)
    }
}

#[async_trait]
impl Rewriter for RewriteClient {
    async fn rewrite(&self, current: &str, request: &str) -> Result<String, LlmError> {
        let prompt = format!(
            "User request: {request}\n\n\
             Current artifact:\n{BEGIN_DELIMITER}\n{current}\n{END_DELIMITER}\n\n\
             Rewrite the artifact to satisfy the request while keeping every \
             existing capability. Return the complete result between the \
             {BEGIN_DELIMITER} and {END_DELIMITER} delimiters."
        );
        self.complete(SYSTEM_INSTRUCTIONS, &prompt).await
    }
}
