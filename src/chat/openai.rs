//! OpenAI-compatible chat completions client

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatRequest, VisionChatService};
use crate::{Error, Result};

/// Default endpoint
pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Per-request bound; vision replies can be slow
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat client for any OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiChatClient {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiChatClient {
    /// Create a new chat client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("API key required for chat".to_string()));
        }

        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            url: OPENAI_CHAT_URL.to_string(),
            api_key,
            model,
            max_tokens: None,
        })
    }

    /// Point the client at another OpenAI-compatible endpoint
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Cap the reply length
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn build_request(&self, request: &ChatRequest<'_>) -> CompletionRequest {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(WireMessage {
            role: "system",
            content: WireContent::Text(request.system_prompt.to_string()),
        });
        messages.extend(request.history.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: WireContent::Text(m.content.clone()),
        }));

        let mut parts = vec![ContentPart::Text {
            text: request.user_prompt.to_string(),
        }];
        if let Some(image) = request.image {
            let data = base64::engine::general_purpose::STANDARD.encode(image);
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{data}"),
                },
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: WireContent::Parts(parts),
        });

        CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl VisionChatService for OpenAiChatClient {
    async fn complete(&self, request: ChatRequest<'_>) -> Result<String> {
        let body = self.build_request(&request);

        tracing::debug!(
            model = %self.model,
            history = request.history.len(),
            has_image = request.image.is_some(),
            "sending chat request"
        );

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Chat(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Chat(format!("API error {status}: {body}")));
        }

        let result: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Chat(format!("failed to parse response: {e}")))?;

        let reply = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Chat("response contained no reply".to_string()))?;

        tracing::debug!(reply_len = reply.len(), "chat reply received");
        Ok(reply)
    }
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
