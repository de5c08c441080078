//! Vision chat service
//!
//! A chat turn is a system prompt, the recent conversation, and one user
//! message made of text plus an optional photo.

mod openai;

pub use openai::{OPENAI_CHAT_URL, OpenAiChatClient};

use async_trait::async_trait;

use crate::Result;
use crate::history::Message;

/// One request to the vision chat service
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    /// JPEG bytes, if a photo accompanies the prompt
    pub image: Option<&'a [u8]>,
    pub history: &'a [Message],
}

/// Chat completion with optional image input
#[async_trait]
pub trait VisionChatService: Send + Sync {
    /// Return the assistant's reply
    ///
    /// # Errors
    ///
    /// Returns `Error::Chat` or a transport error if the service fails
    async fn complete(&self, request: ChatRequest<'_>) -> Result<String>;
}
