//! Conversation history
//!
//! The history is an ordered list of role-tagged messages. It lives in memory
//! behind the coordinator's turn lock and is flushed to a [`HistoryStore`]
//! after every completed turn. A failed flush keeps the in-memory copy marked
//! dirty so the next flush writes the accumulated conversation.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat-completion APIs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conversation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Durable storage for the conversation
pub trait HistoryStore: Send + Sync {
    /// Load the stored conversation, empty if nothing was stored yet
    ///
    /// # Errors
    ///
    /// Returns error if the backing store exists but cannot be read
    fn load(&self) -> Result<Vec<Message>>;

    /// Replace the stored conversation with `messages`
    ///
    /// Must create the backing store on first use.
    ///
    /// # Errors
    ///
    /// Returns error if the conversation cannot be written
    fn save(&self, messages: &[Message]) -> Result<()>;
}

/// In-memory conversation with flush tracking
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<Message>,
    dirty: bool,
}

impl ChatHistory {
    /// Wrap already-persisted messages
    #[must_use]
    pub const fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            dirty: false,
        }
    }

    /// Load the conversation from a store
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn load(store: &dyn HistoryStore) -> Result<Self> {
        let messages = store.load()?;
        tracing::debug!(messages = messages.len(), "chat history loaded");
        Ok(Self::new(messages))
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The last `window` messages, oldest first
    #[must_use]
    pub fn recent(&self, window: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether there are appended messages not yet written to the store
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Append one user/assistant exchange
    ///
    /// Both messages go in together; there is no way to append half a pair.
    pub fn push_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.messages.push(Message::user(user));
        self.messages.push(Message::assistant(assistant));
        self.dirty = true;
    }

    /// Write the conversation to the store if it has unsaved messages
    ///
    /// On failure the in-memory messages are kept and stay dirty.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write
    pub fn flush(&mut self, store: &dyn HistoryStore) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        store.save(&self.messages)?;
        self.dirty = false;
        tracing::debug!(messages = self.messages.len(), "chat history flushed");
        Ok(())
    }

    /// Append an exchange and flush it
    ///
    /// # Errors
    ///
    /// Returns error if the flush fails; the exchange is still kept in memory
    pub fn append_and_save(
        &mut self,
        store: &dyn HistoryStore,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) -> Result<()> {
        self.push_exchange(user, assistant);
        self.flush(store)
    }

    /// Drop every message; the next flush writes an empty conversation
    pub fn clear(&mut self) {
        self.messages.clear();
        self.dirty = true;
    }
}

/// JSON file store (`[{"role": "user", "content": "..."}, ...]`)
#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    path: PathBuf,
}

impl JsonHistoryStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonHistoryStore {
    fn load(&self) -> Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Persistence(format!("failed to read {}: {e}", self.path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            Error::Persistence(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    fn save(&self, messages: &[Message]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Persistence(format!("failed to create {}: {e}", dir.display())))?;

        // Write to a sibling temp file and rename so an interrupted write
        // never leaves a truncated history behind
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| Error::Persistence(format!("failed to create temp file: {e}")))?;
        serde_json::to_writer_pretty(&mut tmp, messages)?;
        tmp.flush()
            .map_err(|e| Error::Persistence(format!("failed to write history: {e}")))?;
        tmp.persist(&self.path).map_err(|e| {
            Error::Persistence(format!("failed to replace {}: {e}", self.path.display()))
        })?;

        Ok(())
    }
}
