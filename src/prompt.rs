//! Prompt set for the two turn kinds
//!
//! Prompts come from a YAML file with the keys `passive_system_prompt`,
//! `passive_user_prompt`, `active_system_prompt` and `active_user_prompt`.
//! Any key missing from the file keeps its built-in default.

use std::path::Path;

use serde::Deserialize;

use crate::Result;

const DEFAULT_PASSIVE_SYSTEM: &str = "You are Remy, a helpful assistant that can see through the user's camera. \
Answer the user's spoken question using the attached photo when it is relevant. \
Keep answers short and conversational; they will be read aloud.";

const DEFAULT_PASSIVE_USER: &str = "The user asked the following while this photo was taken:";

const DEFAULT_ACTIVE_SYSTEM: &str = "You are Remy, an attentive assistant that periodically looks through the camera. \
Mention anything the user may want to know about, otherwise reply briefly.";

const DEFAULT_ACTIVE_USER: &str = "Here is the latest photo from the camera. What do you notice?";

/// System and user prompts for passive and active turns
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    #[serde(rename = "passive_system_prompt")]
    pub passive_system: String,
    #[serde(rename = "passive_user_prompt")]
    pub passive_user: String,
    #[serde(rename = "active_system_prompt")]
    pub active_system: String,
    #[serde(rename = "active_user_prompt")]
    pub active_user: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            passive_system: DEFAULT_PASSIVE_SYSTEM.to_string(),
            passive_user: DEFAULT_PASSIVE_USER.to_string(),
            active_system: DEFAULT_ACTIVE_SYSTEM.to_string(),
            active_user: DEFAULT_ACTIVE_USER.to_string(),
        }
    }
}

impl PromptSet {
    /// Parse a YAML prompt document
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load prompts from a YAML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let prompts = Self::from_yaml(&content)?;
        tracing::info!(path = %path.display(), "loaded prompts");
        Ok(prompts)
    }

    /// Load prompts from `path` if given, falling back to defaults on any error
    #[must_use]
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match Self::load(path) {
            Ok(prompts) => prompts,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to load prompts, using defaults"
                );
                Self::default()
            }
        }
    }

    /// User prompt for a passive turn: the configured preamble plus what was said
    #[must_use]
    pub fn passive_user_prompt(&self, transcript: &str) -> String {
        if self.passive_user.trim().is_empty() {
            transcript.to_string()
        } else {
            format!("{}\n{transcript}", self.passive_user)
        }
    }
}
