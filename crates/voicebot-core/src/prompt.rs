//! Persona and prompt rendering

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_PERSONA_NAME: &str = "Assistant";

pub const DEFAULT_PERSONA_INSTRUCTION: &str = "You are a friendly voice assistant. \
You enjoy problem-solving, explaining technical ideas in plain words and chatting about everyday topics. \
Your replies are read aloud, so avoid markdown, lists and code blocks. \
Respond casually like chatting with a friend, 2-3 sentences max.";

/// The fixed identity prepended to every user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    /// Speaker label the model answers as
    pub name: String,
    pub instruction: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: DEFAULT_PERSONA_NAME.to_string(),
            instruction: DEFAULT_PERSONA_INSTRUCTION.to_string(),
        }
    }
}

impl Persona {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
        }
    }

    /// Render the instruction and the message as a two-turn exchange ending
    /// on the persona's own turn, so the model continues as the persona.
    pub fn render(&self, message: &str) -> String {
        let mut prompt = String::with_capacity(
            self.instruction.len() + message.len() + self.name.len() + 16,
        );
        if !self.instruction.is_empty() {
            prompt.push_str(&self.instruction);
            prompt.push_str("\n\n");
        }
        prompt.push_str("User: ");
        prompt.push_str(message);
        prompt.push('\n');
        prompt.push_str(&self.name);
        prompt.push(':');

        debug!("Rendered prompt ({} chars)", prompt.len());

        prompt
    }
}
