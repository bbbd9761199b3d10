//! Prompt construction
//!
//! Turns a text-enhancement request into the instruction prompt the model
//! sees, and wraps it in the model's chat template.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Message, Role};

/// Default system prompt for EXAONE models
pub const EXAONE_SYSTEM_PROMPT: &str = "You are EXAONE model from LG AI Research, a helpful assistant.";

/// How the input text should be rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementMode {
    Formalize,
    Persuade,
    Simplify,
}

impl EnhancementMode {
    pub const ALL: [EnhancementMode; 3] = [
        EnhancementMode::Formalize,
        EnhancementMode::Persuade,
        EnhancementMode::Simplify,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            EnhancementMode::Formalize => "Formalize",
            EnhancementMode::Persuade => "Persuade",
            EnhancementMode::Simplify => "Simplify",
        }
    }

    /// The task line given to the model
    pub fn instruction(&self) -> &'static str {
        match self {
            EnhancementMode::Formalize => {
                "Make the text more formal without introducing any new information."
            }
            EnhancementMode::Persuade => {
                "Make the text sound more confident and persuasive, without exaggeration or adding information."
            }
            EnhancementMode::Simplify => "Rewrite the text in simpler words, without adding anything new.",
        }
    }

    /// Builds the rewrite prompt. `extra_context` is included only when not blank.
    pub fn to_prompt(&self, text: &str, extra_context: Option<&str>) -> String {
        let mut prompt = String::new();
        if let Some(context) = extra_context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str("Context: ");
            prompt.push_str(context);
            prompt.push('\n');
        }
        prompt.push_str("Task: ");
        prompt.push_str(self.instruction());
        prompt.push_str("\nText: ");
        prompt.push_str(text);
        prompt.push_str("\nRewrite: ");
        prompt
    }
}

impl fmt::Display for EnhancementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for EnhancementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.display_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown enhancement mode '{s}' (expected formalize, persuade or simplify)"))
    }
}

/// Chat formatting applied around the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|role|>content` lines closed by an open assistant turn
    Exaone { system_prompt: String },
    /// Prompt passed through untouched
    Plain,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        ChatTemplate::Exaone {
            system_prompt: EXAONE_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ChatTemplate {
    pub fn exaone(system_prompt: impl Into<String>) -> Self {
        ChatTemplate::Exaone {
            system_prompt: system_prompt.into(),
        }
    }

    /// Wraps a single user prompt
    pub fn apply(&self, prompt: &str) -> String {
        self.render(&[Message::user(prompt)])
    }

    /// Renders a conversation, ending with the assistant's turn
    pub fn render(&self, messages: &[Message]) -> String {
        match self {
            ChatTemplate::Plain => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            ChatTemplate::Exaone { system_prompt } => {
                let mut out = String::new();
                let has_system = messages.iter().any(|m| m.role == Role::System);
                if !has_system && !system_prompt.is_empty() {
                    push_turn(&mut out, Role::System, system_prompt);
                }
                for message in messages {
                    push_turn(&mut out, message.role, &message.content);
                }
                out.push_str("<|assistant|>");
                out
            }
        }
    }
}

fn push_turn(out: &mut String, role: Role, content: &str) {
    out.push_str("<|");
    out.push_str(role.as_str());
    out.push_str("|>");
    out.push_str(content);
    out.push('\n');
}
