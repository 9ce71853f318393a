//! Shared chat message data model used across the pipeline.

use serde::{Deserialize, Serialize};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Per-message token overhead the counter charges for encoding the role
    /// tag; used by [`crate::tokens::TokenCounter::count_chat_tokens`]
    /// instead of running the full text estimator over a three-to-nine
    /// character constant. Tool messages carry a tool_call_id alongside the
    /// role tag, so they cost a little more.
    pub fn token_weight(self) -> usize {
        match self {
            Role::System => 1,
            Role::User => 1,
            Role::Assistant => 1,
            Role::Tool => 2,
        }
    }
}

/// A single chat message flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// OpenAI-style named participant; counted as a +1 token surcharge.
    #[serde(default)]
    pub name: Option<String>,
    /// Pinned messages are never evicted by the context fitter.
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            role: Role::User,
            content: String::new(),
            name: None,
            pinned: false,
            priority: None,
            timestamp: None,
        }
    }
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn pin(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Whether the context fitter MUST treat this message as unevictable.
    pub fn is_protected(&self) -> bool {
        self.pinned || matches!(self.role, Role::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_and_pinned_are_protected() {
        assert!(Message::system("you are a bot").is_protected());
        assert!(Message::user("hi").pin().is_protected());
        assert!(!Message::user("hi").is_protected());
    }

    #[test]
    fn tool_role_carries_a_higher_token_weight() {
        assert!(Role::Tool.token_weight() > Role::User.token_weight());
        assert_eq!(Role::System.token_weight(), Role::Assistant.token_weight());
    }
}
