use serde::{Deserialize, Serialize};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
///
/// `content` is forwarded upstream untouched: either a plain string or an
/// array of content parts (text, image_url, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: serde_json::Value,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: serde_json::Value::String(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: serde_json::Value::String(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: serde_json::Value::String(content.into()),
        }
    }
}

/// Everything sent upstream for one chat request: the system instruction
/// plus the prior conversation, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationPayload {
    pub system: String,
    pub messages: Vec<Message>,
}

impl ConversationPayload {
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
        }
    }

    /// Messages in wire order, system instruction first.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system.trim().is_empty() {
            out.push(Message::system(self.system.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}
