//! Core types for conversation state

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::{DEFAULT_PROMPT, generate_id, now_timestamp};

/// Message kinds the backend emits for text-like frames
pub mod kind {
    pub const TEXT: &str = "text";
    pub const TOOL_CALL: &str = "tool_call";
    pub const INPUT_REQUEST: &str = "input_request";
    pub const TERMINATION: &str = "termination";
    pub const TIMELINE: &str = "timeline";
    pub const PARTICIPANTS: &str = "participants";
}

/// One atomic unit of message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Image reference
    Image { url: String, alt: String },
}

impl ContentPart {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content
    pub fn image(url: impl Into<String>, alt: impl Into<String>) -> Self {
        Self::Image {
            url: url.into(),
            alt: alt.into(),
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Check if this is an image
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

/// A message ready for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ChatMessage {
    /// Create a message with fresh id and timestamp
    pub fn new(kind: impl Into<String>, content: Vec<ContentPart>) -> Self {
        let content = if content.is_empty() {
            vec![ContentPart::text("")]
        } else {
            content
        };
        Self {
            id: generate_id(),
            timestamp: now_timestamp(),
            kind: kind.into(),
            sender: None,
            recipient: None,
            content,
            prompt: None,
            password: None,
            request_id: None,
        }
    }

    /// Create a text message between two participants
    pub fn text(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(kind::TEXT, vec![ContentPart::text(text)]).with_route(sender, recipient)
    }

    /// Set sender and recipient
    pub fn with_route(mut self, sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self.recipient = Some(recipient.into());
        self
    }

    /// Override the id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Get combined text content
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// The single input request currently awaiting a human response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRequest {
    pub request_id: String,
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

impl ActiveRequest {
    /// Build from a message that opened an input request
    pub fn from_message(request_id: impl Into<String>, message: &ChatMessage) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: message
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            password: message.password.unwrap_or(false),
        }
    }
}

pub type TimelineEntry = Value;
pub type CostPoint = Value;
pub type AgentInfo = Value;

/// Execution timeline and cost summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineData {
    pub timeline: Vec<TimelineEntry>,
    pub cost_timeline: Vec<CostPoint>,
    pub summary: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub agents: Vec<AgentInfo>,
}

/// A conversation participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(rename = "isUser", default)]
    pub is_user: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_user,
        }
    }
}
