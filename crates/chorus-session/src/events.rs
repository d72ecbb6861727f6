//! Conversation change notifications

use chorus_wire::{ActiveRequest, ChatMessage, Participant, TimelineData};
use serde::{Deserialize, Serialize};

use crate::conversation::ErrorInfo;

/// Events published whenever the conversation state changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// A message was appended
    MessageAdded { message: ChatMessage },

    /// A message was removed
    MessageRemoved { id: String },

    /// All messages were removed
    MessagesCleared,

    /// The message list was replaced wholesale
    MessagesReplaced { messages: Vec<ChatMessage> },

    /// The outstanding input request changed
    ActiveRequestChanged { request: Option<ActiveRequest> },

    /// The execution timeline was replaced
    TimelineUpdated { timeline: Option<TimelineData> },

    /// The user roster was replaced
    ParticipantsUpdated { participants: Vec<Participant> },

    /// The workflow started or stopped executing
    ActiveChanged { active: bool },

    /// Visibility changed
    ShowChanged { show: bool },

    /// The advisory error was set or cleared
    ErrorChanged { error: Option<ErrorInfo> },

    /// A frame of a kind the normalizer does not know, passed through
    Unrecognized {
        kind: String,
        payload: serde_json::Value,
    },

    /// The conversation was restored to its initial configuration
    Reset,
}

impl ConversationEvent {
    /// Check if this event marks the end of the workflow
    pub fn is_workflow_end(&self) -> bool {
        matches!(self, ConversationEvent::ActiveChanged { active: false })
    }
}
