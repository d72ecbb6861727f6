//! Conversation state: messages, the outstanding input request, timeline, roster.

use std::fmt;
use std::sync::Arc;

use chorus_wire::{ActiveRequest, ChatMessage, Participant, TimelineData};
use serde::{Deserialize, Serialize};

/// Error classification exposed to the rendering layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A frame could not be processed
    ProcessingError,
    /// The socket reported a failure
    TransportError,
    /// Set by the caller
    Custom,
}

/// Advisory error shown alongside the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub code: ErrorCode,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// A caught frame-processing failure
    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProcessingError, message)
    }
}

/// A human reply to an input request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub request_id: String,
    pub data: String,
}

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callbacks supplied by the rendering layer
#[derive(Clone, Default)]
pub struct ChatHandlers {
    /// Called after a reply to an input request has been sent
    pub on_user_input: Option<Handler<UserResponse>>,
    /// Called when the conversation is closed
    pub on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ChatHandlers {
    /// Overlay `overrides` on top of these handlers
    pub fn merge(self, overrides: ChatHandlers) -> Self {
        Self {
            on_user_input: overrides.on_user_input.or(self.on_user_input),
            on_close: overrides.on_close.or(self.on_close),
        }
    }

    pub fn with_on_user_input(
        mut self,
        f: impl Fn(&UserResponse) + Send + Sync + 'static,
    ) -> Self {
        self.on_user_input = Some(Arc::new(f));
        self
    }

    pub fn with_on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ChatHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatHandlers")
            .field("on_user_input", &self.on_user_input.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Values the conversation starts from and returns to on reset
#[derive(Debug, Clone, Default)]
pub struct InitialConfig {
    pub show: bool,
    pub active: bool,
    pub messages: Vec<ChatMessage>,
    pub user_participants: Vec<Participant>,
    pub handlers: ChatHandlers,
}

/// Canonical conversation state
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    /// Whether the conversation is visible
    pub show: bool,
    /// Whether the workflow is currently executing
    pub active: bool,
    /// Messages in display order
    pub messages: Vec<ChatMessage>,
    /// Participants that are humans
    pub user_participants: Vec<Participant>,
    /// The input request awaiting a reply
    pub active_request: Option<ActiveRequest>,
    pub error: Option<ErrorInfo>,
    pub timeline: Option<TimelineData>,
    pub handlers: ChatHandlers,
}

impl ConversationState {
    /// Build the state described by an initial configuration
    pub fn from_initial(initial: &InitialConfig) -> Self {
        Self {
            show: initial.show,
            active: initial.active,
            messages: initial.messages.clone(),
            user_participants: users_only(initial.user_participants.clone()),
            handlers: initial.handlers.clone(),
            ..Default::default()
        }
    }

    /// Find a message by id
    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }
}

/// Keep only participants that are humans
pub fn users_only(participants: Vec<Participant>) -> Vec<Participant> {
    participants.into_iter().filter(|p| p.is_user).collect()
}
