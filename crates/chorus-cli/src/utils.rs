//! Shared utilities

use chorus_session::{ConversationEvent, StepEvent};
use chorus_wire::{ChatMessage, ContentPart};
use serde_json::Value;

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Render a message as one log line
pub fn format_message(message: &ChatMessage) -> String {
    let body: Vec<String> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => text.clone(),
            ContentPart::Image { url, alt } => format!("[image {}: {}]", alt, url),
        })
        .collect();
    let route = match (&message.sender, &message.recipient) {
        (Some(sender), Some(recipient)) => format!("{} -> {}", sender, recipient),
        (Some(sender), None) => sender.clone(),
        _ => message.kind.clone(),
    };
    format!("[{}] {}", route, body.join(" "))
}

/// Render a conversation event, or `None` for events not worth printing
pub fn format_event(event: &ConversationEvent) -> Option<String> {
    let line = match event {
        ConversationEvent::MessageAdded { message } => format_message(message),
        ConversationEvent::ActiveRequestChanged {
            request: Some(request),
        } => {
            if request.password {
                format!("? {} (secret input)", request.prompt)
            } else {
                format!("? {}", request.prompt)
            }
        }
        ConversationEvent::TimelineUpdated {
            timeline: Some(timeline),
        } => {
            let cost = timeline
                .summary
                .get("total_cost")
                .and_then(Value::as_f64)
                .map(|c| format!(", ${:.4}", c))
                .unwrap_or_default();
            format!(
                "[timeline: {} spans, {} agents{}]",
                timeline.timeline.len(),
                timeline.agents.len(),
                cost
            )
        }
        ConversationEvent::ParticipantsUpdated { participants } => {
            let names: Vec<_> = participants.iter().map(|p| p.name.as_str()).collect();
            format!("[users: {}]", names.join(", "))
        }
        ConversationEvent::ActiveChanged { active: false } => "[workflow finished]".to_string(),
        ConversationEvent::ActiveChanged { active: true } => "[workflow started]".to_string(),
        ConversationEvent::ErrorChanged { error: Some(error) } => {
            format!("Error ({:?}): {}", error.code, error.message)
        }
        ConversationEvent::Unrecognized { kind, payload } => {
            format!("[{}] {}", kind, truncate_chars(&payload.to_string(), 120))
        }
        _ => return None,
    };
    Some(line)
}

/// Render a step event
pub fn format_step(event: &StepEvent) -> Option<String> {
    match event {
        StepEvent::Added { step } => Some(format!("  step {} ({})", step.id, step.kind)),
        StepEvent::Finished => Some("  steps finished".to_string()),
        StepEvent::Cleared => None,
    }
}

/// Detects the end of a workflow run: `active` going false after it was true
#[derive(Debug, Default)]
pub struct WorkflowWatch {
    seen_active: bool,
}

impl WorkflowWatch {
    pub fn new(active: bool) -> Self {
        Self {
            seen_active: active,
        }
    }

    /// Feed the current `active` flag. Returns `true` once the run has ended.
    pub fn finished(&mut self, active: bool) -> bool {
        if active {
            self.seen_active = true;
            false
        } else {
            self.seen_active
        }
    }
}

/// Interpret workflow file contents: JSON if it parses, otherwise the raw text
pub fn parse_workflow(contents: &str) -> Value {
    serde_json::from_str(contents).unwrap_or_else(|_| Value::String(contents.trim().to_string()))
}
