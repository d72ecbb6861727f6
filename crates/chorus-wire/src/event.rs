//! Frame classification and validation
//!
//! [`process`] turns one raw frame into a [`NormalizedEvent`]. Frames that are
//! unparseable or fail validation yield `None`; they are never errors, since
//! the backend is allowed to send shapes this crate does not know about yet.

use serde_json::{Map, Value};

use crate::content::{
    DEFAULT_PROMPT, generate_id, is_password_prompt, normalize_content, normalize_prompt,
    now_timestamp, parse_flag,
};
use crate::error::{Error, Result};
use crate::types::{ChatMessage, Participant, TimelineData, kind};

/// Distinguished frame value signalling the workflow has finished
pub const WORKFLOW_DONE: &str = "<workflow_done>";

/// How many times a string frame is JSON-decoded before giving up
const MAX_DECODE_DEPTH: usize = 2;

/// Check whether a frame is the workflow-done sentinel, raw or JSON-encoded
pub fn is_workflow_done(frame: &Value) -> bool {
    match frame.as_str() {
        Some(WORKFLOW_DONE) => true,
        Some(s) => serde_json::from_str::<String>(s).is_ok_and(|decoded| decoded == WORKFLOW_DONE),
        None => false,
    }
}

/// A normalized message and how it relates to the conversation
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub message: ChatMessage,
    /// Set when the message opens a new input request
    pub request_id: Option<String>,
    /// Set when the message ends the workflow
    pub is_workflow_end: bool,
    /// Set when the message carries the id of the request currently awaiting input
    pub answers_request: bool,
}

impl MessageEvent {
    fn plain(message: ChatMessage) -> Self {
        Self {
            message,
            request_id: None,
            is_workflow_end: false,
            answers_request: false,
        }
    }
}

/// The validated, typed result of interpreting a frame
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Message(MessageEvent),
    Timeline(TimelineData),
    Participants(Vec<Participant>),
    /// A frame with a `type` this crate does not recognize, passed through as-is
    Unrecognized { kind: String, payload: Value },
}

impl NormalizedEvent {
    /// The frame kind this event was built from
    pub fn kind(&self) -> &str {
        match self {
            NormalizedEvent::Message(m) => &m.message.kind,
            NormalizedEvent::Timeline(_) => kind::TIMELINE,
            NormalizedEvent::Participants(_) => kind::PARTICIPANTS,
            NormalizedEvent::Unrecognized { kind, .. } => kind,
        }
    }
}

/// Decode a raw frame into a JSON object with a string `type`
pub fn decode_frame(raw: &Value) -> Result<Map<String, Value>> {
    let mut value = raw.clone();
    for _ in 0..MAX_DECODE_DEPTH {
        match value {
            Value::String(s) => value = serde_json::from_str(&s)?,
            _ => break,
        }
    }

    let Value::Object(frame) = value else {
        return Err(Error::invalid_frame("frame is not an object"));
    };
    if !frame.get("type").is_some_and(Value::is_string) {
        return Err(Error::invalid_frame("frame has no string `type`"));
    }
    Ok(frame)
}

/// Normalize one raw frame.
///
/// `active_request_id` is the id of the request currently awaiting input, if
/// any, and `image_preview_url` the resolved preview for that request.
pub fn process(
    raw: &Value,
    active_request_id: Option<&str>,
    image_preview_url: Option<&str>,
) -> Option<NormalizedEvent> {
    let frame = match decode_frame(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("Dropping frame: {}", e);
            return None;
        }
    };
    let frame_kind = frame.get("type").and_then(Value::as_str).unwrap_or_default();

    let event = match frame_kind {
        kind::TEXT | kind::TOOL_CALL => {
            text_like(frame_kind, &frame, active_request_id, image_preview_url)
        }
        kind::TERMINATION => termination(&frame, image_preview_url),
        kind::INPUT_REQUEST => input_request(&frame, image_preview_url),
        kind::TIMELINE => timeline(&frame).map(NormalizedEvent::Timeline),
        kind::PARTICIPANTS => participants(&frame).map(NormalizedEvent::Participants),
        other => Some(NormalizedEvent::Unrecognized {
            kind: other.to_string(),
            payload: Value::Object(frame.clone()),
        }),
    };

    if event.is_none() {
        tracing::debug!("Rejected invalid `{}` frame", frame_kind);
    }
    event
}

/// The message body of a text-like frame.
///
/// Current backends nest the message under `content`; older ones put
/// `sender`/`recipient`/`content` directly on the frame.
struct Payload<'a> {
    frame: &'a Map<String, Value>,
    inner: Option<&'a Map<String, Value>>,
}

impl<'a> Payload<'a> {
    fn new(frame: &'a Map<String, Value>) -> Self {
        let inner = match frame.get("content") {
            Some(Value::Object(obj))
                if obj.contains_key("sender")
                    || obj.contains_key("recipient")
                    || obj.contains_key("content") =>
            {
                Some(obj)
            }
            _ => None,
        };
        Self { frame, inner }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.inner
            .and_then(|inner| inner.get(key))
            .or_else(|| self.frame.get(key))
    }

    /// The message content, which lives one level down when nested
    fn body(&self) -> Option<&'a Value> {
        let body = match self.inner {
            Some(inner) => inner.get("content"),
            None => self.frame.get("content"),
        };
        body.filter(|v| !v.is_null())
    }

    fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(parse_flag)
    }

    fn message(&self, kind: &str, body: &Value, image_preview_url: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: self.string("id").unwrap_or_else(generate_id),
            timestamp: self.string("timestamp").unwrap_or_else(now_timestamp),
            kind: kind.to_string(),
            sender: self.string("sender"),
            recipient: self.string("recipient"),
            content: normalize_content(body, image_preview_url),
            prompt: None,
            password: None,
            request_id: self.string("request_id"),
        }
    }
}

fn text_like(
    frame_kind: &str,
    frame: &Map<String, Value>,
    active_request_id: Option<&str>,
    image_preview_url: Option<&str>,
) -> Option<NormalizedEvent> {
    let payload = Payload::new(frame);
    payload.string("sender")?;
    payload.string("recipient")?;

    let empty = Value::Null;
    let body = match payload.body() {
        Some(body) => body,
        None if frame_kind == kind::TOOL_CALL => return None,
        None => &empty,
    };

    let message = payload.message(frame_kind, body, image_preview_url);
    let answers_request = active_request_id
        .is_some_and(|active| message.request_id.as_deref() == Some(active));

    Some(NormalizedEvent::Message(MessageEvent {
        is_workflow_end: payload.flag("is_workflow_end"),
        answers_request,
        ..MessageEvent::plain(message)
    }))
}

fn termination(
    frame: &Map<String, Value>,
    image_preview_url: Option<&str>,
) -> Option<NormalizedEvent> {
    let payload = Payload::new(frame);
    let empty = Value::Null;
    let body = payload.body().unwrap_or(&empty);
    let message = payload.message(kind::TERMINATION, body, image_preview_url);
    Some(NormalizedEvent::Message(MessageEvent {
        is_workflow_end: true,
        ..MessageEvent::plain(message)
    }))
}

fn input_request(
    frame: &Map<String, Value>,
    image_preview_url: Option<&str>,
) -> Option<NormalizedEvent> {
    let payload = Payload::new(frame);
    let request_id = payload.string("request_id")?;

    let prompt = payload
        .get("prompt")
        .and_then(Value::as_str)
        .map(normalize_prompt);
    let fallback = Value::String(prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.to_string()));
    let body = payload.body().unwrap_or(&fallback);

    let mut message = payload.message(kind::INPUT_REQUEST, body, image_preview_url);
    message.prompt = prompt;
    message.password = payload.get("password").map(is_password_prompt);

    Some(NormalizedEvent::Message(MessageEvent {
        request_id: Some(request_id),
        ..MessageEvent::plain(message)
    }))
}

fn non_empty_array(obj: &Map<String, Value>, key: &str) -> Option<Vec<Value>> {
    obj.get(key)
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .cloned()
}

fn object(obj: &Map<String, Value>, key: &str) -> Option<Map<String, Value>> {
    obj.get(key).and_then(Value::as_object).cloned()
}

fn timeline(frame: &Map<String, Value>) -> Option<TimelineData> {
    let payload = match frame.get("content") {
        Some(Value::Object(inner)) => inner,
        _ => frame,
    };
    Some(TimelineData {
        timeline: non_empty_array(payload, "timeline")?,
        cost_timeline: non_empty_array(payload, "cost_timeline")?,
        summary: object(payload, "summary")?,
        metadata: object(payload, "metadata")?,
        agents: non_empty_array(payload, "agents")?,
    })
}

fn participant(value: &Value) -> Option<Participant> {
    match value {
        Value::String(name) if !name.is_empty() => Some(Participant::new(name, name, false)),
        Value::Object(obj) => {
            let text = |key: &str| {
                obj.get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let name = text("name").or_else(|| text("id"))?;
            let id = text("id").unwrap_or_else(|| name.clone());
            let is_user = obj
                .get("isUser")
                .or_else(|| obj.get("is_user"))
                .is_some_and(parse_flag);
            Some(Participant { id, name, is_user })
        }
        _ => None,
    }
}

fn participants(frame: &Map<String, Value>) -> Option<Vec<Participant>> {
    let list = frame
        .get("participants")
        .or_else(|| match frame.get("content") {
            Some(Value::Object(inner)) => inner.get("participants"),
            Some(list @ Value::Array(_)) => Some(list),
            _ => None,
        })?
        .as_array()?;
    Some(list.iter().filter_map(participant).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentPart;
    use serde_json::json;

    fn message(event: Option<NormalizedEvent>) -> MessageEvent {
        match event {
            Some(NormalizedEvent::Message(m)) => m,
            other => panic!("expected message event, got {:?}", other),
        }
    }

    fn timeline_frame() -> Value {
        json!({
            "type": "timeline",
            "content": {
                "timeline": [{"id": "s1", "agent": "planner", "start": 0.0, "end": 1.5}],
                "cost_timeline": [{"time": 1.5, "cumulative_cost": 0.002}],
                "summary": {"total_sessions": 1, "total_cost": 0.002},
                "metadata": {"generated_at": "2025-01-01T00:00:00Z"},
                "agents": [{"name": "planner", "class": "assistant", "color": "#aa0000"}]
            }
        })
    }

    // --- decoding ---

    #[test]
    fn test_string_frame_is_decoded() {
        let raw = json!(r#"{"type":"text","content":{"sender":"a","recipient":"b","content":"hi"}}"#);
        let event = message(process(&raw, None, None));
        assert_eq!(event.message.text_content(), "hi");
    }

    #[test]
    fn test_non_object_frames_rejected() {
        assert!(process(&json!(42), None, None).is_none());
        assert!(process(&json!("not json at all"), None, None).is_none());
        assert!(process(&json!([1, 2]), None, None).is_none());
        assert!(process(&json!({"content": "no type"}), None, None).is_none());
    }

    #[test]
    fn test_decode_frame_reports_syntax_errors() {
        let err = decode_frame(&json!("{broken")).unwrap_err();
        assert!(err.is_syntax());
    }

    // --- text-like frames ---

    #[test]
    fn test_text_frame_yields_one_message() {
        let raw = json!({
            "type": "text",
            "content": {
                "id": "m-1",
                "timestamp": "2025-01-01T00:00:00Z",
                "sender": "assistant",
                "recipient": "user",
                "content": [{"type": "text", "text": "Hello"}]
            }
        });
        let event = message(process(&raw, None, None));
        assert_eq!(event.message.id, "m-1");
        assert_eq!(event.message.timestamp, "2025-01-01T00:00:00Z");
        assert_eq!(event.message.sender.as_deref(), Some("assistant"));
        assert_eq!(event.message.recipient.as_deref(), Some("user"));
        assert_eq!(event.message.content, vec![ContentPart::text("Hello")]);
        assert!(event.request_id.is_none());
        assert!(!event.is_workflow_end);
    }

    #[test]
    fn test_missing_sender_or_recipient_rejected() {
        let no_sender = json!({"type": "text", "content": {"recipient": "user", "content": "x"}});
        let no_recipient = json!({"type": "text", "content": {"sender": "a", "content": "x"}});
        assert!(process(&no_sender, None, None).is_none());
        assert!(process(&no_recipient, None, None).is_none());
    }

    #[test]
    fn test_id_and_timestamp_backfilled() {
        let raw = json!({"type": "text", "content": {"sender": "a", "recipient": "b", "content": "x"}});
        let first = message(process(&raw, None, None));
        let second = message(process(&raw, None, None));
        assert!(!first.message.id.is_empty());
        assert!(!first.message.timestamp.is_empty());
        assert_ne!(first.message.id, second.message.id);
    }

    #[test]
    fn test_legacy_flat_frame_accepted() {
        let raw = json!({"type": "text", "sender": "a", "recipient": "b", "content": "flat"});
        let event = message(process(&raw, None, None));
        assert_eq!(event.message.text_content(), "flat");
        assert_eq!(event.message.sender.as_deref(), Some("a"));
    }

    #[test]
    fn test_tool_call_requires_content() {
        let without = json!({"type": "tool_call", "content": {"sender": "a", "recipient": "b"}});
        assert!(process(&without, None, None).is_none());

        let with = json!({
            "type": "tool_call",
            "content": {"sender": "a", "recipient": "b", "content": {"type": "text", "text": "search()"}}
        });
        let event = message(process(&with, None, None));
        assert_eq!(event.message.kind, "tool_call");
        assert_eq!(event.message.content.len(), 1);
    }

    #[test]
    fn test_text_with_image_preview() {
        let raw = json!({"type": "text", "content": {"sender": "user", "recipient": "a", "content": "<img cat.png>"}});
        let event = message(process(&raw, Some("req-1"), Some("blob:cat")));
        assert_eq!(event.message.content, vec![ContentPart::image("blob:cat", "cat.png")]);
    }

    #[test]
    fn test_reply_to_active_request_flagged() {
        let raw = json!({
            "type": "text",
            "content": {"sender": "user", "recipient": "a", "content": "42", "request_id": "req-1"}
        });
        assert!(message(process(&raw, Some("req-1"), None)).answers_request);
        assert!(!message(process(&raw, Some("req-2"), None)).answers_request);
        assert!(!message(process(&raw, None, None)).answers_request);
    }

    #[test]
    fn test_workflow_end_flag_and_termination() {
        let flagged = json!({
            "type": "text",
            "is_workflow_end": true,
            "content": {"sender": "a", "recipient": "b", "content": "bye"}
        });
        assert!(message(process(&flagged, None, None)).is_workflow_end);

        let termination = json!({"type": "termination", "content": "Workflow finished"});
        let event = message(process(&termination, None, None));
        assert!(event.is_workflow_end);
        assert_eq!(event.message.text_content(), "Workflow finished");
    }

    // --- input requests ---

    #[test]
    fn test_input_request_carries_prompt_and_password() {
        let raw = json!({
            "type": "input_request",
            "request_id": "req-7",
            "prompt": "API key?",
            "password": "TRUE"
        });
        let event = message(process(&raw, None, None));
        assert_eq!(event.request_id.as_deref(), Some("req-7"));
        assert_eq!(event.message.request_id.as_deref(), Some("req-7"));
        assert_eq!(event.message.prompt.as_deref(), Some("API key?"));
        assert_eq!(event.message.password, Some(true));
        assert_eq!(event.message.text_content(), "API key?");
    }

    #[test]
    fn test_input_request_placeholder_prompt_normalized() {
        let raw = json!({"type": "input_request", "request_id": "r", "prompt": ">", "password": "maybe"});
        let event = message(process(&raw, None, None));
        assert_eq!(event.message.prompt.as_deref(), Some(DEFAULT_PROMPT));
        assert_eq!(event.message.password, Some(false));
    }

    #[test]
    fn test_input_request_without_id_rejected() {
        let raw = json!({"type": "input_request", "prompt": "name?"});
        assert!(process(&raw, None, None).is_none());
    }

    // --- timeline ---

    #[test]
    fn test_timeline_accepted_verbatim() {
        let raw = timeline_frame();
        let Some(NormalizedEvent::Timeline(data)) = process(&raw, None, None) else {
            panic!("expected timeline");
        };
        assert_eq!(serde_json::to_value(&data).unwrap(), raw["content"]);
    }

    #[test]
    fn test_timeline_rejected_when_requirement_missing() {
        for key in ["timeline", "cost_timeline", "agents"] {
            let mut raw = timeline_frame();
            raw["content"][key] = json!([]);
            assert!(process(&raw, None, None).is_none(), "empty {} accepted", key);
        }
        for key in ["summary", "metadata"] {
            let mut raw = timeline_frame();
            raw["content"][key] = Value::Null;
            assert!(process(&raw, None, None).is_none(), "null {} accepted", key);
            raw["content"].as_object_mut().unwrap().remove(key);
            assert!(process(&raw, None, None).is_none(), "missing {} accepted", key);
        }
    }

    // --- participants ---

    #[test]
    fn test_participants_shapes() {
        let top = json!({
            "type": "participants",
            "participants": [
                {"id": "u1", "name": "Alice", "isUser": true},
                {"name": "planner", "is_user": "false"},
                "critic",
                17
            ]
        });
        let Some(NormalizedEvent::Participants(list)) = process(&top, None, None) else {
            panic!("expected participants");
        };
        assert_eq!(
            list,
            vec![
                Participant::new("u1", "Alice", true),
                Participant::new("planner", "planner", false),
                Participant::new("critic", "critic", false),
            ]
        );

        let nested = json!({"type": "participants", "content": {"participants": [{"name": "Bob", "isUser": "true"}]}});
        let Some(NormalizedEvent::Participants(list)) = process(&nested, None, None) else {
            panic!("expected participants");
        };
        assert!(list[0].is_user);
    }

    // --- pass-through ---

    #[test]
    fn test_unknown_type_passes_through() {
        let raw = json!({"type": "usage_summary", "tokens": 10});
        let event = process(&raw, None, None).unwrap();
        assert_eq!(event.kind(), "usage_summary");
        let NormalizedEvent::Unrecognized { payload, .. } = event else {
            panic!("expected pass-through");
        };
        assert_eq!(payload, raw);
    }

    #[test]
    fn test_sentinel_detection() {
        assert!(is_workflow_done(&json!(WORKFLOW_DONE)));
        assert!(is_workflow_done(&json!("\"<workflow_done>\"")));
        assert!(!is_workflow_done(&json!({"type": WORKFLOW_DONE})));
        assert!(!is_workflow_done(&json!("done")));
    }
}
