//! Step-execution channel: a bounded, de-duplicated log of step frames.

use std::collections::VecDeque;

use chorus_wire::{decode_frame, generate_id, is_workflow_done, now_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::dedup::DedupCache;

/// Default number of steps kept
pub const DEFAULT_MAX_STEPS: usize = 500;

/// One step frame as received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    /// The decoded frame, untouched
    pub payload: Value,
}

/// Step log change notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    Added { step: Step },
    /// The workflow-done sentinel arrived on the step channel
    Finished,
    Cleared,
}

/// Bounded log of execution steps, oldest evicted first
pub struct StepLog {
    steps: VecDeque<Step>,
    seen: DedupCache,
    max_steps: usize,
    active: bool,
    event_tx: broadcast::Sender<StepEvent>,
}

impl Default for StepLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl StepLog {
    pub fn new(max_steps: usize) -> Self {
        let max_steps = max_steps.max(1);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            steps: VecDeque::new(),
            seen: DedupCache::new(max_steps),
            max_steps,
            active: false,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.event_tx.subscribe()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether steps have arrived since the last sentinel
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record one step frame. Returns `true` if a step was added.
    pub fn process(&mut self, raw: &Value) -> bool {
        if is_workflow_done(raw) {
            self.active = false;
            let _ = self.event_tx.send(StepEvent::Finished);
            return false;
        }

        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Dropping step frame: {}", e);
                return false;
            }
        };

        let id = frame_id(&frame);
        let key = match &id {
            Some(id) => id.clone(),
            None => Value::Object(frame.clone()).to_string(),
        };
        if !self.seen.insert(key) {
            tracing::debug!("Suppressed duplicate step frame");
            return false;
        }

        let step = Step {
            id: id.unwrap_or_else(generate_id),
            kind: frame
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            timestamp: frame
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(now_timestamp),
            payload: Value::Object(frame),
        };

        self.active = true;
        self.steps.push_back(step.clone());
        while self.steps.len() > self.max_steps {
            self.steps.pop_front();
        }
        let _ = self.event_tx.send(StepEvent::Added { step });
        true
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.seen.clear();
        self.active = false;
        let _ = self.event_tx.send(StepEvent::Cleared);
    }
}

fn frame_id(frame: &Map<String, Value>) -> Option<String> {
    let id = frame.get("id").or_else(|| match frame.get("content") {
        Some(Value::Object(inner)) => inner.get("id"),
        _ => None,
    })?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_wire::WORKFLOW_DONE;
    use serde_json::json;

    #[test]
    fn test_steps_recorded_in_order() {
        let mut log = StepLog::default();
        assert!(log.process(&json!({"type": "step_start", "id": "s1"})));
        assert!(log.process(&json!(r#"{"type":"step_end","content":{"id":"s2"}}"#)));
        let ids: Vec<_> = log.steps().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(log.steps().nth(1).unwrap().kind, "step_end");
        assert!(log.is_active());
    }

    #[test]
    fn test_duplicate_steps_suppressed() {
        let mut log = StepLog::default();
        assert!(log.process(&json!({"type": "step", "id": "s1"})));
        assert!(!log.process(&json!({"type": "step", "id": "s1"})));
        // Frames without an id are keyed by their contents
        assert!(log.process(&json!({"type": "step", "n": 1})));
        assert!(!log.process(&json!({"type": "step", "n": 1})));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut log = StepLog::new(3);
        for i in 0..5 {
            log.process(&json!({"type": "step", "id": format!("s{}", i)}));
        }
        let ids: Vec<_> = log.steps().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["s2", "s3", "s4"]);
    }

    #[test]
    fn test_sentinel_and_invalid_frames() {
        let mut log = StepLog::default();
        let mut events = log.subscribe();
        log.process(&json!({"type": "step", "id": "s1"}));
        assert!(!log.process(&json!("{broken")));
        assert!(!log.process(&json!(WORKFLOW_DONE)));
        assert!(!log.is_active());
        assert_eq!(log.len(), 1);

        assert!(matches!(events.try_recv().unwrap(), StepEvent::Added { .. }));
        assert!(matches!(events.try_recv().unwrap(), StepEvent::Finished));
    }

    #[test]
    fn test_clear_forgets_seen_steps() {
        let mut log = StepLog::default();
        log.process(&json!({"type": "step", "id": "s1"}));
        log.clear();
        assert!(log.is_empty());
        assert!(log.process(&json!({"type": "step", "id": "s1"})));
    }
}
