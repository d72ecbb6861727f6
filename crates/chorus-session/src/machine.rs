//! The conversation state machine.
//!
//! Frames go in through [`Conversation::process`]; every resulting change is
//! published as a [`ConversationEvent`]. Nothing here awaits, so the owner
//! can drive it from whatever task receives the frames.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chorus_wire::{
    ActiveRequest, ChatMessage, MessageEvent, NormalizedEvent, Participant, TimelineData,
    is_workflow_done,
};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::conversation::{
    ChatHandlers, ConversationState, ErrorInfo, InitialConfig, users_only,
};
use crate::dedup::{DedupCache, DedupConfig};
use crate::error::{Error, Result};
use crate::events::ConversationEvent;

/// Capacity of the change-notification channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of the preprocess hook
#[derive(Debug, Clone, PartialEq)]
pub enum Preprocessed {
    /// The hook consumed the frame; nothing further happens
    Handled,
    /// Normalize this frame instead of the original
    Replace(Value),
    /// Normalize the original frame
    Continue,
}

/// Inspects a raw frame before normalization
pub type PreprocessFn = Arc<dyn Fn(&Value) -> Result<Preprocessed> + Send + Sync>;

/// Resolves the image preview URL for a request id
pub type PreviewFn = Arc<dyn Fn(&str) -> Result<Option<String>> + Send + Sync>;

/// Everything a [`Conversation`] is built from
#[derive(Clone, Default)]
pub struct ConversationConfig {
    pub initial: InitialConfig,
    /// Handlers layered over `initial.handlers`
    pub handlers: ChatHandlers,
    pub preprocess: Option<PreprocessFn>,
    pub on_preview: Option<PreviewFn>,
    pub deduplication: DedupConfig,
}

impl ConversationConfig {
    pub fn new(initial: InitialConfig) -> Self {
        Self {
            initial,
            ..Default::default()
        }
    }

    pub fn with_handlers(mut self, handlers: ChatHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_preprocess(
        mut self,
        f: impl Fn(&Value) -> Result<Preprocessed> + Send + Sync + 'static,
    ) -> Self {
        self.preprocess = Some(Arc::new(f));
        self
    }

    pub fn with_preview(
        mut self,
        f: impl Fn(&str) -> Result<Option<String>> + Send + Sync + 'static,
    ) -> Self {
        self.on_preview = Some(Arc::new(f));
        self
    }

    pub fn with_deduplication(mut self, deduplication: DedupConfig) -> Self {
        self.deduplication = deduplication;
        self
    }
}

impl fmt::Debug for ConversationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationConfig")
            .field("initial", &self.initial)
            .field("handlers", &self.handlers)
            .field("preprocess", &self.preprocess.is_some())
            .field("on_preview", &self.on_preview.is_some())
            .field("deduplication", &self.deduplication)
            .finish()
    }
}

/// Owns the conversation state and the dedup cache
pub struct Conversation {
    initial: InitialConfig,
    state: ConversationState,
    dedup: DedupConfig,
    cache: DedupCache,
    preprocess: Option<PreprocessFn>,
    on_preview: Option<PreviewFn>,
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}

impl Conversation {
    pub fn new(config: ConversationConfig) -> Self {
        let ConversationConfig {
            mut initial,
            handlers,
            preprocess,
            on_preview,
            deduplication,
        } = config;
        initial.handlers = initial.handlers.merge(handlers);

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: ConversationState::from_initial(&initial),
            cache: DedupCache::new(deduplication.max_cache_size),
            initial,
            dedup: deduplication,
            preprocess,
            on_preview,
            event_tx,
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.state.messages
    }

    pub fn handlers(&self) -> &ChatHandlers {
        &self.state.handlers
    }

    pub fn active_request(&self) -> Option<&ActiveRequest> {
        self.state.active_request.as_ref()
    }

    pub fn is_duplicate(&self, message: &ChatMessage) -> bool {
        match self.dedup_key(message) {
            Ok(Some(key)) => self.cache.contains(&key),
            _ => false,
        }
    }

    /// Dedup key for a message, or `None` when deduplication is off
    fn dedup_key(&self, message: &ChatMessage) -> Result<Option<String>> {
        if !self.dedup.enabled {
            return Ok(None);
        }
        let dedup = &self.dedup;
        guarded("key_generator", || Ok(dedup.key_for(message))).map(Some)
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Apply one raw frame.
    ///
    /// Failures are stored in `state().error` and never stop later frames.
    pub fn process(&mut self, raw: &Value) {
        if let Err(e) = self.try_process(raw) {
            tracing::warn!("Frame processing failed: {}", e);
            self.set_error(Some(ErrorInfo::processing(e.to_string())));
        }
    }

    /// Like [`process`](Self::process), but hands failures back to the caller
    pub fn try_process(&mut self, raw: &Value) -> Result<()> {
        if is_workflow_done(raw) {
            self.set_active(false);
            return Ok(());
        }

        let frame = match self.preprocess.clone() {
            Some(hook) => match guarded("preprocess", || hook(raw))? {
                Preprocessed::Handled => return Ok(()),
                Preprocessed::Replace(replacement) => Cow::Owned(replacement),
                Preprocessed::Continue => Cow::Borrowed(raw),
            },
            None => Cow::Borrowed(raw),
        };

        let active_id = self
            .state
            .active_request
            .as_ref()
            .map(|r| r.request_id.clone());
        let preview = match (self.on_preview.clone(), active_id.as_deref()) {
            (Some(resolve), Some(id)) => guarded("on_preview", || resolve(id))?,
            _ => None,
        };

        if let Some(event) = chorus_wire::process(&frame, active_id.as_deref(), preview.as_deref())
        {
            self.apply(event)?;
        }
        Ok(())
    }

    /// Apply an already-normalized event.
    ///
    /// Fails only when the dedup key generator does; nothing is changed then.
    pub fn apply(&mut self, event: NormalizedEvent) -> Result<()> {
        match event {
            NormalizedEvent::Message(message) => return self.apply_message(message),
            NormalizedEvent::Timeline(timeline) => self.set_timeline(Some(timeline)),
            NormalizedEvent::Participants(participants) => self.set_participants(participants),
            NormalizedEvent::Unrecognized { kind, payload } => {
                tracing::debug!("Unrecognized frame type `{}`", kind);
                self.emit(ConversationEvent::Unrecognized { kind, payload });
            }
        }
        Ok(())
    }

    fn apply_message(&mut self, event: MessageEvent) -> Result<()> {
        let MessageEvent {
            message,
            request_id,
            is_workflow_end,
            answers_request,
        } = event;

        let key = self.dedup_key(&message)?;
        if answers_request {
            self.set_active_request(None);
        }
        if let Some(request_id) = request_id {
            let request = ActiveRequest::from_message(request_id, &message);
            self.set_active_request(Some(request));
        }
        self.insert_keyed(message, key);
        if is_workflow_end {
            self.set_active(false);
        }
        Ok(())
    }

    /// Append a message unless its dedup key has been seen.
    ///
    /// Returns `false` if the message was suppressed as a duplicate, or if the
    /// key generator failed (recorded as a processing error).
    pub fn add_message(&mut self, message: ChatMessage) -> bool {
        match self.dedup_key(&message) {
            Ok(key) => self.insert_keyed(message, key),
            Err(e) => {
                tracing::warn!("Could not add message {}: {}", message.id, e);
                self.set_error(Some(ErrorInfo::processing(e.to_string())));
                false
            }
        }
    }

    fn insert_keyed(&mut self, message: ChatMessage, key: Option<String>) -> bool {
        if key.is_some_and(|key| !self.cache.insert(key)) {
            tracing::debug!("Suppressed duplicate message {}", message.id);
            return false;
        }
        self.state.messages.push(message.clone());
        self.emit(ConversationEvent::MessageAdded { message });
        true
    }

    /// Remove a message and forget its dedup key
    pub fn remove_message(&mut self, id: &str) -> Option<ChatMessage> {
        let pos = self.state.messages.iter().position(|m| m.id == id)?;
        let message = self.state.messages.remove(pos);
        match self.dedup_key(&message) {
            Ok(Some(key)) => {
                self.cache.remove(&key);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Kept dedup key for removed message {}: {}", id, e),
        }
        self.emit(ConversationEvent::MessageRemoved { id: id.to_string() });
        Some(message)
    }

    /// Drop every message. The dedup cache keeps its keys.
    pub fn clear_messages(&mut self) {
        self.state.messages.clear();
        self.emit(ConversationEvent::MessagesCleared);
    }

    /// Replace the message list. The dedup cache keeps its keys.
    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.state.messages = messages.clone();
        self.emit(ConversationEvent::MessagesReplaced { messages });
    }

    /// Return to the initial configuration and forget all dedup keys
    pub fn reset(&mut self) {
        self.state = ConversationState::from_initial(&self.initial);
        self.cache.clear();
        self.emit(ConversationEvent::Reset);
    }

    pub fn set_active(&mut self, active: bool) {
        self.state.active = active;
        self.emit(ConversationEvent::ActiveChanged { active });
    }

    pub fn set_show(&mut self, show: bool) {
        self.state.show = show;
        self.emit(ConversationEvent::ShowChanged { show });
    }

    pub fn set_error(&mut self, error: Option<ErrorInfo>) {
        self.state.error = error.clone();
        self.emit(ConversationEvent::ErrorChanged { error });
    }

    pub fn set_timeline(&mut self, timeline: Option<TimelineData>) {
        self.state.timeline = timeline.clone();
        self.emit(ConversationEvent::TimelineUpdated { timeline });
    }

    /// Replace the roster, keeping only human participants
    pub fn set_participants(&mut self, participants: Vec<Participant>) {
        let participants = users_only(participants);
        self.state.user_participants = participants.clone();
        self.emit(ConversationEvent::ParticipantsUpdated { participants });
    }

    pub fn set_active_request(&mut self, request: Option<ActiveRequest>) {
        self.state.active_request = request.clone();
        self.emit(ConversationEvent::ActiveRequestChanged { request });
    }
}

/// Run a caller-supplied hook, turning a panic into a hook error
fn guarded<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Error::hook(format!(
            "{} panicked: {}",
            name,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
