//! Messaging facade: one conversation fed by one transport.
//!
//! The facade owns the [`Conversation`] and is driven from a single task by
//! awaiting [`Messaging::next_frame`]. Outbound actions go straight to the
//! transport.

use chorus_wire::{ChatMessage, Participant};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use crate::conversation::{ConversationState, ErrorCode, ErrorInfo, UserResponse};
use crate::events::ConversationEvent;
use crate::machine::{Conversation, ConversationConfig};
use crate::steps::{DEFAULT_MAX_STEPS, StepEvent, StepLog};
use crate::transport::{
    ConnectionState, InboundFrame, SocketTransport, Transport, TransportConfig,
};

/// Where the frame applied by [`Messaging::next_frame`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Conversation,
    Step,
    /// A transport failure was recorded in the conversation error
    TransportError,
}

struct StepChannel<T> {
    transport: T,
    log: StepLog,
    open: bool,
}

enum Received {
    Conversation(Option<InboundFrame>),
    Step(Option<InboundFrame>),
    TransportError(Option<String>),
}

/// Conversation plus the transport(s) feeding it
pub struct Messaging<T: Transport = SocketTransport> {
    transport: T,
    conversation: Conversation,
    steps: Option<StepChannel<T>>,
    transport_errors: Option<mpsc::UnboundedReceiver<String>>,
    errors_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Messaging<SocketTransport> {
    /// Connect to the conversation endpoint.
    ///
    /// Transport failures are forwarded to any `on_error` already set on
    /// `transport` and recorded as `TRANSPORT_ERROR` in the conversation.
    pub fn connect(transport: TransportConfig, config: ConversationConfig) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let mut messaging = Self::new(
            SocketTransport::connect(forward_errors(transport, errors_tx.clone(), "")),
            config,
        );
        messaging.transport_errors = Some(errors_rx);
        messaging.errors_tx = Some(errors_tx);
        messaging
    }

    /// Connect a step-execution channel with the default log size.
    ///
    /// Its failures are recorded as `TRANSPORT_ERROR` too, prefixed with
    /// `step channel: `.
    pub fn connect_steps(mut self, transport: TransportConfig) -> Self {
        let errors_tx = match &self.errors_tx {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.transport_errors = Some(rx);
                self.errors_tx = Some(tx.clone());
                tx
            }
        };
        let transport = forward_errors(transport, errors_tx, "step channel: ");
        self.with_steps(SocketTransport::connect(transport), DEFAULT_MAX_STEPS)
    }
}

impl<T: Transport> Messaging<T> {
    pub fn new(transport: T, config: ConversationConfig) -> Self {
        Self {
            transport,
            conversation: Conversation::new(config),
            steps: None,
            transport_errors: None,
            errors_tx: None,
        }
    }

    /// Attach a step-execution channel
    pub fn with_steps(mut self, transport: T, max_steps: usize) -> Self {
        self.steps = Some(StepChannel {
            transport,
            log: StepLog::new(max_steps),
            open: true,
        });
        self
    }

    /// Apply one raw frame to the conversation
    pub fn process(&mut self, frame: &Value) {
        self.conversation.process(frame);
    }

    /// Apply one frame as delivered by the transport
    pub fn handle_inbound(&mut self, frame: InboundFrame) {
        self.process(&frame.into_value());
    }

    /// Wait for the next frame from any channel and apply it.
    ///
    /// Returns `None` once the conversation transport stops delivering.
    pub async fn next_frame(&mut self) -> Option<Delivery> {
        loop {
            let received = {
                let steps = self.steps.as_mut().filter(|s| s.open);
                let errors = self.transport_errors.as_mut();
                tokio::select! {
                    frame = self.transport.recv() => Received::Conversation(frame),
                    frame = step_frame(steps) => Received::Step(frame),
                    message = transport_error(errors) => Received::TransportError(message),
                }
            };

            match received {
                Received::Conversation(Some(frame)) => {
                    self.handle_inbound(frame);
                    return Some(Delivery::Conversation);
                }
                Received::Conversation(None) => {
                    self.drain_transport_errors();
                    return None;
                }
                Received::Step(Some(frame)) => {
                    if let Some(steps) = self.steps.as_mut() {
                        steps.log.process(&frame.into_value());
                    }
                    return Some(Delivery::Step);
                }
                Received::Step(None) => {
                    tracing::debug!("Step channel stopped delivering");
                    if let Some(steps) = self.steps.as_mut() {
                        steps.open = false;
                    }
                }
                Received::TransportError(Some(message)) => {
                    self.record_transport_error(message);
                    return Some(Delivery::TransportError);
                }
                Received::TransportError(None) => self.transport_errors = None,
            }
        }
    }

    fn record_transport_error(&mut self, message: String) {
        self.conversation
            .set_error(Some(ErrorInfo::new(ErrorCode::TransportError, message)));
    }

    fn drain_transport_errors(&mut self) {
        let mut latest = None;
        if let Some(errors) = self.transport_errors.as_mut() {
            while let Ok(message) = errors.try_recv() {
                latest = Some(message);
            }
        }
        if let Some(message) = latest {
            self.record_transport_error(message);
        }
    }

    /// Send an arbitrary frame
    pub fn send(&self, frame: &Value) {
        self.transport.send(frame);
    }

    /// Answer the active input request.
    ///
    /// Returns `None` and sends nothing if no request is awaiting input.
    pub fn respond(&mut self, data: impl Into<String>) -> Option<UserResponse> {
        let Some(request) = self.conversation.active_request() else {
            tracing::warn!("No input request is awaiting a response");
            return None;
        };
        let response = UserResponse {
            request_id: request.request_id.clone(),
            data: data.into(),
        };

        self.transport.send(&json!({
            "type": "input_response",
            "request_id": response.request_id,
            "data": response.data,
        }));
        self.conversation.set_active_request(None);
        if let Some(on_user_input) = self.conversation.handlers().on_user_input.clone() {
            on_user_input(&response);
        }
        Some(response)
    }

    /// Ask the backend to run a workflow and mark the conversation active
    pub fn start_workflow(&mut self, workflow: &Value) {
        self.transport.send(&json!({"type": "start", "workflow": workflow}));
        self.conversation.set_active(true);
    }

    /// Stop all channels, hide the conversation and notify `on_close`
    pub fn close(&mut self) {
        self.disconnect();
        self.conversation.set_active(false);
        self.conversation.set_show(false);
        if let Some(on_close) = self.conversation.handlers().on_close.clone() {
            on_close();
        }
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    /// Replace the socket(s). Conversation state is kept.
    pub fn reconnect(&mut self) {
        self.transport.reconnect();
        if let Some(steps) = self.steps.as_mut() {
            steps.transport.reconnect();
            steps.open = true;
        }
    }

    /// Stop delivery. Applied state is kept.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        if let Some(steps) = self.steps.as_mut() {
            steps.transport.disconnect();
        }
    }

    pub fn add_message(&mut self, message: ChatMessage) -> bool {
        self.conversation.add_message(message)
    }

    pub fn remove_message(&mut self, id: &str) -> Option<ChatMessage> {
        self.conversation.remove_message(id)
    }

    pub fn clear_messages(&mut self) {
        self.conversation.clear_messages();
    }

    pub fn set_messages(&mut self, messages: Vec<ChatMessage>) {
        self.conversation.set_messages(messages);
    }

    pub fn set_participants(&mut self, participants: Vec<Participant>) {
        self.conversation.set_participants(participants);
    }

    pub fn set_show(&mut self, show: bool) {
        self.conversation.set_show(show);
    }

    pub fn set_active(&mut self, active: bool) {
        self.conversation.set_active(active);
    }

    pub fn clear_error(&mut self) {
        self.conversation.set_error(None);
    }

    /// Restore the initial configuration and empty the step log
    pub fn reset(&mut self) {
        self.conversation.reset();
        if let Some(steps) = self.steps.as_mut() {
            steps.log.clear();
        }
    }

    pub fn state(&self) -> &ConversationState {
        self.conversation.state()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.conversation.subscribe()
    }

    pub fn steps(&self) -> Option<&StepLog> {
        self.steps.as_ref().map(|s| &s.log)
    }

    pub fn subscribe_steps(&self) -> Option<broadcast::Receiver<StepEvent>> {
        self.steps.as_ref().map(|s| s.log.subscribe())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Chain a forwarding sender onto the transport's error callback
fn forward_errors(
    mut config: TransportConfig,
    errors: mpsc::UnboundedSender<String>,
    prefix: &'static str,
) -> TransportConfig {
    let inner = config.on_error.take();
    config.with_on_error(move |e| {
        if let Some(inner) = &inner {
            inner(e);
        }
        let _ = errors.send(format!("{}{}", prefix, e));
    })
}

async fn step_frame<T: Transport>(steps: Option<&mut StepChannel<T>>) -> Option<InboundFrame> {
    match steps {
        Some(steps) => steps.transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn transport_error(errors: Option<&mut mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match errors {
        Some(errors) => errors.recv().await,
        None => std::future::pending().await,
    }
}
