//! chorus-session: live conversation state over a reconnecting socket
//!
//! This crate applies normalized frames to a de-duplicated conversation,
//! correlates input requests with their responses, and keeps a websocket to
//! the backend alive across drops.

pub mod conversation;
pub mod dedup;
pub mod error;
pub mod events;
pub mod handle;
pub mod machine;
pub mod messaging;
pub mod steps;
pub mod transport;

pub use conversation::{
    ChatHandlers, ConversationState, ErrorCode, ErrorInfo, InitialConfig, UserResponse,
};
pub use dedup::{DedupCache, DedupConfig};
pub use error::{Error, Result};
pub use events::ConversationEvent;
pub use handle::TransportHandle;
pub use machine::{Conversation, ConversationConfig, Preprocessed};
pub use messaging::{Delivery, Messaging};
pub use steps::{Step, StepEvent, StepLog};
pub use transport::{
    ConnectionState, InboundFrame, RetryConfig, SocketTransport, Transport, TransportConfig,
};
