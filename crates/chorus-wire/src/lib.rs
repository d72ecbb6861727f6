//! chorus-wire: wire types and frame normalization
//!
//! This crate turns raw frames from an agent-execution backend into typed,
//! validated events. It has no I/O and no state of its own.

pub mod content;
pub mod error;
pub mod event;
pub mod types;

pub use content::{DEFAULT_PROMPT, generate_id, now_timestamp};
pub use error::{Error, Result};
pub use event::{
    MessageEvent, NormalizedEvent, WORKFLOW_DONE, decode_frame, is_workflow_done, process,
};
pub use types::*;
