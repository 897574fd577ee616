//! Cross-context envelope protocol and dispatch.
//!
//! Execution contexts talk to the resilience layer through typed
//! envelopes rather than direct calls, so a coordinator process can sit
//! between them. This module provides:
//! - The envelope and event-kind types
//! - Length-prefixed framing for stream transports
//! - The dispatcher mapping envelopes onto client operations

mod dispatch;
mod protocol;

pub use dispatch::Dispatcher;
pub use protocol::{read_frame, write_frame, Envelope, EventKind, MAX_FRAME_BYTES};
