//! Real-time events — types and the per-session publish/subscribe hub.

pub mod hub;
pub mod types;

pub use hub::{EventHub, SharedEventHub, DEFAULT_CAPACITY};
pub use types::SessionEvent;
