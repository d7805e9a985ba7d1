//! Persistent state — domain types, schema, and the SQLite-backed store.

pub mod schema;
pub mod store;
pub mod types;

pub use store::{SessionStore, SharedSessionStore, StoreError, StoreResult};
pub use types::{
    ConfiguredModel, FeedbackRound, Message, MessageRole, PersonaConfig, Provider,
    ReviewerConfig, ReviewerSummary, RunMode, Session, SessionStatus, StopReason, UserSettings,
    CREATOR_AUTHOR, USER_AUTHOR,
};
